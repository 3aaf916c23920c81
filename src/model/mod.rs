#[cfg(feature = "tch-backend")]
mod loader;
mod pipeline;
mod registry;
mod types;

#[cfg(feature = "tch-backend")]
pub use loader::{TchPipelineLoader, select_device};
pub use pipeline::{NoBackendLoader, PipelineLoader, ShapePipeline, TexturePipeline};
pub use registry::PipelineRegistry;
pub use types::{
    ComputeDevice, GeneratedMesh, HealthResponse, MeshLike, PipelineKind, PipelineStatus,
    Precision, PromptRequest, ShapeInput, ShapeOutput, ShapeParams, TextureParams,
};
