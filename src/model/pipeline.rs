use std::sync::Arc;

use image::RgbImage;

use crate::{
    error::ServiceError,
    model::{ComputeDevice, GeneratedMesh, PipelineKind, ShapeInput, ShapeParams, TextureParams},
};

pub trait ShapePipeline: Send + Sync {
    fn generate(
        &self,
        input: &ShapeInput,
        params: &ShapeParams,
    ) -> Result<Vec<GeneratedMesh>, ServiceError>;
}

pub trait TexturePipeline: Send + Sync {
    fn generate(
        &self,
        prompt: &str,
        params: &TextureParams,
    ) -> Result<Vec<RgbImage>, ServiceError>;
}

/// Builds pipelines on demand. Every method may block for a long time.
pub trait PipelineLoader: Send + Sync {
    fn load_shape(&self, kind: PipelineKind) -> Result<Arc<dyn ShapePipeline>, ServiceError>;

    fn load_texture(&self) -> Result<Arc<dyn TexturePipeline>, ServiceError>;

    fn device(&self) -> ComputeDevice;

    fn accelerator_available(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct NoBackendLoader;

impl NoBackendLoader {
    fn unavailable(kind: PipelineKind) -> ServiceError {
        ServiceError::PipelineLoad(format!(
            "{kind}: service was built without an inference backend"
        ))
    }
}

impl PipelineLoader for NoBackendLoader {
    fn load_shape(&self, kind: PipelineKind) -> Result<Arc<dyn ShapePipeline>, ServiceError> {
        Err(Self::unavailable(kind))
    }

    fn load_texture(&self) -> Result<Arc<dyn TexturePipeline>, ServiceError> {
        Err(Self::unavailable(PipelineKind::Texture))
    }

    fn device(&self) -> ComputeDevice {
        ComputeDevice::Cpu
    }

    fn accelerator_available(&self) -> bool {
        false
    }
}
