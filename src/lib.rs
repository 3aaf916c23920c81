pub mod config;
pub mod error;
pub mod export;
pub mod imaging;
pub mod model;
pub mod server;
pub mod store;

pub use config::AppConfig;
pub use error::ServiceError;
pub use model::{PipelineLoader, PipelineRegistry};
pub use server::build_router;
pub use store::AssetStore;
