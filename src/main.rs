use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use asset_forge_service::{AppConfig, AssetStore, PipelineLoader, PipelineRegistry, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    let store = Arc::new(AssetStore::open(&config.output_dir)?);

    let registry = Arc::new(PipelineRegistry::new(pipeline_loader(&config)));
    tracing::info!(
        gpu = registry.accelerator_available(),
        device = %registry.device(),
        "pipelines load on first use"
    );

    if !config.preload.is_empty() {
        tracing::info!(kinds = ?config.preload, "preloading pipelines");
        registry.warm_up(&config.preload).await?;
    }

    let router = build_router(config.clone(), registry, store);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(feature = "tch-backend")]
fn pipeline_loader(config: &AppConfig) -> Arc<dyn PipelineLoader> {
    Arc::new(asset_forge_service::model::TchPipelineLoader::new(config))
}

#[cfg(not(feature = "tch-backend"))]
fn pipeline_loader(_config: &AppConfig) -> Arc<dyn PipelineLoader> {
    tracing::warn!("built without an inference backend; generation requests will fail");
    Arc::new(asset_forge_service::model::NoBackendLoader)
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
