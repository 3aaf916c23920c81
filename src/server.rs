use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartError},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::task;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

use crate::{
    config::AppConfig,
    error::ServiceError,
    export::export_glb,
    imaging::{decode_upload, write_png},
    model::{GeneratedMesh, HealthResponse, PipelineRegistry, PipelineStatus, PromptRequest},
    store::{AssetKind, AssetStore, StoredAsset},
};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PipelineRegistry>,
    pub store: Arc<AssetStore>,
    pub max_upload_bytes: usize,
}

pub fn build_router(
    config: Arc<AppConfig>,
    registry: Arc<PipelineRegistry>,
    store: Arc<AssetStore>,
) -> Router {
    let state = AppState {
        registry,
        store,
        max_upload_bytes: config.max_upload_bytes,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(health))
        .route("/pipelines", get(pipelines))
        .route("/generate/text-to-3d", post(text_to_3d))
        .route("/generate/image-to-3d", post(image_to_3d))
        .route("/generate/texture", post(texture))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Prompt sent to the texture pipeline for a user prompt.
pub fn texture_prompt(prompt: &str) -> String {
    format!("seamless texture of {prompt}, high resolution, detailed, flat lighting")
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "running",
        gpu: state.registry.accelerator_available(),
    })
}

async fn pipelines(State(state): State<AppState>) -> Json<PipelineStatus> {
    Json(state.registry.status())
}

async fn text_to_3d(
    State(state): State<AppState>,
    Json(request): Json<PromptRequest>,
) -> Result<Response, ServiceError> {
    info!(prompt = %request.prompt, "generating 3D model from text");
    let result = async {
        let mesh = state.registry.text_to_mesh(request.prompt).await?;
        let (asset, bytes) = persist_mesh(&state.store, mesh).await?;
        file_response(&asset, bytes, true)
    }
    .await;
    result.inspect_err(log_failure)
}

async fn image_to_3d(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ServiceError> {
    let result = async {
        let (filename, contents) = read_upload(&mut multipart, state.max_upload_bytes).await?;
        info!(
            filename = filename.as_deref().unwrap_or("<unnamed>"),
            bytes = contents.len(),
            "generating 3D model from image"
        );
        let image = decode_upload(&contents)?;
        let mesh = state.registry.image_to_mesh(image).await?;
        let (asset, bytes) = persist_mesh(&state.store, mesh).await?;
        file_response(&asset, bytes, true)
    }
    .await;
    result.inspect_err(log_failure)
}

async fn texture(
    State(state): State<AppState>,
    Json(request): Json<PromptRequest>,
) -> Result<Response, ServiceError> {
    info!(prompt = %request.prompt, "generating texture");
    let result = async {
        let image = state
            .registry
            .generate_texture(texture_prompt(&request.prompt))
            .await?;

        let store = state.store.clone();
        let (asset, bytes) = task::spawn_blocking(move || {
            let asset = store.allocate(AssetKind::Png);
            write_png(&image, &asset.path)?;
            let bytes = store.read(&asset)?;
            Ok::<_, ServiceError>((asset, bytes))
        })
        .await
        .map_err(|err| ServiceError::Other(format!("texture write task failed: {err}")))??;

        info!(path = %asset.path.display(), "texture written");
        file_response(&asset, bytes, false)
    }
    .await;
    result.inspect_err(log_failure)
}

fn log_failure(err: &ServiceError) {
    error!(error = %err, status = %err.status(), "generation request failed");
}

/// Returns the file name and contents of the `file` field.
async fn read_upload(
    multipart: &mut Multipart,
    limit: usize,
) -> Result<(Option<String>, Bytes), ServiceError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| upload_error(e, limit, "invalid multipart body"))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let contents = field
            .bytes()
            .await
            .map_err(|e| upload_error(e, limit, "failed to read upload"))?;
        return Ok((filename, contents));
    }
    Err(ServiceError::BadRequest("missing multipart field `file`".into()))
}

fn upload_error(err: MultipartError, limit: usize, context: &str) -> ServiceError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServiceError::PayloadTooLarge(limit)
    } else {
        ServiceError::BadRequest(format!("{context}: {err}"))
    }
}

/// Exports `mesh` into a fresh asset and reads the finished file back.
async fn persist_mesh(
    store: &Arc<AssetStore>,
    mesh: GeneratedMesh,
) -> Result<(StoredAsset, Vec<u8>), ServiceError> {
    let store = store.clone();
    task::spawn_blocking(move || {
        let asset = store.allocate(AssetKind::Glb);
        export_glb(&mesh, &asset.path)?;
        let bytes = store.read(&asset)?;
        Ok::<_, ServiceError>((asset, bytes))
    })
    .await
    .map_err(|err| ServiceError::Other(format!("export task failed: {err}")))?
}

fn file_response(
    asset: &StoredAsset,
    bytes: Vec<u8>,
    attachment: bool,
) -> Result<Response, ServiceError> {
    let mut response = (StatusCode::OK, bytes).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(asset.kind.media_type()),
    );
    if attachment {
        let disposition = format!("attachment; filename=\"{}\"", asset.filename());
        let value = HeaderValue::from_str(&disposition)
            .map_err(|e| ServiceError::Other(format!("invalid content disposition: {e}")))?;
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_prompt_uses_fixed_template() {
        assert_eq!(
            texture_prompt("mossy stone"),
            "seamless texture of mossy stone, high resolution, detailed, flat lighting"
        );
    }
}
