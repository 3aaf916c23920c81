use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),
    #[error("upload exceeds the {0} byte limit")]
    PayloadTooLarge(usize),
    #[error("failed to load pipeline: {0}")]
    PipelineLoad(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("unsupported mesh format: {0}")]
    UnsupportedMeshFormat(String),
    #[error("mesh export failed: {0}")]
    Export(String),
    #[error("image error: {0}")]
    Image(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::PipelineLoad(_)
            | ServiceError::Tokenizer(_)
            | ServiceError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::UnsupportedMeshFormat(_) | ServiceError::Export(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ServiceError::Image(_) | ServiceError::Io(_) | ServiceError::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<image::ImageError> for ServiceError {
    fn from(err: image::ImageError) -> Self {
        ServiceError::Image(err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "detail": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx_and_everything_else_to_500() {
        assert_eq!(
            ServiceError::BadRequest("Empty file received".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::PayloadTooLarge(1024).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ServiceError::UnsupportedMeshFormat("no faces".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServiceError::PipelineLoad("missing weights".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn bad_request_detail_is_the_bare_message() {
        let err = ServiceError::BadRequest("Empty file received".into());
        assert_eq!(err.to_string(), "Empty file received");
    }
}
