use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use roadwatch_pipeline::{ErrorKind, PipelineError};
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("unknown stream {0}")]
    UnknownStream(String),
    #[error("snapshot {0} not found")]
    UnknownSnapshot(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("scan log error: {0}")]
    ScanLog(#[from] rusqlite::Error),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Pipeline(e) => match e {
                PipelineError::SourceUnopenable { missing: true, .. } => StatusCode::NOT_FOUND,
                _ => match e.kind() {
                    ErrorKind::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorKind::InvalidDimensions
                    | ErrorKind::DecodeFailure
                    | ErrorKind::InvalidArgument
                    | ErrorKind::SourceUnopenable => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                },
            },
            ApiError::UnknownStream(_) | ApiError::UnknownSnapshot(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::ScanLog(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Pipeline(e) => e.kind().as_str(),
            ApiError::UnknownStream(_) => "unknown_stream",
            ApiError::UnknownSnapshot(_) => "not_found",
            ApiError::BadRequest(_) => "invalid_argument",
            ApiError::PayloadTooLarge(_) => "payload_too_large",
            ApiError::ScanLog(_) => "scan_log_failure",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(e.body_text())
        } else {
            ApiError::BadRequest(e.body_text())
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("worker task failed: {e}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "request failed");
        }
        let body = json!({ "error": self.kind(), "detail": self.to_string() });
        (status, Json(body)).into_response()
    }
}
