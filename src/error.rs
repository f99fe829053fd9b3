use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SyncboardError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Message not found: {0}")]
    MessageNotFound(u64),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncboardError>;

impl From<std::io::Error> for SyncboardError {
    fn from(e: std::io::Error) -> Self {
        SyncboardError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncboardError {
    fn from(e: serde_json::Error) -> Self {
        SyncboardError::Json(e.to_string())
    }
}

impl SyncboardError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SyncboardError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            SyncboardError::MessageNotFound(_) => StatusCode::NOT_FOUND,
            SyncboardError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncboardError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncboardError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Axum IntoResponse implementation (feature-gated)
#[cfg(feature = "axum-support")]
use axum::response::{IntoResponse, Json, Response};
#[cfg(feature = "axum-support")]
use serde::Serialize;

#[cfg(feature = "axum-support")]
#[derive(Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub message: String,
}

#[cfg(feature = "axum-support")]
impl IntoResponse for SyncboardError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            status: "error",
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            SyncboardError::MalformedInput("author".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SyncboardError::MessageNotFound(7).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            SyncboardError::Storage("disk full".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: SyncboardError = io.into();
        assert!(matches!(err, SyncboardError::Storage(_)));
        assert!(err.to_string().contains("nope"));
    }
}
