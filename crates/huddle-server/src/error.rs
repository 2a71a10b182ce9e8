//! HTTP error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use huddle_core::DirectoryError;
use huddle_protocol::ROOM_NOT_FOUND;
use thiserror::Error;
use tracing::error;

/// Errors returned by the HTTP routes.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The requested room code is not in the directory.
    #[error("{}", ROOM_NOT_FOUND)]
    RoomNotFound,

    /// The directory failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The server refuses more work.
    #[error("{0}")]
    Unavailable(String),
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::RoomNotFound => StatusCode::NOT_FOUND,
            ApiError::Directory(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            ApiError::Directory(e) => {
                error!(error = %e, "Directory request failed");
                crate::metrics::record_error("directory");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}
