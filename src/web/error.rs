use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

use crate::error::{RoomError, StorageError};

#[derive(Debug, Error)]
pub enum WebError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Room not found: {0}")]
    RoomNotFound(String),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl From<RoomError> for WebError {
    fn from(err: RoomError) -> Self {
        match err {
            RoomError::InvalidUserName => {
                WebError::BadRequest("Name must not be blank".to_string())
            }
            other => WebError::InternalServerError(other.to_string()),
        }
    }
}

impl From<StorageError> for WebError {
    fn from(err: StorageError) -> Self {
        WebError::InternalServerError(err.to_string())
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            WebError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            WebError::RoomNotFound(key) => {
                (StatusCode::NOT_FOUND, format!("Room {} not found", key))
            }
            WebError::InternalServerError(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

pub type Result<T, E = WebError> = std::result::Result<T, E>;
