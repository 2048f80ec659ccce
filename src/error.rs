//! Unified API error type and HTTP conversions.
//!
//! Every handler failure maps onto one of these variants; the response body
//! is always a JSON `{"error": ...}` object so the management UI can render
//! it directly.

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::io::ErrorKind;

use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized { headers: HeaderMap, message: String },
    NotFound(String),
    PayloadTooLarge(String),
    Conflict(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, headers, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, HeaderMap::new(), msg),
            ApiError::Unauthorized { headers, message } => {
                (StatusCode::UNAUTHORIZED, headers, message)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, HeaderMap::new(), msg),
            ApiError::PayloadTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, HeaderMap::new(), msg)
            }
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, HeaderMap::new(), msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new(), msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), msg),
        };
        (status, headers, Json(json!({ "error": message }))).into_response()
    }
}

impl From<crate::locking::LockTimeout> for ApiError {
    fn from(_: crate::locking::LockTimeout) -> Self {
        ApiError::ServiceUnavailable("path is busy, try again".into())
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}
