//! REST API Error Types
//!
//! Admin and management routes answer errors with the `{success, error}`
//! envelope. The public reader route keeps its own flat error body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::manager::ManagerError;
use crate::reader::ReadError;

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// REST API error that can be returned from handlers
#[derive(Debug)]
pub struct RestError {
    pub status: StatusCode,
    pub error: ApiError,
}

impl RestError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            error: ApiError::new(code, message),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for RestError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.error
        }));
        (self.status, body).into_response()
    }
}

impl From<ManagerError> for RestError {
    fn from(err: ManagerError) -> Self {
        match &err {
            ManagerError::NotFound(_) => RestError::not_found(err.to_string()),
            ManagerError::Invalid { .. } => RestError::bad_request(err.to_string()),
            ManagerError::Store(_) => RestError::internal(err.to_string()),
        }
    }
}

/// Reader error in the public `{error, code, message}` shape
#[derive(Debug)]
pub struct ReaderError(pub ReadError);

impl IntoResponse for ReaderError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
        let body = Json(serde_json::json!({
            "error": self.0.code(),
            "code": self.0.http_status(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<ReadError> for ReaderError {
    fn from(err: ReadError) -> Self {
        ReaderError(err)
    }
}
