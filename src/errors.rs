use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

use crate::services::blob_store::StoreError;

/// Error response rendered as `{"error": {"title", "message", "details"}}`.
///
/// Handlers return it as the `Err` side of their result so the status line is
/// committed exactly once, before any body is written.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub title: String,
    pub message: String,
    pub details: Map<String, Value>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    error: Body<'a>,
}

#[derive(Serialize)]
struct Body<'a> {
    title: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Map::is_empty")]
    details: &'a Map<String, Value>,
}

impl ApiError {
    /// Create an ApiError with an empty message and no details.
    pub fn new(status: StatusCode, title: impl Into<String>) -> Self {
        Self {
            status,
            title: title.into(),
            message: String::new(),
            details: Map::new(),
        }
    }

    /// Populate `message` from the underlying cause.
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.message = cause.to_string();
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(title: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, title)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(title: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, title)
    }

    /// Shortcut for 415 Unsupported Media Type
    pub fn unsupported_media_type(title: impl Into<String>) -> Self {
        Self::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, title)
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(title: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, title)
    }

    /// A failed blob-store call.
    pub fn operational(err: StoreError) -> Self {
        Self::internal("Operational error").with_cause(err)
    }

    /// Marker for endpoints that are routed but deliberately not implemented.
    pub fn not_implemented() -> Self {
        Self::new(StatusCode::NOT_IMPLEMENTED, "Not implemented")
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.title)
        } else {
            write!(f, "{}: {}", self.title, self.message)
        }
    }
}

impl std::error::Error for ApiError {}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::operational(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), "{}", self);
        }

        let body = Json(Envelope {
            error: Body {
                title: &self.title,
                message: &self.message,
                details: &self.details,
            },
        });

        (self.status, body).into_response()
    }
}
