use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{Map, Value as JsonValue};
use std::fmt::Display;

/// Field-level problem reported back to API callers.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ErrorDetail {
    pub field: String,
    pub error: String,
    pub value: Option<String>,
}

impl ErrorDetail {
    pub fn new(field: impl Into<String>, error: impl Into<String>, value: Option<String>) -> Self {
        Self {
            field: field.into(),
            error: error.into(),
            value,
        }
    }
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub extra: Map<String, JsonValue>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            extra: Map::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Attaches an extra top-level key to the JSON error envelope.
    pub fn with(mut self, key: &str, value: impl serde::Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.extra.insert(key.to_string(), value);
            }
            Err(err) => tracing::warn!(error = %err, key, "failed to serialize error detail"),
        }
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = Map::new();
        body.insert("status".to_string(), JsonValue::from("error"));
        body.insert("message".to_string(), JsonValue::from(self.message));
        body.extend(self.extra);
        (self.status, Json(JsonValue::Object(body))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Logs the cause and hides it from the caller.
pub fn internal_error(err: impl Display) -> AppError {
    tracing::error!(error = %err, "internal error");
    AppError::internal("Internal server error")
}
