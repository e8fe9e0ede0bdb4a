//! Mapping of domain errors onto HTTP responses.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::scheduler::TaskError;

#[derive(Debug)]
pub enum ApiError {
    Task(TaskError),
    /// The request is well-formed but the current state forbids it.
    Conflict { kind: &'static str, message: String },
}

/// Wire form: `{"error": {"kind", "message", "code"}}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
    code: u16,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (status, kind) = self.parts();
        match self {
            ApiError::Task(e) => write!(f, "ApiError({}, {}: {})", status.as_u16(), kind, e),
            ApiError::Conflict { message, .. } => {
                write!(f, "ApiError({}, {}: {})", status.as_u16(), kind, message)
            }
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        ApiError::Task(e)
    }
}

/// Helper for handler-level conflicts that have no `TaskError` counterpart.
pub fn conflict(kind: &'static str, message: impl Into<String>) -> ApiError {
    ApiError::Conflict {
        kind,
        message: message.into(),
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Conflict { kind, .. } => (StatusCode::CONFLICT, *kind),
            ApiError::Task(e) => match e {
                TaskError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
                TaskError::Inactive(_) => (StatusCode::CONFLICT, "inactive"),
                TaskError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
                TaskError::InvalidUpdate(_) => (StatusCode::CONFLICT, "invalid_update"),
                TaskError::NegativeDuration { .. } => (StatusCode::CONFLICT, "negative_duration"),
                TaskError::InvalidCron { .. } => (StatusCode::BAD_REQUEST, "invalid_cron"),
                TaskError::InvalidTimezone(_) => (StatusCode::BAD_REQUEST, "invalid_timezone"),
                TaskError::Duplicate(_) => (StatusCode::BAD_REQUEST, "duplicate"),
                TaskError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
                TaskError::Database(_)
                | TaskError::Pool(_)
                | TaskError::Serialization(_)
                | TaskError::Corrupt(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.parts();
        let message = match &self {
            ApiError::Conflict { message, .. } => message.clone(),
            // Storage internals stay in the log.
            ApiError::Task(e) if status == StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %e, "Request failed");
                "internal error".to_string()
            }
            ApiError::Task(e) => e.to_string(),
        };

        let body = ErrorBody {
            error: ErrorDetail {
                kind,
                message,
                code: status.as_u16(),
            },
        };
        (status, Json(body)).into_response()
    }
}
