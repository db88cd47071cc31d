use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Error taxonomy for the coordinator boundary (spec §7). Handlers translate
/// every infrastructure failure into one of these kinds before it crosses the
/// request surface; no raw backend error is ever returned to a caller.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    InvariantViolation(String),
    StorageUnavailable(String),
    SubscriberDead(String),
    Timeout(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NotFound(msg) => write!(f, "not found: {}", msg),
            AppError::InvariantViolation(msg) => write!(f, "invariant violation: {}", msg),
            AppError::StorageUnavailable(msg) => write!(f, "storage unavailable: {}", msg),
            AppError::SubscriberDead(msg) => write!(f, "subscriber dead: {}", msg),
            AppError::Timeout(msg) => write!(f, "timeout: {}", msg),
            AppError::Conflict(msg) => write!(f, "conflict: {}", msg),
            AppError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            AppError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::InvariantViolation(msg) => {
                tracing::error!("invariant violation: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
            AppError::StorageUnavailable(msg) => {
                tracing::error!("storage unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable".to_string())
            }
            AppError::SubscriberDead(msg) => (StatusCode::GONE, msg.clone()),
            AppError::Timeout(msg) => (StatusCode::REQUEST_TIMEOUT, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
        };

        let kind = match &self {
            AppError::NotFound(_) => "NotFound",
            AppError::InvariantViolation(_) => "InvariantViolation",
            AppError::StorageUnavailable(_) => "StorageUnavailable",
            AppError::SubscriberDead(_) => "SubscriberDead",
            AppError::Timeout(_) => "Timeout",
            AppError::Conflict(_) => "Conflict",
            AppError::BadRequest(_) => "BadRequest",
            AppError::Internal(_) => "Internal",
        };

        let body = Json(json!({
            "status": "error",
            "kind": kind,
            "message": message,
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("row not found".to_string()),
            other => AppError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
