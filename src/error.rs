//! Application error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Application error types.
///
/// Cloneable so that a single failed execution can be handed, unchanged,
/// to every subscriber of the batch that issued it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AppError {
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Query too complex: nesting depth {depth} exceeds {max}")]
    QueryTooComplex { depth: usize, max: usize },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Cache inconsistency: {0}")]
    CacheInconsistency(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Transient execution failures that the retry layer may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Timeout(_) | AppError::RateLimited(_) | AppError::ServiceUnavailable(_)
        )
    }

    /// Stable identifier for the error class, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidDescriptor(_) => "invalid_descriptor",
            AppError::QueryTooComplex { .. } => "query_too_complex",
            AppError::InvalidQuery(_) => "invalid_query",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::Timeout(_) => "timeout",
            AppError::RateLimited(_) => "rate_limited",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::CacheInconsistency(_) => "cache_inconsistency",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::InternalError(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidDescriptor(_)
            | AppError::QueryTooComplex { .. }
            | AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidQuery(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::CacheInconsistency(_) | AppError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidRequest(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return AppError::Timeout(Duration::ZERO);
        }
        match err.status() {
            Some(status) => from_status(status.as_u16(), err.to_string()),
            None if err.is_connect() || err.is_request() => {
                AppError::ServiceUnavailable(err.to_string())
            }
            None => AppError::InternalError(err.to_string()),
        }
    }
}

/// Classify an upstream HTTP status into the execution error taxonomy.
pub fn from_status(status: u16, message: String) -> AppError {
    match status {
        401 | 403 => AppError::PermissionDenied(message),
        408 | 504 => AppError::Timeout(Duration::ZERO),
        429 => AppError::RateLimited(message),
        500..=599 => AppError::ServiceUnavailable(message),
        _ => AppError::InvalidQuery(message),
    }
}
