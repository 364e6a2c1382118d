//! Error types for mtag-tagger
//!
//! Remote failures are classified once, at the network boundary, into a
//! `SubmitErrorKind`. Nothing downstream re-parses status codes or error text.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Structured classification of a failed remote call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitErrorKind {
    /// The item or job does not exist remotely; terminal
    NotFound,
    /// The service asked us to back off. Does not consume retry budget.
    RateLimited {
        /// Server-provided `Retry-After` hint
        retry_after: Option<Duration>,
    },
    /// 5xx-style failure worth retrying
    TransientServer,
    /// The request never got a response (connect, timeout, reset)
    Network,
    /// 2xx response whose body could not be understood
    MalformedResponse,
    /// Any other rejection; terminal
    NonRetryable,
}

impl SubmitErrorKind {
    /// Whether the bounded retry path applies
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitErrorKind::TransientServer | SubmitErrorKind::Network)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitErrorKind::NotFound => "not_found",
            SubmitErrorKind::RateLimited { .. } => "rate_limited",
            SubmitErrorKind::TransientServer => "transient_retryable",
            SubmitErrorKind::Network => "network_error",
            SubmitErrorKind::MalformedResponse => "malformed_response",
            SubmitErrorKind::NonRetryable => "non_retryable_failure",
        }
    }
}

/// Error returned by a `TagService` call
#[derive(Debug, Clone, Error)]
#[error("{} ({})", message, kind.as_str())]
pub struct SubmitError {
    pub kind: SubmitErrorKind,
    pub message: String,
}

impl SubmitError {
    pub fn new(kind: SubmitErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(SubmitErrorKind::Network, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(SubmitErrorKind::MalformedResponse, message)
    }
}

/// Why an item ended up `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The remote side does not know the item
    NotFound,
    /// Rate limited; a background resubmission follows
    RateLimited,
    /// Retry budget used up on transient or network errors
    RetriesExhausted,
    /// Non-retryable rejection from the service
    Rejected,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NotFound => "not_found",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::RetriesExhausted => "retries_exhausted",
            FailureReason::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Request conflicts with work already in progress (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// mtag-common error
    #[error("Common error: {0}")]
    Common(#[from] mtag_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
