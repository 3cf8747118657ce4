//! API error taxonomy and HTTP mapping.
//!
//! Every failure that can surface to an API caller is categorized here. The
//! categorization matters for two consumers:
//!
//! - The HTTP layer maps each kind to a status code (429, 503, 400, 500) and,
//!   for rate limiting, a machine-readable `Retry-After` header.
//! - The circuit breaker only counts *infrastructure* failures toward opening.
//!   Caller mistakes (validation errors) must never open a circuit, and
//!   admission rejections are decided before the handler runs.
//!
//! Webhook delivery exhaustion is deliberately absent: it is logged by the
//! delivery worker and never surfaced to the request that triggered the event.

use std::time::Duration;

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// An error surfaced to an API caller.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The caller exceeded a rate limit. Retriable after `retry_after`.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited {
        /// Time until the current window resets.
        retry_after: Duration,
    },

    /// The circuit for this endpoint is open; the downstream dependency is
    /// unhealthy. Retriable later.
    #[error("service temporarily unavailable: circuit open for {operation}")]
    CircuitOpen { operation: String },

    /// The caller must fix the input. Not retriable.
    #[error("validation error: {0}")]
    Validation(String),

    /// The referenced resource does not exist (or is not the caller's).
    #[error("not found: {0}")]
    NotFound(String),

    /// Handing a job to the queue failed. Infrastructure fault.
    #[error("failed to enqueue job: {0}")]
    EnqueueFailed(String),

    /// Any other internal fault.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Convenience constructor for validation failures.
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(message.into())
    }

    /// Returns true if this failure should count toward opening the circuit
    /// for the operation that produced it.
    ///
    /// Only infrastructure faults qualify. A validation error means the
    /// *caller* is unhealthy, not the downstream dependency.
    pub fn counts_toward_circuit(&self) -> bool {
        matches!(self, ApiError::EnqueueFailed(_) | ApiError::Internal(_))
    }

    /// The stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::EnqueueFailed(_) => "JOB_ENQUEUE_FAILED",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// JSON body returned for every error response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

/// Rounds a duration up to whole seconds for the `Retry-After` header.
///
/// A sub-second remainder must round up: telling a client to retry after
/// 0 seconds when 400ms of the window remain would invite an immediate
/// second rejection.
fn retry_after_seconds(retry_after: Duration) -> u64 {
    let millis = retry_after.as_millis() as u64;
    millis.div_ceil(1000)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::EnqueueFailed(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let retry_after = match &self {
            ApiError::RateLimited { retry_after } => Some(retry_after_seconds(*retry_after)),
            _ => None,
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
                retry_after_seconds: retry_after,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            // Header insertion only fails on non-ASCII values; a decimal
            // integer always parses.
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
