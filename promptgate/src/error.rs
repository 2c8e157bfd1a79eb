use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

use crate::types::JobId;

/// Result type for governance engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can surface from the governance engine.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The hourly budget is spent. Recoverable: retry after `wait`.
    #[error("rate limit reached, retry in {}s", wait.as_secs())]
    RateLimitExceeded { wait: Duration },

    /// Every eligible attempt against the external tool timed out.
    /// Recoverable: the caller may resubmit.
    #[error("execution timed out after {attempts} attempt(s)")]
    ExecutionTimeout { attempts: u32 },

    /// The external tool failed after exhausting eligible retries.
    #[error("execution failed after {attempts} attempt(s): {message}")]
    ExecutionFailed { message: String, attempts: u32 },

    /// The request was malformed. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unknown job id.
    #[error("job {0} not found")]
    NotFound(JobId),

    /// The cache backend failed. Degraded mode only: the pipeline logs this
    /// and falls through to the executor as if on a miss.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Ledger persistence error. Fatal at startup: the process must not run
    /// with an unreliable budget count.
    #[error("ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    /// Unexpected error with full context chain.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::ExecutionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::ExecutionFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::CacheUnavailable(_) | Error::Ledger(_) | Error::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full details here; the response body stays terse.
        match &self {
            Error::Ledger(_) | Error::Other(_) | Error::CacheUnavailable(_) => {
                tracing::error!("internal error: {:#}", self);
            }
            Error::ExecutionTimeout { .. } | Error::ExecutionFailed { .. } => {
                tracing::warn!("execution error: {}", self);
            }
            Error::RateLimitExceeded { .. } => {
                tracing::info!("request rejected: {}", self);
            }
            Error::InvalidInput(_) | Error::NotFound(_) => {
                tracing::debug!("client error: {}", self);
            }
        }

        let status = self.status_code();
        let mut body = json!({ "error": self.to_string() });
        if let Error::RateLimitExceeded { wait } = &self {
            body["wait_seconds"] = json!(wait.as_secs());
        }

        (status, axum::response::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        let err = Error::RateLimitExceeded {
            wait: Duration::from_secs(30),
        };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);

        assert_eq!(
            Error::InvalidInput("empty prompt".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::NotFound(JobId::new()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::ExecutionTimeout { attempts: 3 }.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
