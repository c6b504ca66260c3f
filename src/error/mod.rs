use crate::circuit_breaker::CircuitState;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for resilience manager operations
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Resilience manager error types
#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid circuit breaker configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Circuit breaker {0} has been shut down")]
    BreakerShutdown(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResilienceError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ResilienceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ResilienceError::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ResilienceError::NotFound(_) => StatusCode::NOT_FOUND,
            ResilienceError::BreakerShutdown(_) => StatusCode::CONFLICT,
            ResilienceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ResilienceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ResilienceError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ResilienceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ResilienceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

/// Failure of a call made through a circuit breaker.
///
/// The caller's own error is carried untouched in [`ProtectedCallError::Operation`].
#[derive(Error, Debug)]
pub enum ProtectedCallError<E> {
    /// The breaker did not admit the call
    #[error("Circuit breaker {key} rejected call (state {state})")]
    Rejected { key: String, state: CircuitState },

    /// The call exceeded the breaker's timeout
    #[error("Call through circuit breaker {key} timed out after {timeout_ms}ms")]
    Timeout { key: String, timeout_ms: u64 },

    /// The wrapped operation failed
    #[error("{0}")]
    Operation(E),
}

impl<E> ProtectedCallError<E> {
    /// Returns the wrapped operation error, if the operation itself failed
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            ProtectedCallError::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the breaker rejected the call without running it
    pub fn is_rejected(&self) -> bool {
        matches!(self, ProtectedCallError::Rejected { .. })
    }

    /// Whether the call timed out
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtectedCallError::Timeout { .. })
    }
}
