/// Unified error types for roster-warden
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the service
#[derive(Error, Debug)]
pub enum WardenError {
    /// Database errors (includes use of a closed store handle, which
    /// surfaces as `sqlx::Error::PoolClosed`)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Transient directory service errors (bad status, wrong content
    /// type, explicit upstream error page)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error response body served by the lookup service
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for WardenError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            WardenError::Validation(_) => {
                (StatusCode::BAD_REQUEST, "InvalidRequest", self.to_string())
            }
            WardenError::Upstream(_) => {
                (StatusCode::BAD_GATEWAY, "UpstreamError", self.to_string())
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "Internal server error".to_string(), // Don't leak details
            ),
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for service operations
pub type WardenResult<T> = Result<T, WardenError>;
