//! Error types for tidings.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Application result type.
pub type AppResult<T> = Result<T, AppError>;

/// Application error type.
#[derive(Debug, Error)]
pub enum AppError {
    // === Client Errors ===
    /// Missing record, or a record owned by someone else.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limited")]
    RateLimited { retry_after: u64 },

    // === Server Errors ===
    #[error("Database error: {0}")]
    Database(String),

    /// Durable-store contention (serialization failure, deadlock).
    #[error("Transient conflict: {0}")]
    TransientConflict(String),

    /// The shared in-memory store could not be reached.
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            // 4xx Client Errors
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 5xx Server Errors
            Self::TransientConflict(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_)
            | Self::CacheUnavailable(_)
            | Self::Config(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error code for API responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Database(_) => "DATABASE_ERROR",
            Self::TransientConflict(_) => "TRANSIENT_CONFLICT",
            Self::CacheUnavailable(_) => "CACHE_UNAVAILABLE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns whether this error should be logged at error level.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Whether retrying the same idempotent write may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientConflict(_))
    }

    /// Classify a raw database error message.
    ///
    /// `PostgreSQL` reports serialization failures as SQLSTATE 40001 and
    /// deadlocks as 40P01; both are safe to retry for idempotent writes.
    #[must_use]
    pub fn from_db_message(message: String) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("40001")
            || lower.contains("40p01")
            || lower.contains("could not serialize")
            || lower.contains("deadlock detected")
        {
            Self::TransientConflict(message)
        } else {
            Self::Database(message)
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        if self.is_server_error() {
            tracing::error!(error = %self, code = code, "Server error occurred");
        } else {
            tracing::debug!(error = %self, code = code, "Client error occurred");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));

        if let Self::RateLimited { retry_after } = self {
            return (
                status,
                [("Retry-After", retry_after.to_string())],
                body,
            )
                .into_response();
        }

        (status, body).into_response()
    }
}

// === From implementations ===

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("Serialization error: {err}"))
    }
}
