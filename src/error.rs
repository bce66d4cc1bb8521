//! Error types for Guideline Core.
//!
//! Defines a unified error type that maps cleanly to HTTP responses.
//! Only `InvalidInput`, `UnsupportedMediaType`, `ContentTooLarge` and
//! `RegistryUnavailable` ever reach a caller of the check endpoints; the
//! rule, cache and audit variants are absorbed by the engine.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// Unified error type for Guideline Core operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Content too large: {0}")]
    ContentTooLarge(String),

    #[error("Rule registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Rule execution failed: {0}")]
    RuleExecution(String),

    #[error("Verdict cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Audit write failed: {0}")]
    AuditWriteFailed(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "INVALID_INPUT",
            EngineError::UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
            EngineError::ContentTooLarge(_) => "CONTENT_TOO_LARGE",
            EngineError::RegistryUnavailable(_) => "REGISTRY_UNAVAILABLE",
            EngineError::RuleExecution(_) => "RULE_EXECUTION_ERROR",
            EngineError::CacheUnavailable(_) => "CACHE_UNAVAILABLE",
            EngineError::AuditWriteFailed(_) => "AUDIT_WRITE_FAILED",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Database(_) => "DATABASE_ERROR",
            EngineError::Config(_) => "CONFIG_ERROR",
            EngineError::Serialization(_) => "SERIALIZATION_ERROR",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Error response body for API clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message, details) = match &self {
            EngineError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            EngineError::UnsupportedMediaType(msg) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, msg.clone(), None)
            }
            EngineError::ContentTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, msg.clone(), None)
            }
            EngineError::RegistryUnavailable(msg) => {
                tracing::error!(error = %msg, "Rule registry unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "No guideline rule set is available".to_string(),
                    None,
                )
            }
            EngineError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            EngineError::Database(e) => {
                // Log the actual error but don't expose internals
                tracing::error!(error = %e, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_string(),
                    None,
                )
            }
            EngineError::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error".to_string(),
                Some(msg.clone()),
            ),
            EngineError::Serialization(e) => {
                tracing::error!(error = %e, "Serialization error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to encode or decode stored data".to_string(),
                    None,
                )
            }
            EngineError::RuleExecution(msg)
            | EngineError::CacheUnavailable(msg)
            | EngineError::AuditWriteFailed(msg)
            | EngineError::Internal(msg) => {
                tracing::error!(error = %msg, code, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
