//! Error types for critique-ai
//!
//! `PipelineError` is the library-level error of the orchestrator and its
//! collaborators; `ApiError` is its HTTP rendering.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::Stage;
use crate::providers::ProviderError;

/// Orchestrator error
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed request, rejected before any stage runs
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing credentials or model binding; never retried
    #[error("Configuration error: {0}")]
    FatalConfig(String),

    /// Provider call failed after retry / breaker handling
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A stage failed; terminal for the job
    #[error("Stage {stage} failed: {message}")]
    StageFailed { stage: Stage, message: String },

    /// Requested row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the job's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Next stage could not be enqueued
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    /// Store / serialization failure
    #[error(transparent)]
    Store(#[from] critique_common::Error),
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Store(critique_common::Error::Internal(format!(
            "JSON serialization failed: {}",
            err
        )))
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Store(critique_common::Error::Database(err))
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409) - e.g., cancelling a finished job
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// critique-common error
    #[error("Common error: {0}")]
    Common(#[from] critique_common::Error),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Validation(msg) => ApiError::BadRequest(msg),
            PipelineError::NotFound(msg) => ApiError::NotFound(msg),
            PipelineError::InvalidState(msg) => ApiError::Conflict(msg),
            PipelineError::Store(critique_common::Error::NotFound(msg)) => ApiError::NotFound(msg),
            PipelineError::Store(critique_common::Error::InvalidInput(msg)) => {
                ApiError::BadRequest(msg)
            }
            PipelineError::Store(e) => ApiError::Common(e),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Other(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                err.to_string(),
            ),
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
