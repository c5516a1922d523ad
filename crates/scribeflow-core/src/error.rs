//! Scribeflow Error Definitions
//!
//! Defines error types used throughout the engine.

use thiserror::Error;

use super::JobId;

/// Engine error types
#[derive(Error, Debug)]
pub enum EngineError {
    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Transient backend error: {0}")]
    Transient(String),

    #[error("Backend rejected request: {0}")]
    Rejected(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Engine result type
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Returns true for errors that are likely to clear up on their own.
    ///
    /// Polling absorbs these silently; mutations surface them to the caller
    /// after rollback either way.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}
