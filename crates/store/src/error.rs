//! Blob store error types.

use thiserror::Error;

/// Blob store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid object name: {0}")]
    InvalidName(String),

    #[error("insufficient disk space: need {needed} bytes, {available} available")]
    Exhausted { needed: u64, available: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for blob store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
