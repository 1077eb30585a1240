//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upload handle: {0}")]
    InvalidHandle(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("content signature does not match declared type {declared}")]
    SignatureMismatch { declared: String },

    #[error("invalid chunk size: {size} (must be between {min} and {max})")]
    InvalidChunkSize { size: u64, min: u64, max: u64 },

    #[error("chunk index {index} out of range (total {total})")]
    ChunkIndexOutOfRange { index: u32, total: u32 },

    #[error("session error: {0}")]
    Session(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
