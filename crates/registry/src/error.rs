//! Session registry error types.

use gantry_core::SessionStatus;
use thiserror::Error;

/// Registry operation errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("session is {status}, not accepting chunks")]
    NotAccepting { status: SessionStatus },

    #[error("chunk index {index} out of range (total {total})")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
