//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A rewrite was committed or aborted twice, or used after the
    /// backing store went away.
    #[error("invalid rewrite state: {0}")]
    InvalidRewrite(String),
}

impl StorageError {
    /// Creates an invalid rewrite error.
    pub fn invalid_rewrite(message: impl Into<String>) -> Self {
        Self::InvalidRewrite(message.into())
    }
}
