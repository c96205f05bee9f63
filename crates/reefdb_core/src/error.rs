//! Error types for ReefDB.

use reefdb_storage::StorageError;
use std::io;
use thiserror::Error;

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ReefDB operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An item or index was not found.
    #[error("not found")]
    NotFound,

    /// The transaction has already been committed or rolled back.
    #[error("tx closed")]
    TxClosed,

    /// A write operation was attempted on a read-only transaction.
    #[error("tx not writable")]
    TxNotWritable,

    /// A mutation was attempted while iterating the tree it would change.
    #[error("tx is iterating")]
    TxIterating,

    /// An index with the same name already exists, or the name is empty.
    #[error("index exists")]
    IndexExists,

    /// The operation cannot be completed in the current state.
    #[error("invalid operation")]
    InvalidOperation,

    /// The sync policy value is not recognized.
    #[error("invalid sync policy")]
    InvalidSyncPolicy,

    /// A log compaction is already in progress.
    #[error("shrink is in-process")]
    ShrinkInProcess,

    /// The database file is not a valid command log.
    #[error("invalid database")]
    InvalidDatabase,

    /// The database has been closed.
    #[error("database closed")]
    DatabaseClosed,

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
