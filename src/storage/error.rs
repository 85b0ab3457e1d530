//! Row buffer store errors.

use thiserror::Error;

use crate::row::CodecError;

/// Row buffer store errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store has been closed and its backing medium released.
    ///
    /// Appends and reads after `close()` fail with this error.
    #[error("row store is closed")]
    Closed,

    /// I/O error from the underlying file system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes could not be decoded back into a row.
    ///
    /// This indicates that the backing file was modified or truncated by
    /// someone other than the store.
    #[error("data corruption at row {row}: {source}")]
    Corrupted {
        /// Row offset that failed to decode.
        row: u64,
        /// Underlying codec error.
        source: CodecError,
    },
}
