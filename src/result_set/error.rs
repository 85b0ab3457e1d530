//! Result set errors.

use std::path::PathBuf;

use thiserror::Error;

use crate::source::SourceError;
use crate::storage::StorageError;

/// Errors raised while filling, paging or saving a result set.
#[derive(Debug, Error)]
pub enum ResultSetError {
    /// The requested row window does not start inside the available rows.
    #[error("row window start {start} count {count} is out of range ({available} rows available)")]
    OutOfRange { start: i64, count: i64, available: u64 },

    /// The operation requires a result set that has been read to the end.
    #[error("result set has not completed yet")]
    NotComplete,

    /// A save to this destination is already running.
    #[error("a save to {} is already in progress", .0.display())]
    SaveInProgress(PathBuf),

    /// The save bounds do not fit the result set.
    #[error("invalid save range: {0}")]
    InvalidSaveRange(String),

    /// Reading stopped because the query was canceled.
    ///
    /// Rows read before cancellation stay readable.
    #[error("read was canceled")]
    Cancelled,

    /// The data source failed while rows were being read.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The row buffer store failed.
    #[error("row storage error: {0}")]
    Storage(#[from] StorageError),

    /// Writing a save destination failed.
    #[error("failed to write results: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding a JSON save failed.
    #[error("failed to encode results: {0}")]
    Json(#[from] serde_json::Error),

    /// A CSV record could not be written.
    #[error("failed to encode CSV: {0}")]
    Csv(#[from] csv::Error),
}
