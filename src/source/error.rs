//! Data source errors.

use thiserror::Error;

use super::DriverMessage;

/// Errors raised by a data source or one of its cursors.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The database reported an error for the submitted SQL.
    ///
    /// This is the only data-source-level error: a batch records it as a
    /// message and carries on with its next repetition.
    #[error("{}", .0.message)]
    Driver(DriverMessage),

    /// The operation observed the cancellation signal.
    #[error("operation was canceled")]
    Cancelled,

    /// The connection (or the worker streaming its results) went away.
    #[error("connection closed")]
    Disconnected,

    /// I/O error while talking to the database.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Returns true for errors the database reported about the SQL itself.
    pub fn is_data_source(&self) -> bool {
        matches!(self, SourceError::Driver(_))
    }
}
