//! Query errors.

use thiserror::Error;

use crate::batch::BatchError;

/// Invalid uses of a query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// `execute` was called on a query that has been started before.
    #[error("query has already been executed")]
    AlreadyExecuted,

    /// The query reached a terminal state and can no longer be canceled.
    #[error("query has already completed")]
    AlreadyCompleted,

    /// No batch with this ordinal exists.
    #[error("batch {batch_id} is out of range (query has {count})")]
    BatchOutOfRange { batch_id: usize, count: usize },

    /// The batch rejected the request.
    #[error(transparent)]
    Batch(#[from] BatchError),
}
