//! Batch errors.

use thiserror::Error;

use crate::result_set::ResultSetError;

/// Invalid uses of a batch.
///
/// Execution failures are not errors of this kind: they are recorded as
/// batch messages and reflected in the batch's flags.
#[derive(Debug, Error)]
pub enum BatchError {
    /// `execute` was called on a batch that already ran.
    #[error("batch {0} has already been executed")]
    AlreadyExecuted(usize),

    /// No result set with this ordinal exists (yet).
    #[error("result set {result_set_id} is out of range (batch has {count})")]
    ResultSetOutOfRange { result_set_id: usize, count: usize },

    /// The result set rejected the request.
    #[error(transparent)]
    ResultSet(#[from] ResultSetError),
}
