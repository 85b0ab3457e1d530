//! Manager errors.

use thiserror::Error;

use crate::query::QueryError;
use crate::result_set::ResultSetError;

/// Errors returned to callers of the query execution manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// No connection is registered for the owner URI.
    #[error("no connection is open for {0}")]
    InvalidOwner(String),

    /// A query is still running for the owner URI.
    #[error("a query is already in progress for {0}")]
    QueryInProgress(String),

    /// No query is registered for the owner URI.
    #[error("no query exists for {0}")]
    NoSuchQuery(String),

    /// The query rejected the request.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// The result set rejected the request.
    #[error(transparent)]
    ResultSet(#[from] ResultSetError),
}
