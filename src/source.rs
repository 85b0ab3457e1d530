//! Data source seam.
//!
//! The execution pipeline never talks to a database driver directly. It
//! submits SQL text to a [`DataSource`] and walks the returned [`Cursor`],
//! which yields zero or more result sets, each with zero or more rows, plus
//! a side channel of driver notices.
//!
//! ```text
//! DataSource::execute(sql)
//!       |
//!       v
//!   Cursor --next_result()--> ResultHeader --next_row()--> Row, Row, ...
//!       |                          |
//!       +--next_result()--> ResultHeader --next_row()--> ...
//!       |
//!       +--drain_notices()--> RowsAffected / DriverMessage
//! ```

mod column;
mod error;
mod sqlite;

#[cfg(test)]
pub(crate) mod scripted;

pub use column::{
    ColumnInfo, JSON_COLUMN_NAME, QUERY_PLAN_COLUMNS, XML_COLUMN_NAME, is_query_plan,
};
pub use error::SourceError;
pub use sqlite::{SqliteCursor, SqliteDataSource};

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ExecutionSettings;
use crate::row::Row;

/// A message reported by the database while executing SQL.
///
/// Mirrors what SQL engines attach to errors and informational output: an
/// error number, a severity class, a state, the line within the submitted
/// text and optionally the procedure that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverMessage {
    /// Engine-specific error number. 0 for plain informational output.
    pub code: i32,
    /// Severity class.
    pub severity: u8,
    /// Engine-specific state.
    pub state: u8,
    /// One-based line within the submitted text. 0 when unknown.
    pub line: u32,
    /// Name of the procedure that raised the message, if any.
    pub procedure: Option<String>,
    /// Message text.
    pub message: String,
}

impl DriverMessage {
    /// Creates an error-class message (severity 16).
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: 16,
            state: 1,
            line: 0,
            procedure: None,
            message: message.into(),
        }
    }

    /// Creates an informational message (severity 0, code 0).
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            severity: 0,
            state: 1,
            line: 0,
            procedure: None,
            message: message.into(),
        }
    }
}

/// Side-channel output of a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A statement without a result set changed this many rows.
    RowsAffected(u64),
    /// The database printed a message.
    Message(DriverMessage),
}

/// Header of one result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultHeader {
    /// Column schema.
    pub columns: Vec<ColumnInfo>,
    /// Set by drivers that know this result set is a query plan.
    pub is_plan: bool,
}

impl ResultHeader {
    /// Creates a header for an ordinary result set.
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self {
            columns,
            is_plan: false,
        }
    }
}

/// Per-execution driver options derived from the execution settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Append the plan the engine used after each row-returning statement.
    pub include_actual_plan: bool,
    /// Return estimated plans instead of running the statements.
    pub include_estimated_plan: bool,
}

impl From<&ExecutionSettings> for ExecutionOptions {
    fn from(settings: &ExecutionSettings) -> Self {
        Self {
            include_actual_plan: settings.include_actual_plan,
            include_estimated_plan: settings.include_estimated_plan,
        }
    }
}

/// A connection that can execute SQL text.
///
/// Implementations must observe `cancel` cooperatively: long-running work
/// should stop at its next checkpoint and report [`SourceError::Cancelled`].
pub trait DataSource: Send + Sync + 'static {
    /// Cursor type returned by [`execute`](Self::execute).
    type Cursor: Cursor + 'static;

    /// Submits SQL text for execution.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Driver` if the database rejects the text before
    /// producing any result. Drivers that stream may instead report such
    /// errors from the cursor.
    fn execute(
        &self,
        sql: &str,
        options: ExecutionOptions,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Self::Cursor, SourceError>> + Send;
}

/// Forward-only reader over the results of one execution.
pub trait Cursor: Send {
    /// Advances to the next result set.
    ///
    /// Any unread rows of the current result set are skipped. Returns `None`
    /// once every statement has run.
    fn next_result(
        &mut self,
    ) -> impl Future<Output = Result<Option<ResultHeader>, SourceError>> + Send;

    /// Reads the next row of the current result set, or `None` at its end.
    fn next_row(&mut self) -> impl Future<Output = Result<Option<Row>, SourceError>> + Send;

    /// Takes the notices received so far.
    fn drain_notices(&mut self) -> Vec<Notice>;
}

/// Resolves the connection an owner URI executes against.
pub trait ConnectionResolver: Send + Sync + 'static {
    /// The data source type handed out.
    type Source: DataSource;

    /// Returns the owner's connection, or `None` if it has none.
    fn resolve(&self, owner_uri: &str) -> Option<Arc<Self::Source>>;
}

/// Owner URI to connection map.
pub struct ConnectionMap<S> {
    connections: DashMap<String, Arc<S>>,
}

impl<S> ConnectionMap<S> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Binds `source` to `owner_uri`, returning the connection it replaces.
    pub fn connect(&self, owner_uri: impl Into<String>, source: Arc<S>) -> Option<Arc<S>> {
        self.connections.insert(owner_uri.into(), source)
    }

    /// Removes the owner's connection.
    pub fn disconnect(&self, owner_uri: &str) -> Option<Arc<S>> {
        self.connections.remove(owner_uri).map(|(_, source)| source)
    }

    /// Returns true if the owner has a connection.
    pub fn is_connected(&self, owner_uri: &str) -> bool {
        self.connections.contains_key(owner_uri)
    }
}

impl<S> Default for ConnectionMap<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: DataSource> ConnectionResolver for ConnectionMap<S> {
    type Source = S;

    fn resolve(&self, owner_uri: &str) -> Option<Arc<S>> {
        self.connections.get(owner_uri).map(|entry| entry.value().clone())
    }
}
