//! SQLite data source.
//!
//! Statements run one by one on a blocking thread that streams cursor events
//! through a bounded channel, so the driver never gets further ahead of the
//! result set writer than the channel capacity.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::fallible_iterator::FallibleIterator;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle, Statement};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    ColumnInfo, Cursor, DataSource, DriverMessage, ExecutionOptions, Notice, ResultHeader,
    SourceError,
};
use crate::datum::Value;
use crate::row::Row;

/// Cursor events buffered between the worker thread and the reader.
const CHANNEL_CAPACITY: usize = 256;

/// Generic SQLite error number used when the driver reports no code.
const GENERIC_ERROR_CODE: i32 = 1;

/// Events sent from the worker thread to the cursor.
enum CursorEvent {
    Notice(Notice),
    ResultStart(ResultHeader),
    Row(Row),
    ResultEnd,
    Failed(SourceError),
}

/// A SQLite connection usable as a [`DataSource`].
pub struct SqliteDataSource {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl SqliteDataSource {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let conn = Connection::open(path).map_err(|e| map_error(e, 0))?;
        Ok(Self::from_connection(conn))
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, SourceError> {
        let conn = Connection::open_in_memory().map_err(|e| map_error(e, 0))?;
        Ok(Self::from_connection(conn))
    }

    /// Wraps an already opened connection.
    pub fn from_connection(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        }
    }
}

impl DataSource for SqliteDataSource {
    type Cursor = SqliteCursor;

    async fn execute(
        &self,
        sql: &str,
        options: ExecutionOptions,
        cancel: CancellationToken,
    ) -> Result<SqliteCursor, SourceError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let watcher = {
            let cancel = cancel.clone();
            let interrupt = self.interrupt.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                debug!("interrupting sqlite statement");
                interrupt.interrupt();
            })
        };

        let conn = self.conn.clone();
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let worker = Worker {
                conn: &conn,
                sql: &sql,
                options,
                cancel: &cancel,
                tx: &tx,
            };
            if let Err(e) = worker.run() {
                // A closed channel means the reader is gone; nobody to tell
                let _ = tx.blocking_send(CursorEvent::Failed(e));
            }
        });

        Ok(SqliteCursor {
            events: rx,
            notices: Vec::new(),
            in_result: false,
            watcher: Some(watcher),
        })
    }
}

/// Executes the statements of one submission on the blocking thread.
struct Worker<'a> {
    conn: &'a Connection,
    sql: &'a str,
    options: ExecutionOptions,
    cancel: &'a CancellationToken,
    tx: &'a mpsc::Sender<CursorEvent>,
}

impl Worker<'_> {
    fn run(&self) -> Result<(), SourceError> {
        let mut batch = rusqlite::Batch::new(self.conn, self.sql);
        let mut search_from = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }

            let statement = batch
                .next()
                .map_err(|e| map_error(e, next_statement_line(self.sql, search_from)))?;
            let Some(mut statement) = statement else {
                return Ok(());
            };

            let text = statement
                .expanded_sql()
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            let line = match self.sql[search_from..].find(&text) {
                Some(pos) if !text.is_empty() => {
                    let start = search_from + pos;
                    search_from = start + text.len();
                    line_at(self.sql, start)
                }
                _ => 0,
            };
            trace!(line, sql = %text, "executing sqlite statement");

            if self.options.include_estimated_plan {
                self.send_plan(&text, line)?;
                continue;
            }

            if statement.column_count() == 0 {
                let changed = statement.raw_execute().map_err(|e| map_error(e, line))?;
                if is_dml(&text) {
                    self.send(CursorEvent::Notice(Notice::RowsAffected(changed as u64)))?;
                }
                continue;
            }

            self.stream_rows(&mut statement, line)?;
            if self.options.include_actual_plan {
                self.send_plan(&text, line)?;
            }
        }
    }

    fn stream_rows(&self, statement: &mut Statement<'_>, line: u32) -> Result<(), SourceError> {
        let columns = statement_columns(statement);
        let width = columns.len();
        self.send(CursorEvent::ResultStart(ResultHeader::new(columns)))?;

        let mut rows = statement.raw_query();
        while let Some(row) = rows.next().map_err(|e| map_error(e, line))? {
            if self.cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                let value = row.get_ref(i).map_err(|e| map_error(e, line))?;
                values.push(convert_value(value));
            }
            self.send(CursorEvent::Row(Row::new(values)))?;
        }

        self.send(CursorEvent::ResultEnd)
    }

    fn send_plan(&self, text: &str, line: u32) -> Result<(), SourceError> {
        if text.is_empty() {
            return Ok(());
        }
        let mut plan = self
            .conn
            .prepare(&format!("EXPLAIN QUERY PLAN {}", text))
            .map_err(|e| map_error(e, line))?;
        let columns = statement_columns(&plan);
        let width = columns.len();
        self.send(CursorEvent::ResultStart(ResultHeader {
            columns,
            is_plan: true,
        }))?;

        let mut rows = plan.raw_query();
        while let Some(row) = rows.next().map_err(|e| map_error(e, line))? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(convert_value(row.get_ref(i).map_err(|e| map_error(e, line))?));
            }
            self.send(CursorEvent::Row(Row::new(values)))?;
        }

        self.send(CursorEvent::ResultEnd)
    }

    fn send(&self, event: CursorEvent) -> Result<(), SourceError> {
        self.tx
            .blocking_send(event)
            .map_err(|_| SourceError::Disconnected)
    }
}

/// Cursor over the events streamed by a [`SqliteDataSource`] worker.
pub struct SqliteCursor {
    events: mpsc::Receiver<CursorEvent>,
    notices: Vec<Notice>,
    in_result: bool,
    watcher: Option<JoinHandle<()>>,
}

impl SqliteCursor {
    fn finish(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl Cursor for SqliteCursor {
    async fn next_result(&mut self) -> Result<Option<ResultHeader>, SourceError> {
        // Skip whatever is left of the current result set
        while self.in_result {
            if self.next_row().await?.is_none() {
                break;
            }
        }

        loop {
            match self.events.recv().await {
                Some(CursorEvent::Notice(notice)) => self.notices.push(notice),
                Some(CursorEvent::ResultStart(header)) => {
                    self.in_result = true;
                    return Ok(Some(header));
                }
                Some(CursorEvent::Row(_)) | Some(CursorEvent::ResultEnd) => {}
                Some(CursorEvent::Failed(e)) => {
                    self.finish();
                    return Err(e);
                }
                None => {
                    self.finish();
                    return Ok(None);
                }
            }
        }
    }

    async fn next_row(&mut self) -> Result<Option<Row>, SourceError> {
        if !self.in_result {
            return Ok(None);
        }

        loop {
            match self.events.recv().await {
                Some(CursorEvent::Row(row)) => return Ok(Some(row)),
                Some(CursorEvent::ResultEnd) => {
                    self.in_result = false;
                    return Ok(None);
                }
                Some(CursorEvent::Notice(notice)) => self.notices.push(notice),
                Some(CursorEvent::ResultStart(_)) => {}
                Some(CursorEvent::Failed(e)) => {
                    self.in_result = false;
                    self.finish();
                    return Err(e);
                }
                None => {
                    self.in_result = false;
                    self.finish();
                    return Err(SourceError::Disconnected);
                }
            }
        }
    }

    fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }
}

impl Drop for SqliteCursor {
    fn drop(&mut self) {
        self.finish();
    }
}

fn statement_columns(statement: &Statement<'_>) -> Vec<ColumnInfo> {
    statement
        .columns()
        .iter()
        .enumerate()
        .map(|(ordinal, column)| {
            ColumnInfo::new(ordinal, column.name(), column.decl_type().unwrap_or(""))
        })
        .collect()
}

fn convert_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Int64(n),
        ValueRef::Real(n) => Value::Float64(n),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
    }
}

/// Returns true for statements whose change count is worth reporting.
fn is_dml(sql: &str) -> bool {
    let keyword = sql
        .split(|c: char| !c.is_ascii_alphabetic())
        .find(|word| !word.is_empty())
        .unwrap_or("");
    ["INSERT", "UPDATE", "DELETE", "REPLACE"]
        .iter()
        .any(|dml| keyword.eq_ignore_ascii_case(dml))
}

/// Line of the first statement character at or after `from`.
///
/// Used when a statement fails to prepare and its text is unknown.
fn next_statement_line(text: &str, from: usize) -> u32 {
    let rest = &text[from..];
    let skipped = rest.len()
        - rest
            .trim_start_matches(|c: char| c.is_whitespace() || c == ';')
            .len();
    line_at(text, from + skipped)
}

/// One-based line number of the byte offset `pos` in `text`.
fn line_at(text: &str, pos: usize) -> u32 {
    text[..pos].bytes().filter(|b| *b == b'\n').count() as u32 + 1
}

fn map_error(error: rusqlite::Error, line: u32) -> SourceError {
    match error {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::OperationInterrupted =>
        {
            SourceError::Cancelled
        }
        rusqlite::Error::SqliteFailure(failure, message) => SourceError::Driver(DriverMessage {
            line,
            ..DriverMessage::error(
                failure.extended_code,
                message.unwrap_or_else(|| failure.to_string()),
            )
        }),
        other => SourceError::Driver(DriverMessage {
            line,
            ..DriverMessage::error(GENERIC_ERROR_CODE, other.to_string())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(cursor: &mut SqliteCursor) -> Result<Vec<(ResultHeader, Vec<Row>)>, SourceError> {
        let mut results = Vec::new();
        while let Some(header) = cursor.next_result().await? {
            let mut rows = Vec::new();
            while let Some(row) = cursor.next_row().await? {
                rows.push(row);
            }
            results.push((header, rows));
        }
        Ok(results)
    }

    async fn run(source: &SqliteDataSource, sql: &str) -> Result<Vec<(ResultHeader, Vec<Row>)>, SourceError> {
        let mut cursor = source
            .execute(sql, ExecutionOptions::default(), CancellationToken::new())
            .await?;
        collect(&mut cursor).await
    }

    #[tokio::test]
    async fn test_multiple_result_sets() {
        let source = SqliteDataSource::open_in_memory().unwrap();
        let results = run(&source, "SELECT 1; SELECT 2 AS two, 'x' AS three").await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.columns.len(), 1);
        assert_eq!(results[0].1, vec![Row::new(vec![Value::Int64(1)])]);
        assert_eq!(results[1].0.columns[0].name, "two");
        assert_eq!(
            results[1].1,
            vec![Row::new(vec![Value::Int64(2), Value::Text("x".to_string())])]
        );
    }

    #[tokio::test]
    async fn test_rows_affected_notice() {
        let source = SqliteDataSource::open_in_memory().unwrap();
        let mut cursor = source
            .execute(
                "CREATE TABLE t (a INTEGER); INSERT INTO t VALUES (1), (2), (3);",
                ExecutionOptions::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(collect(&mut cursor).await.unwrap().is_empty());
        assert_eq!(cursor.drain_notices(), vec![Notice::RowsAffected(3)]);
        assert!(cursor.drain_notices().is_empty());
    }

    #[tokio::test]
    async fn test_declared_types() {
        let source = SqliteDataSource::open_in_memory().unwrap();
        let results = run(
            &source,
            "CREATE TABLE t (id INTEGER NOT NULL, name TEXT); INSERT INTO t VALUES (1, NULL); SELECT id, name FROM t",
        )
        .await
        .unwrap();

        let columns = &results[0].0.columns;
        assert_eq!(columns[0].data_type_name, "INTEGER");
        assert_eq!(columns[1].data_type_name, "TEXT");
        assert_eq!(results[0].1[0].values[1], Value::Null);
    }

    #[tokio::test]
    async fn test_driver_error() {
        let source = SqliteDataSource::open_in_memory().unwrap();
        let result = run(&source, "SELECT 1;\nSELECT * FROM missing").await;

        match result {
            Err(SourceError::Driver(message)) => {
                assert!(message.message.contains("missing"));
                assert_eq!(message.severity, 16);
            }
            other => panic!("expected driver error, got {:?}", other.map(|r| r.len())),
        }
    }

    #[tokio::test]
    async fn test_error_after_first_result() {
        let source = SqliteDataSource::open_in_memory().unwrap();
        let mut cursor = source
            .execute(
                "CREATE TABLE t (a INTEGER UNIQUE); INSERT INTO t VALUES (1); SELECT a FROM t; INSERT INTO t VALUES (1);",
                ExecutionOptions::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(cursor.next_result().await.unwrap().is_some());
        assert!(cursor.next_row().await.unwrap().is_some());
        match cursor.next_result().await {
            Err(SourceError::Driver(message)) => {
                assert!(message.message.contains("UNIQUE"));
                assert_eq!(message.line, 1);
            }
            other => panic!("expected constraint error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_estimated_plan() {
        let source = SqliteDataSource::open_in_memory().unwrap();
        run(&source, "CREATE TABLE t (a INTEGER)").await.unwrap();

        let mut cursor = source
            .execute(
                "SELECT a FROM t WHERE a = 1",
                ExecutionOptions {
                    include_estimated_plan: true,
                    ..ExecutionOptions::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let results = collect(&mut cursor).await.unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].0.is_plan);
        assert!(super::super::is_query_plan(&results[0].0.columns));
    }

    #[tokio::test]
    async fn test_actual_plan_follows_results() {
        let source = SqliteDataSource::open_in_memory().unwrap();
        let mut cursor = source
            .execute(
                "SELECT 1",
                ExecutionOptions {
                    include_actual_plan: true,
                    ..ExecutionOptions::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let results = collect(&mut cursor).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(!results[0].0.is_plan);
        assert!(results[1].0.is_plan);
    }

    #[tokio::test]
    async fn test_cancel_endless_query() {
        let source = SqliteDataSource::open_in_memory().unwrap();
        let cancel = CancellationToken::new();
        let mut cursor = source
            .execute(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT x FROM c",
                ExecutionOptions::default(),
                cancel.clone(),
            )
            .await
            .unwrap();

        assert!(cursor.next_result().await.unwrap().is_some());
        for _ in 0..10 {
            assert!(cursor.next_row().await.unwrap().is_some());
        }
        cancel.cancel();

        let outcome = loop {
            match cursor.next_row().await {
                Ok(Some(_)) => continue,
                other => break other,
            }
        };
        assert!(matches!(outcome, Err(SourceError::Cancelled)));
    }

    #[test]
    fn test_is_dml() {
        assert!(is_dml("insert into t values (1)"));
        assert!(is_dml("  DELETE FROM t"));
        assert!(!is_dml("SELECT 1"));
        assert!(!is_dml("CREATE TABLE t (a)"));
    }

    #[test]
    fn test_line_at() {
        assert_eq!(line_at("a\nb\nc", 0), 1);
        assert_eq!(line_at("a\nb\nc", 4), 3);
    }

    #[test]
    fn test_next_statement_line() {
        let sql = "SELECT 1;\n\n  SELEC 2";
        assert_eq!(next_statement_line(sql, 0), 1);
        assert_eq!(next_statement_line(sql, 8), 3);
        assert_eq!(next_statement_line(sql, sql.len()), 3);
    }

    #[tokio::test]
    async fn test_prepare_error_line() {
        let source = SqliteDataSource::open_in_memory().unwrap();
        let err = run(&source, "SELECT 1;\n\nSELEC 2").await.unwrap_err();
        let SourceError::Driver(message) = err else {
            panic!("expected driver error, got {err:?}");
        };
        assert_eq!(message.line, 3);
    }
}
