//! Scripted data source for tests.
//!
//! Each call to `execute` plays back a fixed list of [`Step`]s, which makes
//! driver errors, notices and endless result sets reproducible without a
//! real database.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    ColumnInfo, Cursor, DataSource, DriverMessage, ExecutionOptions, Notice, ResultHeader,
    SourceError,
};
use crate::datum::Value;
use crate::row::Row;

/// One scripted cursor event.
#[derive(Debug, Clone)]
pub enum Step {
    /// A finite result set.
    Result {
        header: ResultHeader,
        rows: Vec<Row>,
    },
    /// A result set that yields rows until cancelled.
    Endless(ResultHeader),
    /// A side-channel notice.
    Notice(Notice),
    /// A driver error; the rest of the script is skipped.
    Fail(DriverMessage),
}

impl Step {
    /// A result set of integer columns.
    pub fn ints(columns: &[&str], rows: Vec<Vec<i64>>) -> Step {
        Step::Result {
            header: header(columns),
            rows: rows
                .into_iter()
                .map(|row| Row::new(row.into_iter().map(Value::Int64).collect()))
                .collect(),
        }
    }

    /// A result set with `count` rows of one integer column.
    pub fn counting(count: i64) -> Step {
        Step::ints(&["n"], (0..count).map(|i| vec![i]).collect())
    }
}

/// Builds a header from column names.
pub fn header(columns: &[&str]) -> ResultHeader {
    ResultHeader::new(
        columns
            .iter()
            .enumerate()
            .map(|(i, name)| ColumnInfo::new(i, *name, "INTEGER"))
            .collect(),
    )
}

/// A data source that replays scripts.
pub struct ScriptedSource {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    last: Mutex<Vec<Step>>,
    executions: AtomicUsize,
    statements: Mutex<Vec<String>>,
}

impl ScriptedSource {
    /// Every execution plays back `steps`.
    pub fn new(steps: Vec<Step>) -> Self {
        Self::sequence(vec![steps])
    }

    /// Execution N plays back `scripts[N]`; the last script repeats.
    pub fn sequence(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            last: Mutex::new(Vec::new()),
            executions: AtomicUsize::new(0),
            statements: Mutex::new(Vec::new()),
        }
    }

    /// Number of times `execute` was called.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// SQL text of every execution, in order.
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    fn next_script(&self) -> Vec<Step> {
        let mut scripts = self.scripts.lock();
        let mut last = self.last.lock();
        if let Some(script) = scripts.pop_front() {
            *last = script;
        }
        last.clone()
    }
}

impl DataSource for ScriptedSource {
    type Cursor = ScriptedCursor;

    async fn execute(
        &self,
        sql: &str,
        _options: ExecutionOptions,
        cancel: CancellationToken,
    ) -> Result<ScriptedCursor, SourceError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.statements.lock().push(sql.to_string());
        Ok(ScriptedCursor {
            steps: self.next_script().into(),
            current: Current::None,
            notices: Vec::new(),
            cancel,
        })
    }
}

enum Current {
    None,
    Rows(VecDeque<Row>),
    Endless(i64),
}

/// Cursor over one script.
pub struct ScriptedCursor {
    steps: VecDeque<Step>,
    current: Current,
    notices: Vec<Notice>,
    cancel: CancellationToken,
}

impl Cursor for ScriptedCursor {
    async fn next_result(&mut self) -> Result<Option<ResultHeader>, SourceError> {
        self.current = Current::None;
        while let Some(step) = self.steps.pop_front() {
            if self.cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            match step {
                Step::Result { header, rows } => {
                    self.current = Current::Rows(rows.into());
                    return Ok(Some(header));
                }
                Step::Endless(header) => {
                    self.current = Current::Endless(0);
                    return Ok(Some(header));
                }
                Step::Notice(notice) => self.notices.push(notice),
                Step::Fail(message) => {
                    self.steps.clear();
                    return Err(SourceError::Driver(message));
                }
            }
        }
        Ok(None)
    }

    async fn next_row(&mut self) -> Result<Option<Row>, SourceError> {
        match &mut self.current {
            Current::None => Ok(None),
            Current::Rows(rows) => Ok(rows.pop_front()),
            Current::Endless(next) => {
                if self.cancel.is_cancelled() {
                    return Err(SourceError::Cancelled);
                }
                let row = Row::new(vec![Value::Int64(*next)]);
                *next += 1;
                tokio::task::yield_now().await;
                Ok(Some(row))
            }
        }
    }

    fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }
}
