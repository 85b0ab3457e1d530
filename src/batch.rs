//! Batches.
//!
//! A [`Batch`] is one chunk of SQL text executed as a unit, possibly several
//! times in a row. Each execution may yield any number of result sets, which
//! the batch creates in the order the driver reports them and keeps for
//! paging.
//!
//! # Failure Policy
//!
//! ```text
//! driver error in repetition K  -> message, has_error, next repetition
//! cancellation                  -> "canceled" message, stop (not an error)
//! anything else                 -> message, has_error, stop
//! ```
//!
//! A `batch_completed` event is emitted however execution ends.

mod error;
mod message;

pub use error::BatchError;
pub use message::{
    CANCELLED_MESSAGE, Classification, ERROR_SEVERITY_THRESHOLD, ResultMessage, SUCCESS_MESSAGE,
    SelectionRange, classify, format_elapsed, format_error, rows_affected,
};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ExecutionSettings;
use crate::event::{EventBody, EventSubscribers};
use crate::result_set::{
    ReadOptions, ResultSet, ResultSetError, ResultSetSummary, ResultSubset, SpecialAction,
};
use crate::source::{Cursor, DataSource, DriverMessage, ExecutionOptions, Notice, SourceError};
use crate::storage::{RowStore, RowStoreFactory, StoreKey};

/// How a batch execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every repetition ran. Driver errors may still have been recorded.
    Completed,
    /// The query was canceled.
    Cancelled,
    /// An infrastructure error stopped the batch.
    Failed,
}

/// Snapshot of a batch for notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub id: usize,
    pub selection: SelectionRange,
    pub has_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_elapsed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_set_summaries: Option<Vec<ResultSetSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_action: Option<SpecialAction>,
}

#[derive(Default)]
struct BatchState {
    started: bool,
    has_executed: bool,
    has_error: bool,
    cancelled: bool,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    messages: Vec<ResultMessage>,
}

/// Why one repetition stopped early.
enum Interruption {
    Driver(DriverMessage),
    Cancelled,
    Failed(String),
}

impl From<SourceError> for Interruption {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Driver(message) => Interruption::Driver(message),
            SourceError::Cancelled => Interruption::Cancelled,
            other => Interruption::Failed(other.to_string()),
        }
    }
}

impl From<ResultSetError> for Interruption {
    fn from(e: ResultSetError) -> Self {
        match e {
            ResultSetError::Cancelled => Interruption::Cancelled,
            ResultSetError::Source(e) => e.into(),
            other => Interruption::Failed(other.to_string()),
        }
    }
}

/// One chunk of SQL text and the result sets it produced.
pub struct Batch<S> {
    id: usize,
    owner_uri: String,
    sql: String,
    selection: SelectionRange,
    execution_count: Option<u32>,
    result_sets: RwLock<Vec<Arc<ResultSet<S>>>>,
    state: Mutex<BatchState>,
}

impl<S: RowStore> Batch<S> {
    /// Creates a batch that has not run yet.
    ///
    /// `execution_count` overrides the repetition count of the execution
    /// settings when set.
    pub fn new(
        id: usize,
        owner_uri: impl Into<String>,
        sql: impl Into<String>,
        selection: SelectionRange,
        execution_count: Option<u32>,
    ) -> Self {
        Self {
            id,
            owner_uri: owner_uri.into(),
            sql: sql.into(),
            selection,
            execution_count,
            result_sets: RwLock::new(Vec::new()),
            state: Mutex::new(BatchState::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn selection(&self) -> SelectionRange {
        self.selection
    }

    pub fn has_executed(&self) -> bool {
        self.state.lock().has_executed
    }

    pub fn has_error(&self) -> bool {
        self.state.lock().has_error
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Messages recorded so far, in order.
    pub fn messages(&self) -> Vec<ResultMessage> {
        self.state.lock().messages.clone()
    }

    pub fn result_set_count(&self) -> usize {
        self.result_sets.read().len()
    }

    /// Returns the result set with the given ordinal.
    pub fn result_set(&self, id: usize) -> Option<Arc<ResultSet<S>>> {
        self.result_sets.read().get(id).cloned()
    }

    /// OR of the special actions of every result set.
    pub fn special_action(&self) -> SpecialAction {
        self.result_sets
            .read()
            .iter()
            .fold(SpecialAction::default(), |acc, rs| {
                acc.combine(rs.special_action())
            })
    }

    pub fn summary(&self) -> BatchSummary {
        let (has_error, has_executed, start, end) = {
            let state = self.state.lock();
            (
                state.has_error,
                state.has_executed,
                state.start_time,
                state.end_time,
            )
        };

        let mut summary = BatchSummary {
            id: self.id,
            selection: self.selection,
            has_error,
            execution_start: start,
            execution_end: None,
            execution_elapsed: None,
            result_set_summaries: None,
            special_action: None,
        };

        if has_executed {
            summary.execution_end = end;
            if let (Some(start), Some(end)) = (start, end) {
                summary.execution_elapsed = Some(format_elapsed(end - start));
            }
            summary.result_set_summaries = Some(
                self.result_sets
                    .read()
                    .iter()
                    .map(|rs| rs.summary())
                    .collect(),
            );
            summary.special_action = Some(self.special_action());
        }
        summary
    }

    /// Executes the batch against `source`.
    ///
    /// Runs the SQL as many times as the execution count says, creating a
    /// result set for every result the driver returns. May be called once.
    ///
    /// # Errors
    ///
    /// Returns `BatchError::AlreadyExecuted` if the batch has been started
    /// before. Everything that goes wrong during execution is reported
    /// through messages and the returned [`BatchOutcome`] instead.
    pub async fn execute<D, F>(
        &self,
        source: &D,
        factory: &F,
        settings: &ExecutionSettings,
        cancel: &CancellationToken,
        events: &EventSubscribers,
    ) -> Result<BatchOutcome, BatchError>
    where
        D: DataSource,
        F: RowStoreFactory<Store = S>,
    {
        {
            let mut state = self.state.lock();
            if state.started {
                return Err(BatchError::AlreadyExecuted(self.id));
            }
            state.started = true;
            state.start_time = Some(Utc::now());
        }
        debug!(owner_uri = %self.owner_uri, batch_id = self.id, "batch started");
        events.emit(EventBody::BatchStarted(self.summary())).await;

        let outcome = match self
            .run_repetitions(source, factory, settings, cancel, events)
            .await
        {
            Ok(()) => BatchOutcome::Completed,
            Err(Interruption::Cancelled) => {
                self.state.lock().cancelled = true;
                self.add_message(ResultMessage::info(self.id, CANCELLED_MESSAGE), events)
                    .await;
                BatchOutcome::Cancelled
            }
            Err(Interruption::Failed(message)) => {
                warn!(owner_uri = %self.owner_uri, batch_id = self.id, error = %message, "batch failed");
                self.state.lock().has_error = true;
                self.add_message(ResultMessage::error(self.id, message), events)
                    .await;
                BatchOutcome::Failed
            }
            // Driver errors are handled per repetition
            Err(Interruption::Driver(message)) => {
                self.record_driver_error(&message, events).await;
                BatchOutcome::Completed
            }
        };

        let quiet = {
            let state = self.state.lock();
            state.messages.is_empty() && !state.has_error
        };
        if quiet {
            self.add_message(ResultMessage::info(self.id, SUCCESS_MESSAGE), events)
                .await;
        }

        {
            let mut state = self.state.lock();
            state.has_executed = true;
            state.end_time = Some(Utc::now());
        }
        debug!(owner_uri = %self.owner_uri, batch_id = self.id, ?outcome, "batch completed");
        events.emit(EventBody::BatchCompleted(self.summary())).await;

        Ok(outcome)
    }

    async fn run_repetitions<D, F>(
        &self,
        source: &D,
        factory: &F,
        settings: &ExecutionSettings,
        cancel: &CancellationToken,
        events: &EventSubscribers,
    ) -> Result<(), Interruption>
    where
        D: DataSource,
        F: RowStoreFactory<Store = S>,
    {
        let count = self
            .execution_count
            .unwrap_or_else(|| settings.execution_count())
            .max(1);
        let options = ExecutionOptions::from(settings);
        let read = ReadOptions::from(settings);

        for repetition in 0..count {
            if cancel.is_cancelled() {
                return Err(Interruption::Cancelled);
            }

            match self
                .run_once(source, factory, options, read, cancel, events)
                .await
            {
                Ok(()) => {}
                Err(Interruption::Driver(message)) => {
                    debug!(
                        owner_uri = %self.owner_uri,
                        batch_id = self.id,
                        repetition,
                        code = message.code,
                        "driver error, continuing with next repetition"
                    );
                    self.record_driver_error(&message, events).await;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    async fn run_once<D, F>(
        &self,
        source: &D,
        factory: &F,
        options: ExecutionOptions,
        read: ReadOptions,
        cancel: &CancellationToken,
        events: &EventSubscribers,
    ) -> Result<(), Interruption>
    where
        D: DataSource,
        F: RowStoreFactory<Store = S>,
    {
        let mut cursor = source.execute(&self.sql, options, cancel.clone()).await?;

        loop {
            let next = cursor.next_result().await;
            self.report_notices(&mut cursor, events).await;
            let Some(header) = next? else {
                return Ok(());
            };

            // Only this path appends, so the next ordinal is stable
            let key = StoreKey {
                owner_uri: self.owner_uri.clone(),
                batch_id: self.id,
                result_set_id: self.result_sets.read().len(),
            };
            let result_set = ResultSet::create(factory, key, header).await?;
            let result_set = Arc::new(result_set);
            self.result_sets.write().push(result_set.clone());

            let read_outcome = result_set
                .read_to_end(&mut cursor, read, cancel, events)
                .await;
            self.report_notices(&mut cursor, events).await;
            read_outcome?;
        }
    }

    async fn report_notices<C: Cursor>(&self, cursor: &mut C, events: &EventSubscribers) {
        for notice in cursor.drain_notices() {
            let message = match notice {
                Notice::RowsAffected(count) => ResultMessage::info(self.id, rows_affected(count)),
                Notice::Message(message) if message.severity > ERROR_SEVERITY_THRESHOLD => {
                    self.state.lock().has_error = true;
                    ResultMessage::error(self.id, format_error(&message, &self.selection))
                }
                Notice::Message(message) => ResultMessage::info(self.id, message.message),
            };
            self.add_message(message, events).await;
        }
    }

    async fn record_driver_error(&self, error: &DriverMessage, events: &EventSubscribers) {
        self.state.lock().has_error = true;
        let message = match classify(error) {
            Classification::Error => {
                ResultMessage::error(self.id, format_error(error, &self.selection))
            }
            Classification::Informational => ResultMessage::info(self.id, error.message.clone()),
            Classification::Suppressed => return,
        };
        self.add_message(message, events).await;
    }

    async fn add_message(&self, message: ResultMessage, events: &EventSubscribers) {
        self.state.lock().messages.push(message.clone());
        events.emit(EventBody::Message(message)).await;
    }

    /// Reads a window of rows from one of the result sets.
    ///
    /// # Errors
    ///
    /// Returns `BatchError::ResultSetOutOfRange` for an unknown ordinal and
    /// forwards the result set's own range errors.
    pub async fn get_subset(
        &self,
        result_set_id: usize,
        start: i64,
        count: i64,
    ) -> Result<ResultSubset, BatchError> {
        let result_set = {
            let result_sets = self.result_sets.read();
            result_sets
                .get(result_set_id)
                .cloned()
                .ok_or(BatchError::ResultSetOutOfRange {
                    result_set_id,
                    count: result_sets.len(),
                })?
        };
        Ok(result_set.get_subset(start, count).await?)
    }

    /// Releases the stores of every result set.
    ///
    /// Failures are logged; closing continues with the next result set.
    pub async fn close(&self) {
        let result_sets = self.result_sets.read().clone();
        for result_set in result_sets {
            if let Err(e) = result_set.close().await {
                warn!(
                    owner_uri = %self.owner_uri,
                    batch_id = self.id,
                    result_set_id = result_set.id(),
                    error = %e,
                    "failed to close result set"
                );
            }
        }
    }
}
