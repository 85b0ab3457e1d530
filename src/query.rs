//! Queries.
//!
//! A [`Query`] is one execution request: the submitted text split into
//! batches, the connection they run on and the settings in force. Batches
//! run strictly in order. A batch with driver errors does not stop the
//! sequence; cancellation or an infrastructure failure does.
//!
//! # State Machine
//!
//! ```text
//! NotStarted --execute--> Running --+--> Completed
//!                                   +--> Failed
//!                                   +--> Cancelled
//! ```
//!
//! Each transition happens once. A terminal query only changes again when it
//! is disposed.

mod error;
mod split;

pub use error::QueryError;
pub use split::{BatchDefinition, split_batches};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{Batch, BatchOutcome, BatchSummary};
use crate::config::ExecutionSettings;
use crate::event::{EventBody, EventSender, EventSubscribers};
use crate::result_set::{ResultSet, ResultSubset};
use crate::source::DataSource;
use crate::storage::RowStoreFactory;

/// Lifecycle state of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryState {
    NotStarted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueryState::Completed | QueryState::Failed | QueryState::Cancelled
        )
    }
}

struct Lifecycle {
    state: QueryState,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

/// One execution request and its batches.
pub struct Query<D, F: RowStoreFactory> {
    owner_uri: String,
    text: String,
    batches: Vec<Arc<Batch<F::Store>>>,
    source: Arc<D>,
    factory: Arc<F>,
    settings: ExecutionSettings,
    cancel: CancellationToken,
    events: EventSubscribers,
    lifecycle: Mutex<Lifecycle>,
}

impl<D: DataSource, F: RowStoreFactory> Query<D, F> {
    /// Creates a query, splitting `text` into batches.
    pub fn new(
        owner_uri: impl Into<String>,
        text: impl Into<String>,
        source: Arc<D>,
        factory: Arc<F>,
        settings: ExecutionSettings,
    ) -> Self {
        let owner_uri = owner_uri.into();
        let text = text.into();
        let batches = split_batches(&text)
            .into_iter()
            .enumerate()
            .map(|(id, definition)| {
                Arc::new(Batch::new(
                    id,
                    owner_uri.clone(),
                    definition.sql,
                    definition.selection,
                    definition.execution_count,
                ))
            })
            .collect();

        Self {
            events: EventSubscribers::new(owner_uri.clone()),
            owner_uri,
            text,
            batches,
            source,
            factory,
            settings,
            cancel: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: QueryState::NotStarted,
                start_time: None,
                end_time: None,
            }),
        }
    }

    pub fn owner_uri(&self) -> &str {
        &self.owner_uri
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Settings snapshot taken when the query was created.
    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    pub fn batches(&self) -> &[Arc<Batch<F::Store>>] {
        &self.batches
    }

    pub fn state(&self) -> QueryState {
        self.lifecycle.lock().state
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.lifecycle.lock().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.lifecycle.lock().end_time
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// True once execution has finished, whatever the outcome.
    pub fn has_executed(&self) -> bool {
        self.is_terminal()
    }

    pub fn has_cancelled(&self) -> bool {
        self.state() == QueryState::Cancelled
    }

    /// True if the query failed or any batch recorded an error.
    pub fn has_errored(&self) -> bool {
        self.state() == QueryState::Failed || self.batches.iter().any(|b| b.has_error())
    }

    /// Adds an event sender. Senders are called in the order they were added.
    pub fn subscribe(&self, sender: Arc<dyn EventSender>) {
        self.events.subscribe(sender);
    }

    pub fn batch_summaries(&self) -> Vec<BatchSummary> {
        self.batches.iter().map(|b| b.summary()).collect()
    }

    /// Runs every batch in order.
    ///
    /// Emits `query_completed` with all batch summaries when done, whatever
    /// the outcome, and returns the terminal state.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::AlreadyExecuted` if the query was started before.
    pub async fn execute(&self) -> Result<QueryState, QueryError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != QueryState::NotStarted {
                return Err(QueryError::AlreadyExecuted);
            }
            lifecycle.state = QueryState::Running;
            lifecycle.start_time = Some(Utc::now());
        }
        info!(owner_uri = %self.owner_uri, batches = self.batches.len(), "query started");

        let mut state = QueryState::Completed;
        for batch in &self.batches {
            if self.cancel.is_cancelled() {
                state = QueryState::Cancelled;
                break;
            }

            let outcome = batch
                .execute(
                    &*self.source,
                    &*self.factory,
                    &self.settings,
                    &self.cancel,
                    &self.events,
                )
                .await;
            match outcome {
                Ok(BatchOutcome::Completed) => {}
                Ok(BatchOutcome::Cancelled) => {
                    state = QueryState::Cancelled;
                    break;
                }
                Ok(BatchOutcome::Failed) => {
                    state = QueryState::Failed;
                    break;
                }
                Err(e) => {
                    warn!(owner_uri = %self.owner_uri, batch_id = batch.id(), error = %e, "batch could not run");
                    state = QueryState::Failed;
                    break;
                }
            }
        }
        if state == QueryState::Completed && self.batches.iter().any(|b| b.has_error()) {
            state = QueryState::Failed;
        }

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = state;
            lifecycle.end_time = Some(Utc::now());
        }
        info!(owner_uri = %self.owner_uri, ?state, "query finished");
        self.events
            .emit(EventBody::QueryCompleted(self.batch_summaries()))
            .await;

        Ok(state)
    }

    /// Requests cancellation.
    ///
    /// Running work stops at its next checkpoint; a query that has not
    /// started yet will not run any batch.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::AlreadyCompleted` if the query is terminal.
    pub fn cancel(&self) -> Result<(), QueryError> {
        if self.is_terminal() {
            return Err(QueryError::AlreadyCompleted);
        }
        debug!(owner_uri = %self.owner_uri, "cancel requested");
        self.cancel.cancel();
        Ok(())
    }

    fn batch(&self, batch_id: usize) -> Result<&Arc<Batch<F::Store>>, QueryError> {
        self.batches
            .get(batch_id)
            .ok_or(QueryError::BatchOutOfRange {
                batch_id,
                count: self.batches.len(),
            })
    }

    /// Reads a window of rows from one result set.
    pub async fn get_subset(
        &self,
        batch_id: usize,
        result_set_id: usize,
        start: i64,
        count: i64,
    ) -> Result<ResultSubset, QueryError> {
        Ok(self
            .batch(batch_id)?
            .get_subset(result_set_id, start, count)
            .await?)
    }

    /// Returns one result set, e.g. to save it.
    pub fn result_set(
        &self,
        batch_id: usize,
        result_set_id: usize,
    ) -> Result<Arc<ResultSet<F::Store>>, QueryError> {
        let batch = self.batch(batch_id)?;
        batch
            .result_set(result_set_id)
            .ok_or_else(|| {
                QueryError::Batch(crate::batch::BatchError::ResultSetOutOfRange {
                    result_set_id,
                    count: batch.result_set_count(),
                })
            })
    }

    /// Cancels the query if it still runs and releases every row store.
    pub async fn dispose(&self) {
        if !self.is_terminal() {
            self.cancel.cancel();
        }
        for batch in &self.batches {
            batch.close().await;
        }
        debug!(owner_uri = %self.owner_uri, "query disposed");
    }
}
