//! Result sets.
//!
//! A [`ResultSet`] holds the output of one statement: its column schema and
//! a row buffer store the rows are streamed into as the driver returns them.
//! Paging requests read arbitrary windows back while the result set is still
//! being filled.
//!
//! # Notifications
//!
//! While reading, a result set emits, in this order:
//!
//! ```text
//! available (first row, or completion of an empty result)
//!   -> updated (every `update_interval` rows, zero or more times)
//!   -> completed
//! ```

mod error;
mod save;

pub use error::ResultSetError;
pub use save::{SaveCallback, SaveFormat, SaveParams, save_callback};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ExecutionSettings;
use crate::event::{EventBody, EventSubscribers};
use crate::source::{ColumnInfo, Cursor, ResultHeader, SourceError, is_query_plan};
use crate::storage::{RowStore, RowStoreFactory, StoreKey};

/// Client rendering hints for a result set.
///
/// Flags from several result sets are merged with
/// [`combine`](Self::combine), which ORs them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecialAction {
    /// The result set is a query plan.
    pub execution_plan: bool,
    /// The result set is a single `FOR XML` column.
    pub xml: bool,
    /// The result set is a single `FOR JSON` column.
    pub json: bool,
}

impl SpecialAction {
    /// Derives the flags from a result set header.
    pub fn from_header(header: &ResultHeader) -> Self {
        let single = match header.columns.as_slice() {
            [column] => Some(column),
            _ => None,
        };
        Self {
            execution_plan: header.is_plan || is_query_plan(&header.columns),
            xml: single.is_some_and(|c| c.is_xml_result()),
            json: single.is_some_and(|c| c.is_json_result()),
        }
    }

    /// Returns true if no flag is set.
    pub fn is_none(&self) -> bool {
        *self == Self::default()
    }

    /// ORs two sets of flags.
    pub fn combine(self, other: SpecialAction) -> SpecialAction {
        SpecialAction {
            execution_plan: self.execution_plan || other.execution_plan,
            xml: self.xml || other.xml,
            json: self.json || other.json,
        }
    }
}

/// Snapshot of a result set for notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSetSummary {
    pub id: usize,
    pub batch_id: usize,
    pub row_count: u64,
    pub complete: bool,
    pub column_info: Vec<ColumnInfo>,
    pub special_action: SpecialAction,
}

/// One cell of a paged row, ready for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCellValue {
    pub display_value: String,
    pub is_null: bool,
    pub row_id: u64,
}

/// A window of rows returned by [`ResultSet::get_subset`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSubset {
    pub row_count: usize,
    pub rows: Vec<Vec<DbCellValue>>,
}

/// Limits applied while reading a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Rows past this count are read from the driver but not stored.
    pub row_limit: Option<u64>,
    /// Rows between two `updated` notifications.
    pub update_interval: u64,
}

impl From<&ExecutionSettings> for ReadOptions {
    fn from(settings: &ExecutionSettings) -> Self {
        Self {
            row_limit: settings.row_limit(),
            update_interval: settings.update_interval(),
        }
    }
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self::from(&ExecutionSettings::default())
    }
}

/// The output of one statement.
pub struct ResultSet<S> {
    key: StoreKey,
    columns: Vec<ColumnInfo>,
    special_action: SpecialAction,
    store: S,
    complete: AtomicBool,
    saves: Mutex<HashSet<PathBuf>>,
}

impl<S: RowStore> ResultSet<S> {
    /// Creates an empty result set with a fresh store from `factory`.
    pub async fn create<F>(
        factory: &F,
        key: StoreKey,
        header: ResultHeader,
    ) -> Result<Self, ResultSetError>
    where
        F: RowStoreFactory<Store = S>,
    {
        let store = factory.create(&key).await?;
        Ok(Self::with_store(key, header, store))
    }

    /// Creates an empty result set on an existing store.
    pub fn with_store(key: StoreKey, header: ResultHeader, store: S) -> Self {
        Self {
            special_action: SpecialAction::from_header(&header),
            columns: header.columns,
            key,
            store,
            complete: AtomicBool::new(false),
            saves: Mutex::new(HashSet::new()),
        }
    }

    /// Ordinal within the batch.
    pub fn id(&self) -> usize {
        self.key.result_set_id
    }

    /// Ordinal of the owning batch.
    pub fn batch_id(&self) -> usize {
        self.key.batch_id
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    /// Rows stored and readable so far.
    pub fn row_count(&self) -> u64 {
        self.store.row_count()
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn special_action(&self) -> SpecialAction {
        self.special_action
    }

    pub fn summary(&self) -> ResultSetSummary {
        ResultSetSummary {
            id: self.id(),
            batch_id: self.batch_id(),
            row_count: self.row_count(),
            complete: self.is_complete(),
            column_info: self.columns.clone(),
            special_action: self.special_action,
        }
    }

    /// Reads the cursor's current result set to its end.
    ///
    /// Rows are appended to the store one by one and become readable through
    /// [`get_subset`](Self::get_subset) as soon as they are written. The
    /// result set is marked complete however reading ends.
    ///
    /// # Errors
    ///
    /// Returns `ResultSetError::Cancelled` if `cancel` fires; rows read so far
    /// are kept. Returns `ResultSetError::Source` if the driver fails.
    pub async fn read_to_end<C: Cursor>(
        &self,
        cursor: &mut C,
        options: ReadOptions,
        cancel: &CancellationToken,
        events: &EventSubscribers,
    ) -> Result<(), ResultSetError> {
        let interval = options.update_interval.max(1);
        let mut announced = false;
        let mut skipped = 0u64;

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(ResultSetError::Cancelled),
                next = cursor.next_row() => next,
            };

            let row = match next {
                Ok(Some(row)) => row,
                Ok(None) => break Ok(()),
                Err(SourceError::Cancelled) => break Err(ResultSetError::Cancelled),
                Err(e) => break Err(e.into()),
            };

            if options.row_limit.is_some_and(|limit| self.row_count() >= limit) {
                skipped += 1;
                continue;
            }

            if let Err(e) = self.store.append_row(&row).await {
                break Err(e.into());
            }

            let count = self.row_count();
            if !announced {
                announced = true;
                events
                    .emit(EventBody::ResultSetAvailable(self.summary()))
                    .await;
            } else if count % interval == 0 {
                events.emit(EventBody::ResultSetUpdated(self.summary())).await;
            }
        };

        if skipped > 0 {
            debug!(key = %self.key, skipped, "row limit reached, rows not stored");
        }

        self.complete.store(true, Ordering::Release);
        if !announced {
            events
                .emit(EventBody::ResultSetAvailable(self.summary()))
                .await;
        }
        events
            .emit(EventBody::ResultSetCompleted(self.summary()))
            .await;

        outcome
    }

    /// Reads a window of rows rendered for display.
    ///
    /// `count` is clamped to the rows available after `start`.
    ///
    /// # Errors
    ///
    /// Returns `ResultSetError::OutOfRange` if `start` is negative or not
    /// below the available row count, or if `count` is not positive.
    pub async fn get_subset(&self, start: i64, count: i64) -> Result<ResultSubset, ResultSetError> {
        let available = self.row_count();
        if start < 0 || count <= 0 || start as u64 >= available {
            return Err(ResultSetError::OutOfRange {
                start,
                count,
                available,
            });
        }

        let start = start as u64;
        let count = (count as u64).min(available - start);
        let rows = self.store.read_rows(start, count).await?;

        let rows: Vec<Vec<DbCellValue>> = rows
            .into_iter()
            .zip(start..)
            .map(|(row, row_id)| {
                row.values
                    .iter()
                    .map(|value| DbCellValue {
                        display_value: value.to_display(),
                        is_null: value.is_null(),
                        row_id,
                    })
                    .collect()
            })
            .collect();

        Ok(ResultSubset {
            row_count: rows.len(),
            rows,
        })
    }

    /// Releases the row store.
    pub async fn close(&self) -> Result<(), ResultSetError> {
        self.store.close().await?;
        Ok(())
    }
}

impl<S: RowStore + 'static> ResultSet<S> {
    /// Starts saving the rows to a file in the background.
    ///
    /// `on_complete` receives the outcome of the save. Only one save per
    /// destination path may run at a time.
    ///
    /// # Errors
    ///
    /// Returns `ResultSetError::NotComplete` while rows are still being read
    /// and `ResultSetError::SaveInProgress` if the destination is busy.
    pub fn save_as(
        self: &Arc<Self>,
        params: SaveParams,
        on_complete: SaveCallback,
    ) -> Result<(), ResultSetError> {
        if !self.is_complete() {
            return Err(ResultSetError::NotComplete);
        }

        let path = params.file_path.clone();
        if !self.saves.lock().insert(path.clone()) {
            return Err(ResultSetError::SaveInProgress(path));
        }

        let result_set = self.clone();
        tokio::spawn(async move {
            let outcome = save::write_results(&result_set, &params).await;
            result_set.saves.lock().remove(&path);

            match &outcome {
                Ok(path) => debug!(key = %result_set.key, path = %path.display(), "saved results"),
                Err(e) => warn!(key = %result_set.key, error = %e, "failed to save results"),
            }
            on_complete(outcome).await;
        });

        Ok(())
    }

    /// Returns true if a save to `path` is running.
    pub fn is_saving(&self, path: &std::path::Path) -> bool {
        self.saves.lock().contains(path)
    }
}
