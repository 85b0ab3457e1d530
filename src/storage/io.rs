//! Row store backend implementations.
//!
//! This module provides the [`RowStore`] trait for append-only, randomly
//! readable row storage, along with memory and file backed implementations
//! and an enum that selects between them at runtime.

mod file;
mod memory;

pub use file::{FileRowStore, FileRowStoreFactory};
pub use memory::{MemoryRowStore, MemoryRowStoreFactory};

use std::fmt;
use std::future::Future;
use std::path::PathBuf;

use crate::config::{StorageConfig, StorageKind};
use crate::row::Row;
use crate::storage::error::StorageError;

/// Identifies the result set a store belongs to.
///
/// Backends may use the key to name their backing medium; it carries no
/// other meaning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    /// Owner URI of the query.
    pub owner_uri: String,
    /// Ordinal of the batch within its query.
    pub batch_id: usize,
    /// Ordinal of the result set within its batch.
    pub result_set_id: usize,
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}.{}",
            self.owner_uri, self.batch_id, self.result_set_id
        )
    }
}

/// Append-only row storage with random-access reads.
///
/// # Design Decisions
///
/// 1. **Single writer, many readers**: exactly one task appends rows (the
///    execution path) while any number of paging requests read concurrently.
///    Implementations must never make the writer wait for a reader.
///
/// 2. **Publish after write**: a row becomes visible to readers (through
///    [`row_count()`](Self::row_count) and [`read_rows()`](Self::read_rows))
///    only after all of its bytes have been written.
///
/// 3. **Immutable rows**: once appended, the bytes of row N never change.
///
/// 4. **Clamped reads**: reading past the published row count returns fewer
///    rows (possibly none) rather than waiting.
///
/// # Thread Safety
///
/// Implementations must be thread-safe (Sync + Send).
pub trait RowStore: Send + Sync {
    /// Appends a row and returns its zero-based offset.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Closed` after [`close()`](Self::close).
    /// Returns `StorageError::Io` if the backing medium fails.
    fn append_row(&self, row: &Row) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Reads up to `count` rows starting at offset `start`.
    ///
    /// Returns fewer rows when the window extends past the published rows.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Closed` after [`close()`](Self::close).
    /// Returns `StorageError::Corrupted` if stored bytes fail to decode.
    fn read_rows(
        &self,
        start: u64,
        count: u64,
    ) -> impl Future<Output = Result<Vec<Row>, StorageError>> + Send;

    /// Returns the number of rows visible to readers.
    fn row_count(&self) -> u64;

    /// Releases the backing medium. Further appends and reads fail.
    ///
    /// Closing twice is a no-op.
    fn close(&self) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Creates one row store per result set.
pub trait RowStoreFactory: Send + Sync + 'static {
    /// The store type produced by this factory.
    type Store: RowStore + 'static;

    /// Creates an empty store for the given result set.
    fn create(
        &self,
        key: &StoreKey,
    ) -> impl Future<Output = Result<Self::Store, StorageError>> + Send;
}

/// A row store whose backend is chosen at runtime.
pub enum BufferStore {
    Memory(MemoryRowStore),
    File(FileRowStore),
}

impl RowStore for BufferStore {
    async fn append_row(&self, row: &Row) -> Result<u64, StorageError> {
        match self {
            BufferStore::Memory(store) => store.append_row(row).await,
            BufferStore::File(store) => store.append_row(row).await,
        }
    }

    async fn read_rows(&self, start: u64, count: u64) -> Result<Vec<Row>, StorageError> {
        match self {
            BufferStore::Memory(store) => store.read_rows(start, count).await,
            BufferStore::File(store) => store.read_rows(start, count).await,
        }
    }

    fn row_count(&self) -> u64 {
        match self {
            BufferStore::Memory(store) => store.row_count(),
            BufferStore::File(store) => store.row_count(),
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        match self {
            BufferStore::Memory(store) => store.close().await,
            BufferStore::File(store) => store.close().await,
        }
    }
}

/// Factory for [`BufferStore`], configured from `[storage]`.
#[derive(Debug, Clone)]
pub enum BufferStoreFactory {
    Memory(MemoryRowStoreFactory),
    File(FileRowStoreFactory),
}

impl BufferStoreFactory {
    /// Builds the factory selected by the storage configuration.
    ///
    /// The file backend uses `config.directory`, falling back to the OS
    /// temporary directory.
    pub fn from_config(config: &StorageConfig) -> Self {
        match config.kind {
            StorageKind::Memory => BufferStoreFactory::Memory(MemoryRowStoreFactory),
            StorageKind::File => {
                let directory = config
                    .directory
                    .clone()
                    .unwrap_or_else(std::env::temp_dir);
                BufferStoreFactory::File(FileRowStoreFactory::new(directory))
            }
        }
    }

    /// Returns the directory used by the file backend, if any.
    pub fn directory(&self) -> Option<&PathBuf> {
        match self {
            BufferStoreFactory::Memory(_) => None,
            BufferStoreFactory::File(factory) => Some(factory.directory()),
        }
    }
}

impl RowStoreFactory for BufferStoreFactory {
    type Store = BufferStore;

    async fn create(&self, key: &StoreKey) -> Result<BufferStore, StorageError> {
        match self {
            BufferStoreFactory::Memory(factory) => {
                Ok(BufferStore::Memory(factory.create(key).await?))
            }
            BufferStoreFactory::File(factory) => Ok(BufferStore::File(factory.create(key).await?)),
        }
    }
}

/// Shared test helpers run against every backend.
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::datum::Value;
    use std::sync::Arc;

    pub fn key(result_set_id: usize) -> StoreKey {
        StoreKey {
            owner_uri: "file:///tests/query.sql".to_string(),
            batch_id: 0,
            result_set_id,
        }
    }

    pub fn test_row(i: i64) -> Row {
        Row::new(vec![
            Value::Int64(i),
            Value::Text(format!("row {}", i)),
            if i % 3 == 0 { Value::Null } else { Value::Float64(i as f64 / 2.0) },
        ])
    }

    pub async fn test_append_and_read<S: RowStore>(store: S) {
        assert_eq!(store.row_count(), 0);
        for i in 0..10 {
            assert_eq!(store.append_row(&test_row(i)).await.unwrap(), i as u64);
        }
        assert_eq!(store.row_count(), 10);

        let rows = store.read_rows(3, 4).await.unwrap();
        assert_eq!(rows, (3..7).map(test_row).collect::<Vec<_>>());

        // Window past the end is clamped
        let rows = store.read_rows(8, 5).await.unwrap();
        assert_eq!(rows, vec![test_row(8), test_row(9)]);
        assert!(store.read_rows(10, 1).await.unwrap().is_empty());
    }

    pub async fn test_read_while_writing<S: RowStore + 'static>(store: S) {
        let store = Arc::new(store);
        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 0..500 {
                    store.append_row(&test_row(i)).await.unwrap();
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        // Every observed window is a consistent prefix of the final data
        for _ in 0..20 {
            let visible = store.row_count();
            let rows = store.read_rows(0, visible).await.unwrap();
            assert_eq!(rows.len() as u64, visible);
            for (i, row) in rows.iter().enumerate() {
                assert_eq!(row, &test_row(i as i64));
            }
            tokio::task::yield_now().await;
        }

        writer.await.unwrap();
        assert_eq!(store.row_count(), 500);
    }

    /// Readers paging while the store is closed see rows or `Closed`.
    pub async fn test_read_racing_close<S: RowStore + 'static>(store: S) {
        for i in 0..64 {
            store.append_row(&test_row(i)).await.unwrap();
        }
        let store = Arc::new(store);

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    loop {
                        match store.read_rows(0, 64).await {
                            Ok(rows) => assert_eq!(rows.len(), 64),
                            Err(StorageError::Closed) => break,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        tokio::task::yield_now().await;
        store.close().await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    pub async fn test_closed<S: RowStore>(store: S) {
        store.append_row(&test_row(0)).await.unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.append_row(&test_row(1)).await,
            Err(StorageError::Closed)
        ));
        assert!(matches!(
            store.read_rows(0, 1).await,
            Err(StorageError::Closed)
        ));
    }
}
