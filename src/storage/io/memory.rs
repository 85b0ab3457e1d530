//! In-memory row store implementation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;

use super::{RowStore, RowStoreFactory, StoreKey};
use crate::row::Row;
use crate::storage::error::StorageError;

/// In-memory row store.
///
/// Each row is encoded into its own reference-counted [`Bytes`] buffer and
/// indexed by offset in a `Vec`, giving O(1) random access.
///
/// # Concurrency
///
/// Uses `parking_lot::RwLock` (not `tokio::sync`) because no I/O happens
/// under the lock: the writer pushes a finished buffer, and readers clone
/// the handles of their window and decode after releasing the lock.
pub struct MemoryRowStore {
    /// Encoded rows: offset -> bytes
    rows: RwLock<Vec<Bytes>>,
    /// Number of rows visible to readers
    published: AtomicU64,
    closed: AtomicBool,
}

impl MemoryRowStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryRowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RowStore for MemoryRowStore {
    async fn append_row(&self, row: &Row) -> Result<u64, StorageError> {
        self.ensure_open()?;

        let mut buf = BytesMut::with_capacity(row.encoded_size());
        row.encode(&mut buf);

        let offset = {
            let mut rows = self.rows.write();
            rows.push(buf.freeze());
            rows.len() as u64 - 1
        };
        self.published.store(offset + 1, Ordering::Release);
        Ok(offset)
    }

    async fn read_rows(&self, start: u64, count: u64) -> Result<Vec<Row>, StorageError> {
        self.ensure_open()?;

        let end = start.saturating_add(count).min(self.row_count());
        if start >= end {
            return Ok(Vec::new());
        }

        // The rows are dropped by close, so a window that vanished means closed
        let window: Vec<Bytes> = self
            .rows
            .read()
            .get(start as usize..end as usize)
            .ok_or(StorageError::Closed)?
            .to_vec();
        window
            .into_iter()
            .zip(start..)
            .map(|(mut bytes, row)| {
                Row::decode(&mut bytes).map_err(|source| StorageError::Corrupted { row, source })
            })
            .collect()
    }

    fn row_count(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), StorageError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.rows.write().clear();
        }
        Ok(())
    }
}

/// Factory producing [`MemoryRowStore`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryRowStoreFactory;

impl RowStoreFactory for MemoryRowStoreFactory {
    type Store = MemoryRowStore;

    async fn create(&self, _key: &StoreKey) -> Result<MemoryRowStore, StorageError> {
        Ok(MemoryRowStore::new())
    }
}
