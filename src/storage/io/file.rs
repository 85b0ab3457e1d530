//! File-backed row store implementation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tempfile::TempPath;
use tokio::fs::File as TokioFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{RowStore, RowStoreFactory, StoreKey};
use crate::row::Row;
use crate::storage::error::StorageError;

/// Location of one encoded row inside the backing file.
#[derive(Debug, Clone, Copy)]
struct RowExtent {
    offset: u64,
    len: u64,
}

/// Writer-side state: the append handle and the current end of file.
struct WriterState {
    file: TokioFile,
    end: u64,
}

/// File-backed row store.
///
/// Rows are appended back to back to a temporary file; an in-memory index
/// of byte extents gives O(1) random access. The file is deleted when the
/// store is closed or dropped.
///
/// # File Layout
///
/// ```text
/// +-----------+-----------+-----------+
/// | Row 0     | Row 1     | Row 2     | ...
/// +-----------+-----------+-----------+
/// ^ extent[0] ^ extent[1] ^ extent[2]
/// ```
///
/// # Concurrency
///
/// The writer and readers use separate file handles, each behind its own
/// async mutex, so a slow reader never holds up the writer. A row's extent
/// is added to the index only after its bytes were flushed.
pub struct FileRowStore {
    path: parking_lot::Mutex<Option<TempPath>>,
    writer: Mutex<Option<WriterState>>,
    reader: Mutex<Option<TokioFile>>,
    index: parking_lot::RwLock<Vec<RowExtent>>,
    published: AtomicU64,
    closed: AtomicBool,
}

impl FileRowStore {
    /// Creates a store on a fresh temporary file in `directory`.
    ///
    /// `prefix` is used for the file name only.
    pub async fn create_in(directory: &Path, prefix: &str) -> Result<Self, StorageError> {
        let named = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".rows")
            .tempfile_in(directory)?;
        let (file, path) = named.into_parts();
        let reader = TokioFile::open(&path).await?;

        debug!(path = %path.display(), "created row store file");

        Ok(Self {
            path: parking_lot::Mutex::new(Some(path)),
            writer: Mutex::new(Some(WriterState {
                file: TokioFile::from_std(file),
                end: 0,
            })),
            reader: Mutex::new(Some(reader)),
            index: parking_lot::RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the path of the backing file, or `None` once closed.
    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().as_ref().map(|p| p.to_path_buf())
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl RowStore for FileRowStore {
    async fn append_row(&self, row: &Row) -> Result<u64, StorageError> {
        self.ensure_open()?;

        let mut buf = BytesMut::with_capacity(row.encoded_size());
        row.encode(&mut buf);

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(StorageError::Closed)?;
        writer.file.write_all(&buf).await?;
        writer.file.flush().await?;

        let extent = RowExtent {
            offset: writer.end,
            len: buf.len() as u64,
        };
        writer.end += extent.len;

        let offset = {
            let mut index = self.index.write();
            index.push(extent);
            index.len() as u64 - 1
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

        // The index is emptied by close, so a window that vanished means closed
        let extents: Vec<RowExtent> = self
            .index
            .read()
            .get(start as usize..end as usize)
            .ok_or(StorageError::Closed)?
            .to_vec();
        let first = extents[0].offset;
        let total: u64 = extents.iter().map(|e| e.len).sum();

        // Rows are contiguous, so the whole window is one read
        let mut buf = vec![0u8; total as usize];
        {
            let mut guard = self.reader.lock().await;
            let reader = guard.as_mut().ok_or(StorageError::Closed)?;
            reader.seek(std::io::SeekFrom::Start(first)).await?;
            reader.read_exact(&mut buf).await?;
        }

        let mut bytes = Bytes::from(buf);
        let mut rows = Vec::with_capacity(extents.len());
        for (extent, row) in extents.iter().zip(start..) {
            let mut slice = bytes.split_to(extent.len as usize);
            rows.push(
                Row::decode(&mut slice)
                    .map_err(|source| StorageError::Corrupted { row, source })?,
            );
        }
        Ok(rows)
    }

    fn row_count(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.writer.lock().await.take();
        self.reader.lock().await.take();
        self.index.write().clear();

        let path = self.path.lock().take();
        if let Some(path) = path {
            let shown = path.display().to_string();
            if let Err(e) = path.close() {
                warn!(path = %shown, error = %e, "failed to remove row store file");
                return Err(e.into());
            }
            debug!(path = %shown, "removed row store file");
        }
        Ok(())
    }
}

/// Factory producing [`FileRowStore`]s in a fixed directory.
#[derive(Debug, Clone)]
pub struct FileRowStoreFactory {
    directory: PathBuf,
}

impl FileRowStoreFactory {
    /// Creates a factory that places store files in `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Returns the directory store files are created in.
    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }
}

impl RowStoreFactory for FileRowStoreFactory {
    type Store = FileRowStore;

    async fn create(&self, key: &StoreKey) -> Result<FileRowStore, StorageError> {
        let prefix = format!("querydeck-{}-{}-", key.batch_id, key.result_set_id);
        FileRowStore::create_in(&self.directory, &prefix).await
    }
}
