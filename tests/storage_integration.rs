//! Integration tests for the row buffer stores.

use std::sync::Arc;

use querydeck::config::{StorageConfig, StorageKind};
use querydeck::datum::Value;
use querydeck::row::Row;
use querydeck::storage::{
    BufferStore, BufferStoreFactory, FileRowStoreFactory, RowStore, RowStoreFactory,
    StorageError, StoreKey,
};
use tempfile::tempdir;

fn key(result_set_id: usize) -> StoreKey {
    StoreKey {
        owner_uri: "file:///storage.sql".to_string(),
        batch_id: 0,
        result_set_id,
    }
}

fn mixed_row(i: i64) -> Row {
    Row::new(vec![
        Value::Int64(i),
        if i % 3 == 0 {
            Value::Null
        } else {
            Value::Text(format!("row {i}"))
        },
        Value::Float64(i as f64 / 4.0),
        Value::Bytes(vec![i as u8; (i % 5) as usize]),
        Value::Boolean(i % 2 == 0),
    ])
}

/// Generic test runner for any RowStore implementation.
async fn test_store_basic_operations<S: RowStore>(store: S) {
    assert_eq!(store.row_count(), 0);
    assert!(store.read_rows(0, 10).await.unwrap().is_empty());

    for i in 0..100 {
        assert_eq!(store.append_row(&mixed_row(i)).await.unwrap(), i as u64);
    }
    assert_eq!(store.row_count(), 100);

    // Random windows, including ones running past the end
    let rows = store.read_rows(40, 5).await.unwrap();
    assert_eq!(rows, (40..45).map(mixed_row).collect::<Vec<_>>());

    let tail = store.read_rows(97, 50).await.unwrap();
    assert_eq!(tail.len(), 3);
    assert_eq!(tail[2], mixed_row(99));

    assert!(store.read_rows(100, 1).await.unwrap().is_empty());

    store.close().await.unwrap();
    assert!(matches!(
        store.read_rows(0, 1).await,
        Err(StorageError::Closed)
    ));
}

#[tokio::test]
async fn test_memory_backend_basic() {
    let factory = BufferStoreFactory::from_config(&StorageConfig {
        kind: StorageKind::Memory,
        directory: None,
    });
    let store = factory.create(&key(0)).await.unwrap();
    assert!(matches!(store, BufferStore::Memory(_)));
    test_store_basic_operations(store).await;
}

#[tokio::test]
async fn test_file_backend_basic() {
    let dir = tempdir().unwrap();
    let factory = BufferStoreFactory::from_config(&StorageConfig {
        kind: StorageKind::File,
        directory: Some(dir.path().to_path_buf()),
    });
    assert_eq!(factory.directory(), Some(&dir.path().to_path_buf()));

    let store = factory.create(&key(0)).await.unwrap();
    assert!(matches!(store, BufferStore::File(_)));
    test_store_basic_operations(store).await;
}

/// Readers page through a store while the writer is still appending.
async fn test_concurrent_readers<S: RowStore + 'static>(store: S) {
    const ROWS: i64 = 2_000;
    let store = Arc::new(store);

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for i in 0..ROWS {
                store.append_row(&mixed_row(i)).await.unwrap();
                if i % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                let mut checked = 0;
                while checked < ROWS as u64 {
                    let available = store.row_count();
                    if available <= checked {
                        tokio::task::yield_now().await;
                        continue;
                    }
                    let rows = store.read_rows(checked, 50).await.unwrap();
                    // Every published row must be fully readable
                    assert!(!rows.is_empty());
                    for (offset, row) in (checked..).zip(&rows) {
                        assert_eq!(*row, mixed_row(offset as i64));
                    }
                    checked += rows.len() as u64;
                }
            })
        })
        .collect();

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(store.row_count(), ROWS as u64);
}

#[tokio::test]
async fn test_memory_concurrent_readers() {
    let factory = BufferStoreFactory::Memory(Default::default());
    test_concurrent_readers(factory.create(&key(1)).await.unwrap()).await;
}

#[tokio::test]
async fn test_file_concurrent_readers() {
    let dir = tempdir().unwrap();
    let factory = FileRowStoreFactory::new(dir.path());
    test_concurrent_readers(factory.create(&key(1)).await.unwrap()).await;
}

#[tokio::test]
async fn test_file_removed_on_close() {
    let dir = tempdir().unwrap();
    let factory = FileRowStoreFactory::new(dir.path());

    let store = factory.create(&key(2)).await.unwrap();
    store.append_row(&mixed_row(1)).await.unwrap();
    let path = store.path().unwrap();
    assert!(path.exists());

    store.close().await.unwrap();
    assert!(!path.exists());
    assert!(store.path().is_none());

    // Closing twice is a no-op
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_file_removed_on_drop() {
    let dir = tempdir().unwrap();
    let factory = FileRowStoreFactory::new(dir.path());

    let path = {
        let store = factory.create(&key(3)).await.unwrap();
        store.append_row(&mixed_row(1)).await.unwrap();
        store.path().unwrap()
    };
    assert!(!path.exists());
}

#[tokio::test]
async fn test_stores_are_independent() {
    let dir = tempdir().unwrap();
    let factory = FileRowStoreFactory::new(dir.path());

    let first = factory.create(&key(0)).await.unwrap();
    let second = factory.create(&key(0)).await.unwrap();
    first.append_row(&mixed_row(1)).await.unwrap();

    assert_ne!(first.path(), second.path());
    assert_eq!(second.row_count(), 0);
}

/// Paging that races a dispose ends in rows or `Closed`, never a panic.
async fn test_reads_racing_close(factory: &BufferStoreFactory) {
    for round in 0..100 {
        let store = Arc::new(factory.create(&key(round)).await.unwrap());
        for i in 0..32 {
            store.append_row(&mixed_row(i)).await.unwrap();
        }

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    loop {
                        match store.read_rows(0, 32).await {
                            Ok(rows) => assert_eq!(rows.len(), 32),
                            Err(StorageError::Closed) => return,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        store.close().await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_reads_racing_close() {
    test_reads_racing_close(&BufferStoreFactory::Memory(Default::default())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_reads_racing_close() {
    let dir = tempdir().unwrap();
    test_reads_racing_close(&BufferStoreFactory::File(FileRowStoreFactory::new(dir.path())))
        .await;
}
