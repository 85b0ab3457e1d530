//! Row buffer storage for result sets.
//!
//! Every result set streams its rows into a row buffer store as they arrive
//! from the driver, and paging requests read arbitrary row windows back out
//! of it later.
//!
//! # Architecture
//!
//! ```text
//! +-------------------+
//! | ResultSet         |  <- single writer (execution path)
//! +-------------------+     many readers (paging, save-as)
//!          |
//!          v
//! +-------------------+
//! | RowStore Trait    |  <- io
//! +-------------------+
//!       /      \
//!      v        v
//! +---------------+ +--------------+
//! | MemoryRowStore| | FileRowStore |
//! +---------------+ +--------------+
//! ```
//!
//! Rows are encoded with [`Row::encode`](crate::row::Row::encode) and
//! addressed by their zero-based offset within the result set.

pub mod error;
pub mod io;

pub use error::StorageError;
pub use io::{
    BufferStore, BufferStoreFactory, FileRowStore, FileRowStoreFactory, MemoryRowStore,
    MemoryRowStoreFactory, RowStore, RowStoreFactory, StoreKey,
};
