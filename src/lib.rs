pub mod batch;
pub mod config;
pub mod datum;
pub mod event;
pub mod logging;
pub mod manager;
pub mod protocol;
pub mod query;
pub mod result_set;
pub mod row;
pub mod server;
pub mod source;
pub mod storage;
