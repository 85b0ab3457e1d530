//! JSON-RPC protocol spoken by the host binary.
//!
//! Messages travel over stdin/stdout as JSON bodies framed by a
//! `Content-Length` header, as in the Language Server Protocol.
//!
//! ## Architecture
//!
//! ```text
//! +----------+                         +-------------+
//! |  Editor  |  --- Request -------->  |   Server    |
//! |          |  <-- Response --------  | (querydeck) |
//! |          |  <-- Notification ----  |             |
//! +----------+                         +-------------+
//!               ^                   ^
//!               |     RpcCodec      |
//!               +-------------------+
//! ```
//!
//! ## Terminology
//!
//! - **Request**: carries an `id` and expects exactly one Response
//! - **Notification**: no `id`, no reply (query progress, `exit`)
//! - **Codec**: Content-Length framing and JSON (de)serialization

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{DEFAULT_MAX_MESSAGE_SIZE, RpcCodec};
pub use error::ProtocolError;
pub use message::{
    CancelResult, ConnectParams, JSONRPC_VERSION, Message, Notification, OwnerParams, Request,
    RequestId, Response, ResponseError, SaveCompleteParams, SaveResultsParams, SettingsParams,
    SubsetParams, error_code, method,
};
