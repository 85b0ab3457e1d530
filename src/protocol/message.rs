//! JSON-RPC 2.0 messages and the parameter types of each method.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ExecutionSettings;
use crate::manager::CancelOutcome;
use crate::result_set::SaveParams;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes.
pub mod error_code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// A valid request the query service could not carry out.
    pub const SERVER_ERROR: i64 = -32000;
}

/// Request and notification method names.
pub mod method {
    pub const CONNECT: &str = "connection/connect";
    pub const DISCONNECT: &str = "connection/disconnect";
    pub const EXECUTE_STRING: &str = "query/executeString";
    pub const SUBSET: &str = "query/subset";
    pub const CANCEL: &str = "query/cancel";
    pub const DISPOSE: &str = "query/dispose";
    pub const SAVE_CSV: &str = "query/saveCsv";
    pub const SAVE_JSON: &str = "query/saveJson";
    pub const SETTINGS: &str = "query/settings";
    pub const SHUTDOWN: &str = "shutdown";
    pub const EXIT: &str = "exit";

    pub const BATCH_START: &str = "query/batchStart";
    pub const BATCH_COMPLETE: &str = "query/batchComplete";
    pub const RESULT_SET_AVAILABLE: &str = "query/resultSetAvailable";
    pub const RESULT_SET_UPDATED: &str = "query/resultSetUpdated";
    pub const RESULT_SET_COMPLETE: &str = "query/resultSetComplete";
    pub const MESSAGE: &str = "query/message";
    pub const COMPLETE: &str = "query/complete";
    pub const SAVE_COMPLETE: &str = "query/saveComplete";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

/// Any message on the wire.
///
/// Variant order matters for untagged decoding: a request is recognized by
/// having both `id` and `method`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
}

/// `connection/connect`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub owner_uri: String,
    /// SQLite database path, or `:memory:`.
    pub database: String,
}

/// Methods addressing one owner only.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerParams {
    pub owner_uri: String,
}

/// `query/subset`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsetParams {
    pub owner_uri: String,
    pub batch_index: usize,
    pub result_set_index: usize,
    pub rows_start_index: i64,
    pub rows_count: i64,
}

/// `query/saveCsv` and `query/saveJson`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResultsParams {
    pub owner_uri: String,
    pub batch_index: usize,
    pub result_set_index: usize,
    #[serde(flatten)]
    pub save: SaveParams,
}

/// `query/settings`: owner override when `ownerUri` is given, global
/// defaults otherwise. A missing `settings` clears the owner override.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsParams {
    #[serde(default)]
    pub owner_uri: Option<String>,
    #[serde(default)]
    pub settings: Option<ExecutionSettings>,
}

/// Result of `query/cancel`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResult {
    pub outcome: CancelOutcome,
    /// Human readable reason when nothing was canceled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<String>,
}

/// Parameters of `query/saveComplete`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveCompleteParams {
    pub owner_uri: String,
    pub file_path: String,
    /// Set when the save failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
