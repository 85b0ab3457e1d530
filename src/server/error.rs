use thiserror::Error;

use crate::manager::ManagerError;
use crate::protocol::{ProtocolError, error_code};
use crate::source::SourceError;

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Request parameters do not match the method.
    #[error("invalid params: {0}")]
    InvalidParams(serde_json::Error),

    #[error("unknown method {0}")]
    MethodNotFound(String),

    /// The connection could not be opened.
    #[error("connection failed: {0}")]
    Connect(#[from] SourceError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The output stream is gone.
    #[error("output channel closed")]
    Closed,
}

impl ServerError {
    /// JSON-RPC error code reported for this error.
    pub fn code(&self) -> i64 {
        match self {
            ServerError::InvalidParams(_) => error_code::INVALID_PARAMS,
            ServerError::MethodNotFound(_) => error_code::METHOD_NOT_FOUND,
            ServerError::Connect(_) | ServerError::Manager(_) => error_code::SERVER_ERROR,
            ServerError::Protocol(_) | ServerError::Closed => error_code::INTERNAL_ERROR,
        }
    }
}
