use thiserror::Error;

/// Framing and message errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A header line is not `Name: value` or is not UTF-8.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// The header block has no `Content-Length`.
    #[error("missing Content-Length header")]
    MissingContentLength,

    /// The announced body exceeds the configured maximum.
    #[error("message of {size} bytes exceeds the limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// The body is not a JSON-RPC message.
    #[error("invalid message body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
