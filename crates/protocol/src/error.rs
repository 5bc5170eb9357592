//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload field was not valid base64
    #[error("Invalid payload encoding: {0}")]
    InvalidPayload(#[from] base64::DecodeError),

    /// JSON body could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
