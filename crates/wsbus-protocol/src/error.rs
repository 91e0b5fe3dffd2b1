//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The text is not a JSON object with a string `event` field.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The `event` field is present but empty.
    #[error("envelope has an empty event name")]
    EmptyEvent,

    /// A binary frame did not contain UTF-8 text.
    #[error("frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}
