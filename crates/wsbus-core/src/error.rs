//! Connection error types.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use wsbus_protocol::ProtocolError;

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Errors surfaced to callers of `send` and `request`.
///
/// A request ends in exactly one of: a reply value, [`ConnectionError::Remote`],
/// [`ConnectionError::Timeout`] or [`ConnectionError::Closed`].
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection is not open.
    #[error("not connected")]
    NotConnected,

    /// No matching reply arrived within the request window.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The remote handler failed; the payload describes the failure.
    #[error("remote error: {0}")]
    Remote(Value),

    /// The connection closed while the request was pending.
    #[error("connection closed before a reply arrived")]
    Closed,

    /// The envelope could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    /// Returns true for request timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns the remote failure message, if this is a remote error.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Self::Remote(Value::String(message)) => Some(message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timeout_display() {
        let err = ConnectionError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "request timed out after 30000ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn remote_message() {
        let err = ConnectionError::Remote(json!("bad input"));
        assert_eq!(err.remote_message(), Some("bad input"));
        assert_eq!(err.to_string(), "remote error: \"bad input\"");
        assert!(!err.is_timeout());

        assert_eq!(ConnectionError::Remote(json!({"code": 1})).remote_message(), None);
    }
}
