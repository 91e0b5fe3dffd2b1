//! Text codec for envelopes.
//!
//! Each transport message carries exactly one JSON-encoded [`Envelope`].
//! The codec performs no validation of the payload shape; any JSON value
//! passes through untouched.

use crate::envelope::Envelope;
use crate::error::{ProtocolError, ProtocolResult};

/// Encodes an envelope to its wire text.
///
/// # Example
///
/// ```rust
/// use wsbus_protocol::{Envelope, encode};
///
/// let text = encode(&Envelope::event("ping", None)).unwrap();
/// assert_eq!(text, r#"{"event":"ping"}"#);
/// ```
pub fn encode(envelope: &Envelope) -> ProtocolResult<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decodes wire text into an envelope.
///
/// Fails when the text is not a JSON object, when `event` is missing or not a
/// string, or when `event` is empty.
pub fn decode(text: &str) -> ProtocolResult<Envelope> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.event.is_empty() {
        return Err(ProtocolError::EmptyEvent);
    }
    Ok(envelope)
}

/// Decodes a binary frame holding UTF-8 JSON text.
pub fn decode_bytes(data: &[u8]) -> ProtocolResult<Envelope> {
    decode(std::str::from_utf8(data)?)
}
