//! The message envelope exchanged over a wsbus connection.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Message envelope wrapping every protocol message.
///
/// An envelope with `ack` set is a reply to an earlier request and must carry
/// the `reply_to` id of that request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Event name being published or replied to.
    pub event: String,

    /// Application payload. A present JSON `null` is kept as `Some(Value::Null)`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub payload: Option<Value>,

    /// Correlation id of the request this envelope belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// True when this envelope is a reply rather than a new request.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ack: bool,

    /// True when this reply carries a failure description as its payload.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

/// Maps any present value, `null` included, to `Some`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    /// Creates a fire-and-forget event.
    pub fn event(event: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            event: event.into(),
            payload,
            reply_to: None,
            ack: false,
            error: false,
        }
    }

    /// Creates a request expecting a reply correlated by `reply_to`.
    pub fn request(
        event: impl Into<String>,
        payload: Option<Value>,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            reply_to: Some(reply_to.into()),
            ..Self::event(event, payload)
        }
    }

    /// Creates a successful reply to `request`.
    pub fn reply(request: &Envelope, payload: Value) -> Self {
        Self {
            event: request.event.clone(),
            payload: Some(payload),
            reply_to: request.reply_to.clone(),
            ack: true,
            error: false,
        }
    }

    /// Creates a failure reply to `request` carrying `message`.
    pub fn error_reply(request: &Envelope, message: impl Into<String>) -> Self {
        Self {
            event: request.event.clone(),
            payload: Some(Value::String(message.into())),
            reply_to: request.reply_to.clone(),
            ack: true,
            error: true,
        }
    }

    /// Returns true if the sender is waiting for a reply to this envelope.
    pub fn expects_reply(&self) -> bool {
        self.reply_to.is_some() && !self.ack
    }

    /// Returns true if this envelope answers the request with the given id.
    pub fn answers(&self, id: &str) -> bool {
        self.ack && self.reply_to.as_deref() == Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_expects_reply() {
        let env = Envelope::request("add", Some(json!({"a": 2})), "r1");
        assert!(env.expects_reply());
        assert!(!env.answers("r1"));
    }

    #[test]
    fn ack_never_expects_reply() {
        let request = Envelope::request("add", None, "r1");
        let reply = Envelope::reply(&request, json!(5));
        assert!(!reply.expects_reply());
        assert!(reply.answers("r1"));
        assert!(!reply.answers("r2"));
    }

    #[test]
    fn plain_event_expects_nothing() {
        let env = Envelope::event("chat", Some(json!("hi")));
        assert!(!env.expects_reply());
        assert!(env.reply_to.is_none());
    }

    #[test]
    fn error_reply_copies_correlation() {
        let request = Envelope::request("add", None, "r9");
        let reply = Envelope::error_reply(&request, "boom");
        assert_eq!(reply.event, "add");
        assert_eq!(reply.reply_to.as_deref(), Some("r9"));
        assert!(reply.ack);
        assert!(reply.error);
        assert_eq!(reply.payload, Some(json!("boom")));
    }
}
