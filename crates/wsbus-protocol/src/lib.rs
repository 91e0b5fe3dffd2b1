//! Wire envelope and codec for wsbus.
//!
//! This crate defines the single message shape exchanged between the
//! accepting and initiating sides of a wsbus connection.
//!
//! # Wire format
//!
//! Every WebSocket text frame carries one JSON object:
//!
//! | field     | type    | required | meaning                                   |
//! |-----------|---------|----------|-------------------------------------------|
//! | `event`   | string  | yes      | event name being published or replied to  |
//! | `payload` | any     | no       | application payload                       |
//! | `replyTo` | string  | no       | correlation id                            |
//! | `ack`     | boolean | no       | marks the envelope as a reply             |
//! | `error`   | boolean | no       | marks a reply as carrying a failure       |
//!
//! # Example
//!
//! ```rust
//! use wsbus_protocol::{Envelope, decode, encode};
//!
//! let request = Envelope::request("add", Some(serde_json::json!({"a": 2, "b": 3})), "r1");
//! let text = encode(&request).unwrap();
//! let decoded = decode(&text).unwrap();
//! assert_eq!(decoded, request);
//! ```

mod close;
mod codec;
mod envelope;
mod error;

pub use close::{
    CLOSE_ABNORMAL, CLOSE_NO_STATUS, CLOSE_NORMAL, CLOSE_TIMED_OUT, CloseReason,
    TIMED_OUT_REASON,
};
pub use codec::{decode, decode_bytes, encode};
pub use envelope::Envelope;
pub use error::{ProtocolError, ProtocolResult};

/// Liveness probe event name.
pub const PING: &str = "ping";

/// Liveness acknowledgment event name.
pub const PONG: &str = "pong";

/// Registry key matching every inbound envelope. Never sent on the wire.
pub const WILDCARD: &str = "*";
