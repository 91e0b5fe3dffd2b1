//! Connection, subscription and request/reply machinery shared by the wsbus
//! server and client.
//!
//! Both ends of a link hold a [`Connection`]. Inbound text frames are decoded
//! and fanned out to [`Subscriptions`]; [`Connection::request`] sends an
//! envelope carrying a correlation id and waits for the matching `ack`.

pub mod connection;
mod correlator;
pub mod error;
pub mod heartbeat;
pub mod registry;
pub mod tracing;

pub use connection::{Connection, Outbound};
pub use correlator::{DEFAULT_REQUEST_TIMEOUT, correlation_id};
pub use error::{ConnectionError, ConnectionResult};
pub use heartbeat::{DEFAULT_PING_INTERVAL, DEFAULT_WATCHDOG_POLL};
pub use registry::{BoxError, HandlerFuture, HandlerResult, Inbound, Subscription, Subscriptions};
pub use self::tracing::{LogConfig, LogFormat, TracingError, init_tracing};
