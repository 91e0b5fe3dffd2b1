//! Liveness probing.
//!
//! The accepting side sends `ping` to every connection on a fixed period and
//! expects a `pong` before the next tick. The initiating side answers each
//! `ping` and runs a watchdog that closes the connection when pings stop
//! arriving.

use std::time::Duration;

use tracing::trace;

use wsbus_protocol::{PING, PONG};

use crate::connection::Connection;
use crate::registry::{Subscription, Subscriptions};

/// Default probe period.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Default watchdog polling period on the initiating side.
pub const DEFAULT_WATCHDOG_POLL: Duration = Duration::from_millis(300);

/// Answers every `ping` with a `pong` and restarts the watchdog clock.
pub fn install_responder<U: Send + Sync + 'static>(subscriptions: &Subscriptions<U>) -> Subscription {
    subscriptions.subscribe_sync(PING, |inbound| {
        let conn = &inbound.connection;
        conn.record_ping();
        if let Err(e) = conn.send(PONG, None) {
            trace!(conn_id = %conn.id(), error = %e, "pong not sent");
        }
        Ok(None)
    })
}

/// Marks the sending connection alive on every `pong`.
pub fn install_pong_tracker<U: Send + Sync + 'static>(
    subscriptions: &Subscriptions<U>,
) -> Subscription {
    subscriptions.subscribe_sync(PONG, |inbound| {
        inbound.connection.mark_alive();
        Ok(None)
    })
}

/// Runs one probe tick against `conn`.
///
/// A connection that did not answer the previous probe is terminated.
/// Otherwise it is marked pending and sent a new `ping`. Returns true if the
/// connection was terminated.
pub fn probe<U>(conn: &Connection<U>) -> bool {
    if !conn.is_open() {
        return false;
    }
    if !conn.take_alive() {
        conn.terminate();
        return true;
    }
    if let Err(e) = conn.send(PING, None) {
        trace!(conn_id = %conn.id(), error = %e, "ping not sent");
    }
    false
}

/// Returns true once no `ping` has arrived for more than twice the probe
/// period.
pub fn watchdog_expired<U>(conn: &Connection<U>, ping_interval: Duration) -> bool {
    conn.since_last_ping() > ping_interval * 2
}
