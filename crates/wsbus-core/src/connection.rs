//! A single protocol session over one transport.
//!
//! A [`Connection`] owns the outbound half of its transport as a queue of
//! [`Outbound`] items. The transport task drains that queue into the socket and
//! feeds inbound text back through [`Connection::handle_text`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use wsbus_protocol::{
    CLOSE_TIMED_OUT, CloseReason, Envelope, ProtocolResult, TIMED_OUT_REASON, decode,
    decode_bytes, encode,
};

use crate::correlator::{Correlator, DEFAULT_REQUEST_TIMEOUT};
use crate::error::{ConnectionError, ConnectionResult};
use crate::registry::{HandlerResult, Inbound, Subscription, Subscriptions};

/// Item queued for the transport writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text frame holding one encoded envelope.
    Text(String),
    /// Close gracefully with the given code.
    Close(CloseReason),
    /// Drop the transport without a close handshake.
    Terminate,
}

/// One peer session.
///
/// `U` is the authenticated user bound to the connection on the accepting
/// side; the initiating side uses `()`.
pub struct Connection<U = ()> {
    id: Uuid,
    remote_addr: Option<String>,
    user: U,
    outbound: mpsc::UnboundedSender<Outbound>,
    open: AtomicBool,
    alive: AtomicBool,
    timed_out: AtomicBool,
    last_ping: Mutex<Instant>,
    subscriptions: Subscriptions<U>,
    correlator: Correlator,
}

impl<U> Connection<U> {
    /// Returns the connection id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the remote address, when known.
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// Returns the authenticated user.
    pub fn user(&self) -> &U {
        &self.user
    }

    /// Returns true while the transport accepts outbound messages.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queues an envelope for the transport.
    pub fn send_envelope(&self, envelope: &Envelope) -> ConnectionResult<()> {
        if !self.is_open() {
            return Err(ConnectionError::NotConnected);
        }
        let text = encode(envelope)?;
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Sends a fire-and-forget event.
    pub fn send(&self, event: &str, payload: Option<Value>) -> ConnectionResult<()> {
        self.send_envelope(&Envelope::event(event, payload))
    }

    /// Starts a graceful close with the given code.
    pub fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!(conn_id = %self.id, code, reason, "closing connection");
            let _ = self
                .outbound
                .send(Outbound::Close(CloseReason::new(code, reason)));
        }
    }

    /// Closes the connection with the timed-out code.
    pub fn close_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
        self.close(CLOSE_TIMED_OUT, TIMED_OUT_REASON);
    }

    /// Drops the transport without a close handshake after a failed liveness
    /// check.
    pub fn terminate(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
        if self.open.swap(false, Ordering::SeqCst) {
            warn!(conn_id = %self.id, "terminating unresponsive connection");
            let _ = self.outbound.send(Outbound::Terminate);
        }
    }

    /// Returns true if the peer answered the last liveness ping.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Records a liveness acknowledgment.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Clears the liveness flag, returning its previous value.
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    /// Returns true if the connection was closed for missing liveness checks.
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Records that a liveness ping was just received.
    pub fn record_ping(&self) {
        *self.last_ping.lock() = Instant::now();
    }

    /// Returns the time since the last ping was received, or since the
    /// connection was created if none arrived yet.
    pub fn since_last_ping(&self) -> Duration {
        self.last_ping.lock().elapsed()
    }

    /// Maps the observed transport closure to the reason reported to
    /// collaborators.
    ///
    /// An abnormal closure that follows a failed liveness check is reported as
    /// a timeout.
    pub fn classify_close(&self, observed: CloseReason) -> CloseReason {
        if observed.is_abnormal() && (self.timed_out() || !self.is_alive()) {
            CloseReason::timed_out()
        } else {
            observed
        }
    }

    /// Marks the connection closed and fails every pending request.
    pub fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        let failed = self.correlator.fail_all();
        if failed > 0 {
            debug!(conn_id = %self.id, failed, "failed pending requests on close");
        }
    }
}

impl<U: Send + Sync + 'static> Connection<U> {
    /// Creates an open connection writing to `outbound`.
    pub fn new(user: U, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr: None,
            user,
            outbound,
            open: AtomicBool::new(true),
            alive: AtomicBool::new(true),
            timed_out: AtomicBool::new(false),
            last_ping: Mutex::new(Instant::now()),
            subscriptions: Subscriptions::new(),
            correlator: Correlator::new(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Builder: set the remote address.
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Builder: set the request window.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.correlator = Correlator::new(timeout);
        self
    }

    /// Returns the connection-scoped subscriptions.
    pub fn subscriptions(&self) -> &Subscriptions<U> {
        &self.subscriptions
    }

    /// Registers a synchronous handler that only sees this connection's
    /// envelopes.
    pub fn subscribe_sync<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Inbound<U>) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscriptions.subscribe_sync(event, handler)
    }

    /// Sends a request and waits for the matching reply.
    pub async fn request(&self, event: &str, payload: Option<Value>) -> ConnectionResult<Value> {
        self.correlator.request(self, event, payload).await
    }

    /// Returns the number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending()
    }

    /// Decodes one inbound text frame and dispatches it.
    ///
    /// Literal handlers run before wildcard ones across both tables:
    /// connection-scoped literal, shared literal, connection-scoped wildcard,
    /// shared wildcard. Malformed frames are logged and dropped.
    pub fn handle_text(self: &Arc<Self>, text: &str, shared: Option<&Subscriptions<U>>) {
        self.handle_decoded(decode(text), shared);
    }

    /// Same as [`handle_text`](Self::handle_text) for a binary frame holding
    /// UTF-8 JSON.
    pub fn handle_binary(self: &Arc<Self>, data: &[u8], shared: Option<&Subscriptions<U>>) {
        self.handle_decoded(decode_bytes(data), shared);
    }

    fn handle_decoded(
        self: &Arc<Self>,
        decoded: ProtocolResult<Envelope>,
        shared: Option<&Subscriptions<U>>,
    ) {
        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "dropping malformed message");
                return;
            }
        };

        match shared {
            Some(shared) => {
                Subscriptions::dispatch_all(&[&self.subscriptions, shared], &envelope, self)
            }
            None => self.subscriptions.dispatch(&envelope, self),
        }
    }
}

impl<U> std::fmt::Debug for Connection<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("open", &self.is_open())
            .field("alive", &self.is_alive())
            .finish()
    }
}
