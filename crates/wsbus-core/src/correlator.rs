//! Request/reply correlation.
//!
//! Every request gets a fresh correlation id and a one-shot wildcard
//! subscription on the connection that waits for the `ack` envelope carrying
//! that id. The first of {matching reply, timeout, connection shutdown}
//! removes the pending entry; anything arriving afterwards is ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use wsbus_protocol::{Envelope, WILDCARD};

use crate::connection::Connection;
use crate::error::{ConnectionError, ConnectionResult};
use crate::registry::Subscription;

/// Default request window.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct Pending {
    tx: oneshot::Sender<ConnectionResult<Value>>,
    subscription: Option<Subscription>,
}

impl Pending {
    fn discard(&self) {
        if let Some(subscription) = &self.subscription {
            subscription.unsubscribe();
        }
    }

    fn complete(self, outcome: ConnectionResult<Value>) {
        self.discard();
        let _ = self.tx.send(outcome);
    }
}

type PendingTable = Arc<Mutex<HashMap<String, Pending>>>;

/// Removes a request's entry and reply handler when the request ends, however
/// it ends. Covers callers that drop the request future early.
struct PendingGuard {
    table: PendingTable,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let entry = self.table.lock().remove(&self.id);
        if let Some(pending) = entry {
            pending.discard();
        }
    }
}

/// Tracks the outstanding requests of one connection.
pub(crate) struct Correlator {
    pending: PendingTable,
    timeout: Duration,
}

/// Generates a correlation id: a time-ordered prefix followed by random bits.
pub fn correlation_id() -> String {
    Uuid::now_v7().simple().to_string()
}

impl Correlator {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) async fn request<U: Send + Sync + 'static>(
        &self,
        conn: &Connection<U>,
        event: &str,
        payload: Option<Value>,
    ) -> ConnectionResult<Value> {
        if !conn.is_open() {
            return Err(ConnectionError::NotConnected);
        }

        let id = correlation_id();
        let (tx, rx) = oneshot::channel();

        // Registered before the subscription exists so a reply can never miss it.
        self.pending.lock().insert(
            id.clone(),
            Pending {
                tx,
                subscription: None,
            },
        );
        let _guard = PendingGuard {
            table: Arc::clone(&self.pending),
            id: id.clone(),
        };

        let table = Arc::clone(&self.pending);
        let wanted = id.clone();
        let subscription = conn.subscriptions().subscribe_sync(WILDCARD, move |inbound| {
            let envelope = &inbound.envelope;
            if !envelope.answers(&wanted) {
                return Ok(None);
            }
            if let Some(pending) = table.lock().remove(&wanted) {
                let payload = envelope.payload.clone().unwrap_or(Value::Null);
                let outcome = if envelope.error {
                    Err(ConnectionError::Remote(payload))
                } else {
                    Ok(payload)
                };
                pending.complete(outcome);
            }
            Ok(None)
        });

        let unclaimed = match self.pending.lock().get_mut(&id) {
            Some(pending) => {
                pending.subscription = Some(subscription);
                None
            }
            None => Some(subscription),
        };
        if let Some(subscription) = unclaimed {
            // Shut down between insert and subscribe.
            subscription.unsubscribe();
            return Err(ConnectionError::Closed);
        }

        conn.send_envelope(&Envelope::request(event, payload, id.clone()))?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                debug!(event, request_id = %id, "request timed out");
                Err(ConnectionError::Timeout(self.timeout))
            }
        }
    }

    /// Fails every pending request with [`ConnectionError::Closed`] and
    /// returns how many there were.
    pub(crate) fn fail_all(&self) -> usize {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            pending.complete(Err(ConnectionError::Closed));
        }
        count
    }
}
