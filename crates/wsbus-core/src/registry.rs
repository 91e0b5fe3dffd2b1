//! Event subscription registry and dispatch.
//!
//! A [`Subscriptions`] table maps event names to ordered handler lists. One
//! table can be shared by every connection of a server, or owned by a single
//! connection. Dispatch is fan-out: every handler registered for the literal
//! event name runs, followed by every handler registered for [`WILDCARD`].
//!
//! Handlers may return a value. When the inbound envelope expects a reply,
//! that value is sent back as an `ack` envelope; a failing handler produces an
//! `error` reply instead.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use wsbus_protocol::{Envelope, WILDCARD};

use crate::connection::Connection;

/// Boxed error returned by handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a handler: an optional reply payload, or a failure.
pub type HandlerResult = Result<Option<Value>, BoxError>;

/// Future returned by asynchronous handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

type SyncHandler<U> = Arc<dyn Fn(&Inbound<U>) -> HandlerResult + Send + Sync>;
type AsyncHandler<U> = Arc<dyn Fn(Inbound<U>) -> HandlerFuture + Send + Sync>;

/// An inbound envelope together with the connection it arrived on.
pub struct Inbound<U = ()> {
    /// The decoded envelope.
    pub envelope: Envelope,
    /// The connection that received it.
    pub connection: Arc<Connection<U>>,
}

impl<U> Clone for Inbound<U> {
    fn clone(&self) -> Self {
        Self {
            envelope: self.envelope.clone(),
            connection: Arc::clone(&self.connection),
        }
    }
}

impl<U> Inbound<U> {
    /// Returns the event name.
    pub fn event(&self) -> &str {
        &self.envelope.event
    }

    /// Returns the raw payload, if any.
    pub fn payload(&self) -> Option<&Value> {
        self.envelope.payload.as_ref()
    }

    /// Deserializes the payload into `T`. An absent payload decodes as `null`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.envelope.payload.clone().unwrap_or(Value::Null))
    }
}

enum Handler<U> {
    Sync(SyncHandler<U>),
    Async(AsyncHandler<U>),
}

impl<U> Clone for Handler<U> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(f) => Self::Sync(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
        }
    }
}

struct Table<U> {
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, Handler<U>)>>,
}

impl<U> Table<U> {
    fn remove(&mut self, event: &str, id: u64) {
        if let Some(list) = self.handlers.get_mut(event) {
            list.retain(|(handler_id, _)| *handler_id != id);
            if list.is_empty() {
                self.handlers.remove(event);
            }
        }
    }
}

/// Handle to a single handler registration.
///
/// Dropping the handle keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    event: String,
    remove: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    /// Returns the event name this handler listens on.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Removes the handler. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        (self.remove)();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .finish()
    }
}

/// Event name to handler table.
///
/// Cloning yields another handle to the same table.
pub struct Subscriptions<U = ()> {
    table: Arc<Mutex<Table<U>>>,
}

impl<U> Clone for Subscriptions<U> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<U: Send + Sync + 'static> Default for Subscriptions<U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U: Send + Sync + 'static> Subscriptions<U> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                next_id: 0,
                handlers: HashMap::new(),
            })),
        }
    }

    /// Registers an asynchronous handler for `event`.
    ///
    /// The handler runs on its own task; its completion does not delay other
    /// handlers or later envelopes.
    pub fn subscribe<F, Fut>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(Inbound<U>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: AsyncHandler<U> =
            Arc::new(move |inbound| -> HandlerFuture { Box::pin(handler(inbound)) });
        self.insert(event.into(), Handler::Async(handler))
    }

    /// Registers a synchronous handler for `event`.
    ///
    /// The handler runs inline during dispatch.
    pub fn subscribe_sync<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Inbound<U>) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(event.into(), Handler::Sync(Arc::new(handler)))
    }

    fn insert(&self, event: String, handler: Handler<U>) -> Subscription {
        let id = {
            let mut table = self.table.lock();
            let id = table.next_id;
            table.next_id += 1;
            table
                .handlers
                .entry(event.clone())
                .or_default()
                .push((id, handler));
            id
        };

        let weak: Weak<Mutex<Table<U>>> = Arc::downgrade(&self.table);
        let key = event.clone();
        Subscription {
            event,
            remove: Box::new(move || {
                if let Some(table) = weak.upgrade() {
                    table.lock().remove(&key, id);
                }
            }),
        }
    }

    /// Returns the number of handlers registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.table
            .lock()
            .handlers
            .get(event)
            .map_or(0, |list| list.len())
    }

    /// Returns the handlers registered under exactly `key`.
    fn handlers_for(&self, key: &str) -> Vec<Handler<U>> {
        self.table
            .lock()
            .handlers
            .get(key)
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default()
    }

    /// Invokes every matching handler for `envelope`.
    ///
    /// The handler list is captured before the first handler runs, so
    /// subscriptions added or removed by a handler only affect later
    /// dispatches.
    pub fn dispatch(&self, envelope: &Envelope, connection: &Arc<Connection<U>>) {
        Self::dispatch_all(&[self], envelope, connection);
    }

    /// Dispatches across several tables as if they were one: the literal
    /// handlers of every table in order, then the wildcard handlers of every
    /// table in order.
    pub fn dispatch_all(tables: &[&Self], envelope: &Envelope, connection: &Arc<Connection<U>>) {
        let event = envelope.event.as_str();
        let mut handlers: Vec<Handler<U>> = tables
            .iter()
            .flat_map(|table| table.handlers_for(event))
            .collect();
        if event != WILDCARD {
            handlers.extend(tables.iter().flat_map(|table| table.handlers_for(WILDCARD)));
        }

        if handlers.is_empty() {
            debug!(event, "no subscribers");
            return;
        }

        for handler in handlers {
            let inbound = Inbound {
                envelope: envelope.clone(),
                connection: Arc::clone(connection),
            };

            match handler {
                Handler::Sync(f) => {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| f(&inbound)))
                        .unwrap_or_else(|panic| Err(panic_message(panic)));
                    settle(&inbound, result);
                }
                Handler::Async(f) => {
                    tokio::spawn(async move {
                        let fut = AssertUnwindSafe(f(inbound.clone())).catch_unwind();
                        let result = fut.await.unwrap_or_else(|panic| Err(panic_message(panic)));
                        settle(&inbound, result);
                    });
                }
            }
        }
    }
}

/// Applies the reply policy to a finished handler invocation.
fn settle<U>(inbound: &Inbound<U>, result: HandlerResult) {
    let envelope = &inbound.envelope;
    let owes_reply = envelope.expects_reply();

    let reply = match result {
        Ok(Some(value)) if owes_reply && !is_empty_reply(&value) => Envelope::reply(envelope, value),
        Ok(_) => return,
        Err(e) => {
            error!(event = %envelope.event, error = %e, "subscriber failed");
            if !owes_reply {
                return;
            }
            let message = e.to_string();
            let message = if message.is_empty() {
                "Unknown error".to_string()
            } else {
                message
            };
            Envelope::error_reply(envelope, message)
        }
    };

    if let Err(e) = inbound.connection.send_envelope(&reply) {
        debug!(event = %envelope.event, error = %e, "reply dropped");
    }
}

/// `null`, `false`, zero and `""` carry nothing worth replying with. Empty
/// arrays and objects do.
fn is_empty_reply(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> BoxError {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    };
    message.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn connection() -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Connection::new((), tx)), rx)
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Text(text) = item {
                out.push(wsbus_protocol::decode(&text).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn fan_out_invokes_every_handler() {
        let subs = Subscriptions::new();
        let (conn, _rx) = connection();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            subs.subscribe_sync("tick", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            });
        }

        subs.dispatch(&Envelope::event("tick", None), &conn);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_others() {
        let subs = Subscriptions::new();
        let (conn, _rx) = connection();
        let calls = Arc::new(AtomicUsize::new(0));

        subs.subscribe_sync("tick", |_| Err("first failed".into()));
        subs.subscribe_sync("tick", |_| panic!("second panicked"));
        let counter = Arc::clone(&calls);
        subs.subscribe_sync("tick", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });

        subs.dispatch(&Envelope::event("tick", None), &conn);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wildcard_runs_after_literal() {
        let subs = Subscriptions::new();
        let (conn, _rx) = connection();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        subs.subscribe_sync(WILDCARD, move |_| {
            o.lock().push("wildcard");
            Ok(None)
        });
        let o = Arc::clone(&order);
        subs.subscribe_sync("chat", move |_| {
            o.lock().push("chat");
            Ok(None)
        });

        subs.dispatch(&Envelope::event("chat", None), &conn);
        subs.dispatch(&Envelope::event("other", None), &conn);
        assert_eq!(*order.lock(), vec!["chat", "wildcard", "wildcard"]);
    }

    #[tokio::test]
    async fn layered_dispatch_runs_all_literals_before_any_wildcard() {
        let own: Subscriptions = Subscriptions::new();
        let shared: Subscriptions = Subscriptions::new();
        let (conn, _rx) = connection();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (table, name) in [(&own, "own"), (&shared, "shared")] {
            for key in [WILDCARD, "chat"] {
                let o = Arc::clone(&order);
                let label = format!("{name}:{key}");
                table.subscribe_sync(key, move |_| {
                    o.lock().push(label.clone());
                    Ok(None)
                });
            }
        }

        Subscriptions::dispatch_all(&[&own, &shared], &Envelope::event("chat", None), &conn);
        assert_eq!(
            *order.lock(),
            vec!["own:chat", "shared:chat", "own:*", "shared:*"]
        );
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let subs = Subscriptions::new();
        let (conn, _rx) = connection();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        let first = subs.subscribe_sync("tick", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });
        let c = Arc::clone(&calls);
        let _second = subs.subscribe_sync("tick", move |_| {
            c.fetch_add(10, Ordering::SeqCst);
            Ok(None)
        });

        first.unsubscribe();
        first.unsubscribe();
        assert_eq!(subs.handler_count("tick"), 1);

        subs.dispatch(&Envelope::event("tick", None), &conn);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn subscription_added_during_dispatch_waits_for_next_pass() {
        let subs: Subscriptions = Subscriptions::new();
        let (conn, _rx) = connection();
        let late_calls = Arc::new(AtomicUsize::new(0));

        let registry = subs.clone();
        let counter = Arc::clone(&late_calls);
        subs.subscribe_sync("tick", move |_| {
            let counter = Arc::clone(&counter);
            registry.subscribe_sync("tick", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            });
            Ok(None)
        });

        subs.dispatch(&Envelope::event("tick", None), &conn);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        subs.dispatch(&Envelope::event("tick", None), &conn);
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reply_owed_sends_ack_with_value() {
        let subs = Subscriptions::new();
        let (conn, mut rx) = connection();

        subs.subscribe_sync("add", |inbound| {
            let args: serde_json::Map<String, Value> = inbound.payload_as()?;
            let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
            Ok(Some(json!(sum)))
        });

        let request = Envelope::request("add", Some(json!({"a": 2, "b": 3})), "r1");
        subs.dispatch(&request, &conn);

        let replies = sent(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0],
            Envelope {
                event: "add".into(),
                payload: Some(json!(5)),
                reply_to: Some("r1".into()),
                ack: true,
                error: false,
            }
        );
    }

    #[tokio::test]
    async fn failing_handler_sends_error_reply() {
        let subs: Subscriptions = Subscriptions::new();
        let (conn, mut rx) = connection();

        subs.subscribe_sync("add", |_| Err("division by zero".into()));
        subs.dispatch(&Envelope::request("add", None, "r2"), &conn);

        let replies = sent(&mut rx);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].ack);
        assert!(replies[0].error);
        assert_eq!(replies[0].reply_to.as_deref(), Some("r2"));
        assert_eq!(replies[0].payload, Some(json!("division by zero")));
    }

    #[tokio::test]
    async fn no_reply_without_reply_to_or_with_ack() {
        let subs: Subscriptions = Subscriptions::new();
        let (conn, mut rx) = connection();

        subs.subscribe_sync("add", |_| Ok(Some(json!(5))));
        subs.dispatch(&Envelope::event("add", None), &conn);

        let ack = Envelope::reply(&Envelope::request("add", None, "r3"), json!(1));
        subs.dispatch(&ack, &conn);

        assert!(sent(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn empty_results_send_nothing() {
        let subs: Subscriptions = Subscriptions::new();
        let (conn, mut rx) = connection();

        subs.subscribe_sync("a", |_| Ok(None));
        subs.subscribe_sync("a", |_| Ok(Some(Value::Null)));
        subs.subscribe_sync("a", |_| Ok(Some(json!(""))));
        subs.subscribe_sync("a", |_| Ok(Some(json!(false))));
        subs.subscribe_sync("a", |_| Ok(Some(json!(0))));
        subs.subscribe_sync("a", |_| Ok(Some(json!(0.0))));
        subs.dispatch(&Envelope::request("a", None, "r4"), &conn);

        assert!(sent(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn non_empty_values_are_replied() {
        let subs: Subscriptions = Subscriptions::new();
        let (conn, mut rx) = connection();

        for value in [json!(true), json!(-1), json!(" "), json!([]), json!({})] {
            subs.subscribe_sync("b", move |_| Ok(Some(value.clone())));
        }
        subs.dispatch(&Envelope::request("b", None, "r5"), &conn);

        let payloads: Vec<_> = sent(&mut rx).into_iter().map(|e| e.payload).collect();
        assert_eq!(
            payloads,
            vec![
                Some(json!(true)),
                Some(json!(-1)),
                Some(json!(" ")),
                Some(json!([])),
                Some(json!({})),
            ]
        );
    }

    #[tokio::test]
    async fn async_handler_replies_after_completion() {
        let subs: Subscriptions = Subscriptions::new();
        let (conn, mut rx) = connection();

        subs.subscribe("slow-echo", |inbound| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(inbound.payload().cloned())
        });

        subs.dispatch(&Envelope::request("slow-echo", Some(json!("hi")), "r5"), &conn);

        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Outbound::Text(text) = reply else {
            panic!("expected text frame");
        };
        let reply = wsbus_protocol::decode(&text).unwrap();
        assert_eq!(reply.payload, Some(json!("hi")));
        assert!(reply.answers("r5"));
    }

    #[tokio::test]
    async fn async_handler_failure_sends_error_reply() {
        let subs: Subscriptions = Subscriptions::new();
        let (conn, mut rx) = connection();

        subs.subscribe("boom", |_| async { Err::<Option<Value>, BoxError>("exploded".into()) });
        subs.dispatch(&Envelope::request("boom", None, "r6"), &conn);

        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Outbound::Text(text) = reply else {
            panic!("expected text frame");
        };
        let reply = wsbus_protocol::decode(&text).unwrap();
        assert!(reply.error);
        assert_eq!(reply.payload, Some(json!("exploded")));
    }
}
