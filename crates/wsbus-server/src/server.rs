//! The accepting side of a wsbus link.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use wsbus_core::heartbeat::{install_pong_tracker, probe};
use wsbus_core::{Connection, HandlerResult, Inbound, Outbound, Subscription, Subscriptions};
use wsbus_protocol::{CLOSE_NO_STATUS, CLOSE_NORMAL, CloseReason};

use crate::config::ServerConfig;
use crate::connections::ConnectionRegistry;
use crate::error::ServerResult;
use crate::gate::{AllowAll, Authenticator, BearerToken, check_handshake};

type ConnectHook<U> = Arc<dyn Fn(&Arc<Connection<U>>) + Send + Sync>;
type DisconnectHook<U> = Arc<dyn Fn(&Arc<Connection<U>>, &CloseReason) + Send + Sync>;

struct Inner<U> {
    config: ServerConfig,
    authenticator: Box<dyn Authenticator<U>>,
    subscriptions: Subscriptions<U>,
    connections: ConnectionRegistry<U>,
    on_connect: RwLock<Vec<ConnectHook<U>>>,
    on_disconnect: RwLock<Vec<DisconnectHook<U>>>,
}

/// WebSocket server dispatching envelopes to shared subscriptions.
///
/// `U` is the user type produced by the authenticator and bound to each
/// connection. Cloning yields another handle to the same server.
pub struct WsServer<U = ()> {
    inner: Arc<Inner<U>>,
}

impl<U> Clone for WsServer<U> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum WriterExit {
    Closed(CloseReason),
    Terminated,
    Failed,
}

impl<U: Default + Send + Sync + 'static> WsServer<U> {
    /// Creates a server that requires `config.auth_token` when set and admits
    /// everyone otherwise.
    pub fn from_config(config: ServerConfig) -> Self {
        match config.auth_token.clone() {
            Some(token) => Self::new(config, BearerToken::new(token)),
            None => Self::new(config, AllowAll),
        }
    }
}

impl<U: Send + Sync + 'static> WsServer<U> {
    pub fn new(config: ServerConfig, authenticator: impl Authenticator<U>) -> Self {
        let subscriptions = Subscriptions::new();
        install_pong_tracker(&subscriptions);
        Self {
            inner: Arc::new(Inner {
                config,
                authenticator: Box::new(authenticator),
                subscriptions,
                connections: ConnectionRegistry::new(),
                on_connect: RwLock::new(Vec::new()),
                on_disconnect: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Subscriptions shared by every connection.
    pub fn subscriptions(&self) -> &Subscriptions<U> {
        &self.inner.subscriptions
    }

    /// Registers an asynchronous handler on every connection.
    pub fn subscribe<F, Fut>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(Inbound<U>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.subscriptions.subscribe(event, handler)
    }

    /// Registers a synchronous handler on every connection.
    pub fn subscribe_sync<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Inbound<U>) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.subscriptions.subscribe_sync(event, handler)
    }

    /// Runs `hook` for each new connection before its first message is read.
    pub fn on_connect<F>(&self, hook: F)
    where
        F: Fn(&Arc<Connection<U>>) + Send + Sync + 'static,
    {
        self.inner.on_connect.write().push(Arc::new(hook));
    }

    /// Runs `hook` once per connection after it is closed.
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn(&Arc<Connection<U>>, &CloseReason) + Send + Sync + 'static,
    {
        self.inner.on_disconnect.write().push(Arc::new(hook));
    }

    pub fn connections(&self) -> &ConnectionRegistry<U> {
        &self.inner.connections
    }

    /// Sends an event to every open connection not listed in `exclude`.
    pub fn broadcast(&self, event: &str, payload: Option<Value>, exclude: &[Uuid]) -> usize {
        self.inner.connections.broadcast(event, payload, exclude)
    }

    /// Returns a router that sends every request through the upgrade gate.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(accept::<U>)
            .with_state(self.clone())
    }

    /// Starts the liveness prober. The first tick fires one period from now.
    pub fn spawn_prober(&self) -> JoinHandle<()> {
        let connections = self.inner.connections.clone();
        let period = self.inner.config.ping_interval;
        tokio::spawn(run_prober(connections, period))
    }

    /// Serves until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> ServerResult<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serves until `signal` completes, then closes every open connection.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, signal: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(addr = %addr, path = ?self.inner.config.path, "listening");

        let prober = self.spawn_prober();
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await;
        prober.abort();

        let remaining = self.inner.connections.snapshot();
        if !remaining.is_empty() {
            info!(count = remaining.len(), "closing open connections");
        }
        for conn in remaining {
            conn.close(CLOSE_NORMAL, "server shutting down");
        }

        result?;
        Ok(())
    }

    async fn run_session(self, socket: WebSocket, user: U, remote_addr: String) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(
            Connection::new(user, tx)
                .with_remote_addr(remote_addr)
                .with_request_timeout(self.inner.config.request_timeout),
        );
        let conn_id = conn.id();
        self.inner.connections.add(Arc::clone(&conn));
        info!(conn_id = %conn_id, remote_addr = ?conn.remote_addr(), "connection established");

        let hooks = self.inner.on_connect.read().clone();
        for hook in hooks {
            hook(&conn);
        }

        let (sink, mut stream) = socket.split();
        let mut writer = tokio::spawn(write_outbound(sink, rx));

        let observed = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        conn.handle_text(text.as_str(), Some(&self.inner.subscriptions));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        conn.handle_binary(&data, Some(&self.inner.subscriptions));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => CloseReason::new(frame.code, frame.reason.as_str()),
                            None => CloseReason::new(CLOSE_NO_STATUS, ""),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(conn_id = %conn_id, error = %e, "transport error");
                        break CloseReason::abnormal();
                    }
                    None => break CloseReason::abnormal(),
                },
                exit = &mut writer => {
                    break match exit {
                        Ok(WriterExit::Closed(reason)) => reason,
                        Ok(WriterExit::Terminated | WriterExit::Failed) | Err(_) => CloseReason::abnormal(),
                    };
                }
            }
        };
        writer.abort();
        drop(stream);

        self.inner.connections.remove(&conn_id);
        let reason = conn.classify_close(observed);
        conn.shutdown();
        info!(conn_id = %conn_id, reason = %reason, "connection closed");

        let hooks = self.inner.on_disconnect.read().clone();
        for hook in hooks {
            hook(&conn, &reason);
        }
    }
}

async fn accept<U: Send + Sync + 'static>(
    State(server): State<WsServer<U>>,
    request: Request,
) -> Response {
    let (mut parts, _body) = request.into_parts();

    let admitted = match check_handshake(
        &parts,
        server.inner.config.path.as_deref(),
        server.inner.authenticator.as_ref(),
    )
    .await
    {
        Ok(admitted) => admitted,
        Err(rejection) => return rejection.into_response(),
    };

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!(error = %rejection, "not a websocket upgrade");
            return rejection.into_response();
        }
    };

    upgrade.on_upgrade(move |socket| server.run_session(socket, admitted.user, admitted.remote_addr))
}

async fn write_outbound(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> WriterExit {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Text(text) => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return WriterExit::Failed;
                }
            }
            Outbound::Close(reason) => {
                let frame = CloseFrame {
                    code: reason.code,
                    reason: reason.reason.clone().into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                return WriterExit::Closed(reason);
            }
            Outbound::Terminate => return WriterExit::Terminated,
        }
    }
    WriterExit::Failed
}

async fn run_prober<U>(connections: ConnectionRegistry<U>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let terminated = connections
            .snapshot()
            .iter()
            .filter(|conn| probe::<U>(conn))
            .count();
        if terminated > 0 {
            debug!(terminated, "terminated unresponsive connections");
        }
    }
}
