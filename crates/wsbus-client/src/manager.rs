//! Reconnecting client.
//!
//! A [`ReconnectManager`] keeps one connection to the server open for as long
//! as it runs. Whenever the connection closes, for any reason, it waits
//! `reconnect_delay` and dials again. Subscriptions are held by the manager,
//! so they survive reconnects; pending requests do not.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use wsbus_core::heartbeat::{install_responder, watchdog_expired};
use wsbus_core::{
    Connection, ConnectionError, ConnectionResult, HandlerResult, Inbound, Outbound, Subscription,
    Subscriptions,
};
use wsbus_protocol::{CLOSE_NO_STATUS, CLOSE_NORMAL, CloseReason};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `start` has not been called.
    Idle,
    /// Dialing the server.
    Connecting,
    /// A connection is open.
    Open,
    /// The last connection closed; a new attempt follows unless stopped.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Inner {
    config: ClientConfig,
    subscriptions: Subscriptions,
    current: watch::Sender<Option<Arc<Connection>>>,
    state: watch::Sender<ConnectionState>,
    started: AtomicBool,
    stop: watch::Sender<bool>,
}

/// Keeps a connection to one server open, reconnecting forever.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct ReconnectManager {
    inner: Arc<Inner>,
}

impl ReconnectManager {
    pub fn new(config: ClientConfig) -> Self {
        let subscriptions = Subscriptions::new();
        install_responder(&subscriptions);
        Self {
            inner: Arc::new(Inner {
                config,
                subscriptions,
                current: watch::Sender::new(None),
                state: watch::Sender::new(ConnectionState::Idle),
                started: AtomicBool::new(false),
                stop: watch::Sender::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Spawns the connect loop. Returns false, doing nothing, if this manager
    /// was already started.
    pub fn start(&self) -> bool {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("reconnect manager already started");
            return false;
        }
        tokio::spawn(Arc::clone(&self.inner).run());
        true
    }

    /// Ends the connect loop and closes the current connection normally.
    pub fn stop(&self) {
        self.inner.stop.send_replace(true);
        if let Some(conn) = self.connection() {
            conn.close(CLOSE_NORMAL, "client stopped");
        }
    }

    /// Registers an asynchronous handler that stays in place across reconnects.
    pub fn subscribe<F, Fut>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(Inbound) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.subscriptions.subscribe(event, handler)
    }

    /// Registers a synchronous handler that stays in place across reconnects.
    pub fn subscribe_sync<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Inbound) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.subscriptions.subscribe_sync(event, handler)
    }

    /// Returns the open connection, if any.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.current.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Sends a fire-and-forget event on the current connection.
    pub fn send(&self, event: &str, payload: Option<Value>) -> ConnectionResult<()> {
        self.connection()
            .ok_or(ConnectionError::NotConnected)?
            .send(event, payload)
    }

    /// Sends a request on the current connection and waits for its reply.
    pub async fn request(&self, event: &str, payload: Option<Value>) -> ConnectionResult<Value> {
        let conn = self.connection().ok_or(ConnectionError::NotConnected)?;
        conn.request(event, payload).await
    }

    /// Waits until a connection is open.
    pub async fn wait_connected(&self, timeout: Duration) -> ConnectionResult<Arc<Connection>> {
        let mut rx = self.inner.current.subscribe();
        let wait = async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(conn) = current.filter(|c| c.is_open()) {
                    return Ok(conn);
                }
                if rx.changed().await.is_err() {
                    return Err(ConnectionError::Closed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))?
    }

    /// Waits until the connect loop has exited after [`stop`](Self::stop).
    pub async fn stopped(&self) {
        let mut state = self.watch_state();
        let mut stop = self.inner.stop.subscribe();
        wait_stop(&mut stop).await;
        let _ = state
            .wait_for(|s| matches!(s, ConnectionState::Closed | ConnectionState::Idle))
            .await;
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        if let Err(e) = self.config.validate() {
            error!(url = %self.config.url, error = %e, "refusing to connect");
            self.state.send_replace(ConnectionState::Closed);
            return;
        }

        let mut stop = self.stop.subscribe();
        loop {
            if *stop.borrow() {
                break;
            }

            self.state.send_replace(ConnectionState::Connecting);
            let dialed = tokio::select! {
                dialed = open_socket(&self.config) => dialed,
                _ = wait_stop(&mut stop) => break,
            };
            match dialed {
                Ok(socket) => self.run_session(socket, &mut stop).await,
                Err(e) => warn!(url = %self.config.url, error = %e, "connect failed"),
            }
            self.state.send_replace(ConnectionState::Closed);

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = wait_stop(&mut stop) => break,
            }
        }
        self.state.send_replace(ConnectionState::Closed);
        debug!(url = %self.config.url, "reconnect loop stopped");
    }

    async fn run_session(&self, socket: WsStream, stop: &mut watch::Receiver<bool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(
            Connection::new((), tx)
                .with_remote_addr(self.config.url.clone())
                .with_request_timeout(self.config.request_timeout),
        );
        let conn_id = conn.id();
        self.current.send_replace(Some(Arc::clone(&conn)));
        self.state.send_replace(ConnectionState::Open);
        info!(conn_id = %conn_id, url = %self.config.url, "connected");

        let (sink, mut stream) = socket.split();
        let mut writer = tokio::spawn(write_outbound(sink, rx));
        let mut watchdog = tokio::time::interval(self.config.watchdog_poll);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stopping = false;

        let observed = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        conn.handle_text(text.as_str(), Some(&self.subscriptions));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        conn.handle_binary(&data, Some(&self.subscriptions));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => CloseReason::new(u16::from(frame.code), frame.reason.as_str()),
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
                        Ok(Some(reason)) => reason,
                        Ok(None) | Err(_) => CloseReason::abnormal(),
                    };
                }
                _ = watchdog.tick() => {
                    if conn.is_open() && watchdog_expired(&conn, self.config.ping_interval) {
                        warn!(conn_id = %conn_id, elapsed_ms = conn.since_last_ping().as_millis() as u64, "server stopped pinging");
                        conn.close_timed_out();
                    }
                }
                _ = wait_stop(stop), if !stopping => {
                    stopping = true;
                    conn.close(CLOSE_NORMAL, "client stopped");
                }
            }
        };
        writer.abort();

        self.current.send_replace(None);
        let reason = conn.classify_close(observed);
        conn.shutdown();
        info!(conn_id = %conn_id, reason = %reason, "disconnected");
    }
}

/// Completes once stop has been requested.
async fn wait_stop(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Selects the TLS backend used for `wss://` URLs.
fn install_crypto_provider() {
    // Err only means a provider was installed already.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

async fn open_socket(config: &ClientConfig) -> ClientResult<WsStream> {
    install_crypto_provider();
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::Config(format!("invalid url {}: {}", config.url, e)))?;
    if let Some(token) = &config.auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ClientError::Config(format!("invalid auth token: {}", e)))?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }

    debug!(url = %config.url, "connecting");
    match tokio::time::timeout(config.connect_timeout, connect_async(request)).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(ClientError::Handshake(e.to_string())),
        Err(_) => Err(ClientError::Timeout(format!(
            "no connection to {} within {}ms",
            config.url,
            config.connect_timeout.as_millis()
        ))),
    }
}

/// Drains the outbound queue into the socket. Returns the close reason when a
/// local close was sent.
async fn write_outbound(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> Option<CloseReason> {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(error = %e, "write failed");
                    return None;
                }
            }
            Outbound::Close(reason) => {
                let frame = CloseFrame {
                    code: CloseCode::from(reason.code),
                    reason: reason.reason.clone().into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                return Some(reason);
            }
            Outbound::Terminate => return None,
        }
    }
    None
}
