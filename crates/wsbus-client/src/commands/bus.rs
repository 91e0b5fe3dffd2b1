//! `request`, `send` and `listen`.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use wsbus_protocol::{PING, PONG, WILDCARD};

use crate::error::{ClientError, ClientResult};
use crate::manager::ReconnectManager;

/// How long to wait for the close handshake before exiting.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

async fn connect(manager: &ReconnectManager) -> ClientResult<()> {
    manager.start();
    let window = manager.config().connect_timeout;
    manager.wait_connected(window).await.map_err(|_| {
        ClientError::Timeout(format!(
            "could not connect to {} within {}ms",
            manager.config().url,
            window.as_millis()
        ))
    })?;
    Ok(())
}

async fn disconnect(manager: &ReconnectManager) {
    manager.stop();
    if tokio::time::timeout(CLOSE_GRACE, manager.stopped()).await.is_err() {
        debug!("close handshake did not finish");
    }
}

/// Sends a request and returns the reply payload.
pub async fn request(
    manager: &ReconnectManager,
    event: &str,
    payload: Option<Value>,
) -> ClientResult<Value> {
    connect(manager).await?;
    let reply = manager.request(event, payload).await;
    disconnect(manager).await;
    Ok(reply?)
}

/// Sends one event and closes.
pub async fn send(manager: &ReconnectManager, event: &str, payload: Option<Value>) -> ClientResult<()> {
    connect(manager).await?;
    let sent = manager.send(event, payload);
    disconnect(manager).await;
    Ok(sent?)
}

/// Formats one received event for output.
pub fn format_event(event: &str, payload: Option<&Value>) -> String {
    match payload {
        Some(payload) => format!("{event} {payload}"),
        None => event.to_string(),
    }
}

/// Passes every matching event to `sink` until `until` completes. An empty
/// `events` list matches everything except heartbeat traffic.
pub async fn listen<F, S>(
    manager: &ReconnectManager,
    events: &[String],
    until: F,
    sink: S,
) -> ClientResult<()>
where
    F: Future<Output = ()>,
    S: Fn(String) + Clone + Send + Sync + 'static,
{
    let names: Vec<&str> = if events.is_empty() {
        vec![WILDCARD]
    } else {
        events.iter().map(String::as_str).collect()
    };

    let subscriptions: Vec<_> = names
        .into_iter()
        .map(|name| {
            let sink = sink.clone();
            manager.subscribe_sync(name, move |inbound| {
                let event = inbound.event();
                if event != PING && event != PONG && !inbound.envelope.ack {
                    sink(format_event(event, inbound.payload()));
                }
                Ok(None)
            })
        })
        .collect();

    connect(manager).await?;
    until.await;
    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    disconnect(manager).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use wsbus_server::{ServerConfig, ShutdownHandle, WsServer, demo};

    async fn serve() -> (WsServer, String, ShutdownHandle) {
        let server: WsServer = WsServer::from_config(ServerConfig::default());
        demo::install(&server);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let shutdown = ShutdownHandle::new();
        let wait = shutdown.wait();
        let handle = server.clone();
        tokio::spawn(async move { handle.serve_with_shutdown(listener, wait).await });
        (server, url, shutdown)
    }

    #[test]
    fn format_event_lines() {
        assert_eq!(format_event("chat", Some(&json!("hi"))), r#"chat "hi""#);
        assert_eq!(format_event("tick", None), "tick");
        assert_eq!(format_event("obj", Some(&json!({"a": 1}))), r#"obj {"a":1}"#);
    }

    #[tokio::test]
    async fn request_prints_reply() {
        let (_server, url, shutdown) = serve().await;
        let manager = ReconnectManager::new(ClientConfig::new(url));

        let reply = request(&manager, "add", Some(json!({"a": 2, "b": 3})))
            .await
            .unwrap();
        assert_eq!(reply, json!(5));
        assert!(manager.connection().is_none());
        shutdown.trigger();
    }

    #[tokio::test]
    async fn request_to_unreachable_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        drop(listener);

        let manager = ReconnectManager::new(
            ClientConfig::new(url).with_connect_timeout(Duration::from_millis(200)),
        );
        let err = request(&manager, "add", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
        manager.stop();
    }

    #[tokio::test]
    async fn listen_receives_filtered_events() {
        let (server, url, shutdown) = serve().await;
        let manager = ReconnectManager::new(ClientConfig::new(url));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        let listener = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let events = vec!["news".to_string()];
                let sink = move |line: String| {
                    let _ = tx.send(line);
                };
                listen(&manager, &events, async { let _ = done_rx.await; }, sink).await
            })
        };

        manager
            .wait_connected(Duration::from_secs(3))
            .await
            .unwrap();
        for _ in 0..100 {
            if server.connections().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server.broadcast("weather", Some(json!("rain")), &[]);
        server.broadcast("news", Some(json!("headline")), &[]);

        let line = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, r#"news "headline""#);

        let _ = done_tx.send(());
        listener.await.unwrap().unwrap();
        assert!(rx.try_recv().is_err());
        shutdown.trigger();
    }
}
