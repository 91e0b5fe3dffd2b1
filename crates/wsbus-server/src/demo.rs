//! Handlers installed by the `wsbus-server` binary.
//!
//! - `echo` replies with its payload.
//! - `add` replies with `a + b`.
//! - `chat` relays its payload to every other connection.

use serde::Deserialize;
use serde_json::{Number, Value, json};

use wsbus_core::BoxError;

use crate::server::WsServer;

#[derive(Debug, Deserialize)]
struct AddArgs {
    a: Number,
    b: Number,
}

fn add(args: AddArgs) -> Result<Value, BoxError> {
    if let (Some(a), Some(b)) = (args.a.as_i64(), args.b.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(json!(sum));
        }
    }
    match (args.a.as_f64(), args.b.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(a + b)),
        _ => Err("operands are not representable".into()),
    }
}

/// Registers `echo`, `add` and `chat` on `server`.
pub fn install<U: Send + Sync + 'static>(server: &WsServer<U>) {
    server.subscribe_sync("echo", |inbound| Ok(inbound.payload().cloned()));

    server.subscribe_sync("add", |inbound| {
        let args: AddArgs = inbound
            .payload_as()
            .map_err(|e| format!("add expects {{\"a\": number, \"b\": number}}: {e}"))?;
        add(args).map(Some)
    });

    let registry = server.connections().clone();
    server.subscribe_sync("chat", move |inbound| {
        registry.broadcast("chat", inbound.payload().cloned(), &[inbound.connection.id()]);
        Ok(None)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use wsbus_core::{Connection, Outbound};
    use wsbus_protocol::{Envelope, decode, encode};

    fn setup() -> (WsServer, Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let server: WsServer = WsServer::from_config(ServerConfig::default());
        install(&server);
        let (tx, rx) = mpsc::unbounded_channel();
        (server, Arc::new(Connection::new((), tx)), rx)
    }

    fn call(
        server: &WsServer,
        conn: &Arc<Connection>,
        rx: &mut mpsc::UnboundedReceiver<Outbound>,
        request: Envelope,
    ) -> Envelope {
        conn.handle_text(&encode(&request).unwrap(), Some(server.subscriptions()));
        match rx.try_recv() {
            Ok(Outbound::Text(text)) => decode(&text).unwrap(),
            other => panic!("no reply: {:?}", other),
        }
    }

    #[test]
    fn add_sums_integers_and_floats() {
        let (server, conn, mut rx) = setup();

        let reply = call(
            &server,
            &conn,
            &mut rx,
            Envelope::request("add", Some(json!({"a": 2, "b": 3})), "r1"),
        );
        assert_eq!(reply.payload, Some(json!(5)));

        let reply = call(
            &server,
            &conn,
            &mut rx,
            Envelope::request("add", Some(json!({"a": 0.5, "b": 2})), "r2"),
        );
        assert_eq!(reply.payload, Some(json!(2.5)));
    }

    #[test]
    fn add_with_bad_input_is_error_reply() {
        let (server, conn, mut rx) = setup();
        let reply = call(
            &server,
            &conn,
            &mut rx,
            Envelope::request("add", Some(json!({"a": "two"})), "r1"),
        );
        assert!(reply.ack);
        assert!(reply.error);
        let message = reply.payload.unwrap();
        assert!(message.as_str().unwrap().starts_with("add expects"));
    }

    #[test]
    fn echo_returns_payload() {
        let (server, conn, mut rx) = setup();
        let reply = call(
            &server,
            &conn,
            &mut rx,
            Envelope::request("echo", Some(json!({"k": [1, 2]})), "r1"),
        );
        assert_eq!(reply.payload, Some(json!({"k": [1, 2]})));
    }
}
