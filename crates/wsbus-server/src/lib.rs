//! Accepting side of a wsbus link.
//!
//! - An upgrade gate (path prefix, remote address, authenticator)
//! - A registry of live connections with broadcast
//! - A liveness prober terminating peers that stop answering `ping`
//!
//! # Example
//!
//! ```rust,no_run
//! use wsbus_server::{ServerConfig, WsServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let server: WsServer = WsServer::from_config(config.clone());
//!     server.subscribe_sync("echo", |inbound| Ok(inbound.payload().cloned()));
//!
//!     let listener = tokio::net::TcpListener::bind(config.bind).await?;
//!     server.serve(listener).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod connections;
pub mod demo;
mod error;
pub mod gate;
mod server;
mod signals;

pub use config::{DEFAULT_PATH, ServerConfig, default_config_path};
pub use connections::ConnectionRegistry;
pub use error::{ServerError, ServerResult};
pub use gate::{AllowAll, Authenticator, BearerToken, HandshakeState, Rejection};
pub use server::WsServer;
pub use signals::ShutdownHandle;
