//! Reconnecting client and the `wsbus` command-line tool.
//!
//! [`ReconnectManager`] keeps a connection to a wsbus server open, answering
//! the server's liveness probes and redialing whenever the connection drops.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod manager;

pub use cli::Cli;
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use manager::{ConnectionState, ReconnectManager};
