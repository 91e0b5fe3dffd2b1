//! wsbus-server entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use wsbus_core::{LogConfig, LogFormat, init_tracing};
use wsbus_server::{ServerConfig, ServerError, ServerResult, ShutdownHandle, WsServer, demo};

/// Serve wsbus over WebSocket.
#[derive(Debug, Parser)]
#[command(name = "wsbus-server", version, about)]
struct Args {
    /// Configuration file (defaults to <config dir>/wsbus/server.toml).
    #[arg(short, long, env = "WSBUS_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address.
    #[arg(short, long, env = "WSBUS_BIND")]
    bind: Option<SocketAddr>,

    /// Upgrade path prefix; an empty string accepts any path.
    #[arg(long)]
    path: Option<String>,

    /// Require `Authorization: Bearer <token>` on upgrade.
    #[arg(long, env = "WSBUS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Liveness probe period in milliseconds.
    #[arg(long)]
    ping_interval_ms: Option<u64>,

    /// Do not install the echo/add/chat handlers.
    #[arg(long)]
    no_demo: bool,

    /// Log output format: pretty, compact or json.
    #[arg(long, default_value = "json")]
    log_format: LogFormat,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn server_config(&self) -> ServerResult<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load_from(path)?,
            None => ServerConfig::load()?,
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(path) = &self.path {
            config.path = (!path.is_empty()).then(|| path.clone());
        }
        if let Some(token) = &self.token {
            config.auth_token = Some(token.clone());
        }
        if let Some(ms) = self.ping_interval_ms {
            config.ping_interval = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut log = LogConfig::service().with_format(args.log_format);
    if args.debug {
        log = log.with_level(tracing::Level::DEBUG);
    }
    if let Err(e) = init_tracing(log) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> ServerResult<()> {
    let config = args.server_config()?;

    let server: WsServer = WsServer::from_config(config.clone());
    if !args.no_demo {
        demo::install(&server);
    }
    server.on_connect(|conn| info!(conn_id = %conn.id(), remote_addr = ?conn.remote_addr(), "client connected"));
    server.on_disconnect(|conn, reason| info!(conn_id = %conn.id(), reason = %reason, "client disconnected"));

    let listener = TcpListener::bind(config.bind)
        .await
        .map_err(|e| ServerError::bind(config.bind, e))?;

    let shutdown = ShutdownHandle::new();
    shutdown.listen_for_signals();

    server.serve_with_shutdown(listener, shutdown.wait()).await?;
    info!("server stopped");
    Ok(())
}
