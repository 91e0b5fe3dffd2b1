//! wsbus CLI entry point.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use wsbus_client::cli::{Cli, Command, ConfigAction, parse_payload};
use wsbus_client::commands;
use wsbus_client::config::ClientConfig;
use wsbus_client::error::ClientResult;
use wsbus_client::manager::ReconnectManager;
use wsbus_core::{LogConfig, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(LogConfig::cli(cli.verbose)) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> ClientResult<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load()?,
    };
    if let Some(url) = &cli.url {
        config.url = url.clone();
    }
    if let Some(token) = &cli.token {
        config.auth_token = Some(token.clone());
    }
    if let Some(ms) = cli.timeout_ms {
        config.request_timeout = Duration::from_millis(ms);
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> ClientResult<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Command::Request { event, payload } => {
            let manager = ReconnectManager::new(config);
            let reply =
                commands::bus::request(&manager, &event, parse_payload(payload.as_deref())).await?;
            let rendered = serde_json::to_string_pretty(&reply).unwrap_or_else(|_| reply.to_string());
            println!("{}", rendered);
            Ok(())
        }
        Command::Send { event, payload } => {
            let manager = ReconnectManager::new(config);
            commands::bus::send(&manager, &event, parse_payload(payload.as_deref())).await
        }
        Command::Listen { events } => {
            let manager = ReconnectManager::new(config);
            let interrupted = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            commands::bus::listen(&manager, &events, interrupted, |line| println!("{}", line)).await
        }
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config),
            ConfigAction::Path => commands::config::path(),
        },
    }
}
