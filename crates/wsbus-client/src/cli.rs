//! Command-line interface definition.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use serde_json::Value;

/// wsbus - talk to a wsbus server from the shell
#[derive(Debug, Parser)]
#[command(name = "wsbus")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "WSBUS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Server URL (overrides the configuration file)
    #[arg(long, short, env = "WSBUS_URL")]
    pub url: Option<String>,

    /// Bearer token sent on connect
    #[arg(long, env = "WSBUS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Request timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send a request and print the reply
    Request {
        /// Event name
        event: String,
        /// JSON payload; text that is not valid JSON is sent as a string
        payload: Option<String>,
    },
    /// Send an event without waiting for a reply
    Send {
        /// Event name
        event: String,
        /// JSON payload; text that is not valid JSON is sent as a string
        payload: Option<String>,
    },
    /// Print incoming events until interrupted
    Listen {
        /// Events to print; all events when omitted
        events: Vec<String>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Dump,
    /// Print the default configuration file path
    Path,
}

/// Parses a payload argument.
pub fn parse_payload(raw: Option<&str>) -> Option<Value> {
    raw.map(|text| serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_request_with_payload() {
        let cli = Cli::try_parse_from([
            "wsbus",
            "--url",
            "ws://h/ws",
            "-vv",
            "request",
            "add",
            r#"{"a":1,"b":2}"#,
        ])
        .unwrap();
        assert_eq!(cli.url.as_deref(), Some("ws://h/ws"));
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Request { event, payload } => {
                assert_eq!(event, "add");
                assert_eq!(parse_payload(payload.as_deref()), Some(json!({"a": 1, "b": 2})));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn listen_accepts_many_events() {
        let cli = Cli::try_parse_from(["wsbus", "listen", "chat", "news"]).unwrap();
        assert!(matches!(cli.command, Command::Listen { events } if events == ["chat", "news"]));
    }

    #[test]
    fn non_json_payload_is_a_string() {
        assert_eq!(parse_payload(Some("hello")), Some(json!("hello")));
        assert_eq!(parse_payload(Some("42")), Some(json!(42)));
        assert_eq!(parse_payload(None), None);
    }

    #[test]
    fn config_subcommands() {
        let cli = Cli::try_parse_from(["wsbus", "config", "dump"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Config {
                action: ConfigAction::Dump
            }
        ));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["wsbus"]).is_err());
    }
}
