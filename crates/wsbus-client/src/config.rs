//! Client configuration.
//!
//! Settings live in `client.toml` under the user config directory by default.
//! Durations are written in milliseconds:
//!
//! ```toml
//! url = "ws://127.0.0.1:8080/ws"
//! auth_token = "secret"
//! reconnect_delay_ms = 1500
//! ping_interval_ms = 30000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use wsbus_core::{DEFAULT_PING_INTERVAL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_WATCHDOG_POLL};

use crate::error::{ClientError, ClientResult};

/// Default server URL.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";

/// Default pause between a closure and the next connect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1500);

/// Default grace window for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the reconnect manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server URL.
    pub url: String,

    /// Bearer token sent on every connect.
    pub auth_token: Option<String>,

    /// Pause before reconnecting.
    pub reconnect_delay: Duration,

    /// The server's ping period. The watchdog fires after twice this long
    /// without a `ping`.
    pub ping_interval: Duration,

    /// How often the watchdog checks.
    pub watchdog_poll: Duration,

    /// Grace window for each connect attempt.
    pub connect_timeout: Duration,

    /// Window for requests.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            auth_token: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            ping_interval: DEFAULT_PING_INTERVAL,
            watchdog_poll: DEFAULT_WATCHDOG_POLL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// On-disk form of [`ClientConfig`].
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    url: Option<String>,
    auth_token: Option<String>,
    reconnect_delay_ms: Option<u64>,
    ping_interval_ms: Option<u64>,
    watchdog_poll_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
}

fn millis(value: Option<u64>, fallback: Duration) -> Duration {
    value.map_or(fallback, Duration::from_millis)
}

impl ClientConfig {
    /// Creates a configuration for `url` with default timings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Builder: set the bearer token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Builder: set the reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Builder: set the expected ping period.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Builder: set the watchdog polling period.
    pub fn with_watchdog_poll(mut self, poll: Duration) -> Self {
        self.watchdog_poll = poll;
        self
    }

    /// Builder: set the connect grace window.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder: set the request window.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Loads configuration from the default path, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> ClientResult<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| ClientError::Config(format!("failed to parse config: {}", e)))?;
        let defaults = Self::default();
        let config = Self {
            url: file.url.unwrap_or(defaults.url),
            auth_token: file.auth_token,
            reconnect_delay: millis(file.reconnect_delay_ms, defaults.reconnect_delay),
            ping_interval: millis(file.ping_interval_ms, defaults.ping_interval),
            watchdog_poll: millis(file.watchdog_poll_ms, defaults.watchdog_poll),
            connect_timeout: millis(file.connect_timeout_ms, defaults.connect_timeout),
            request_timeout: millis(file.request_timeout_ms, defaults.request_timeout),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the reconnect manager cannot run with.
    pub fn validate(&self) -> ClientResult<()> {
        let windows = [
            ("ping_interval_ms", self.ping_interval),
            ("watchdog_poll_ms", self.watchdog_poll),
            ("connect_timeout_ms", self.connect_timeout),
            ("request_timeout_ms", self.request_timeout),
        ];
        for (name, value) in windows {
            if value.is_zero() {
                return Err(ClientError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.url.is_empty() {
            return Err(ClientError::Config("url must not be empty".to_string()));
        }
        Ok(())
    }

    /// Renders the configuration in its on-disk form. The token is masked.
    pub fn to_toml(&self) -> ClientResult<String> {
        let file = ConfigFile {
            url: Some(self.url.clone()),
            auth_token: self.auth_token.as_ref().map(|_| "********".to_string()),
            reconnect_delay_ms: Some(self.reconnect_delay.as_millis() as u64),
            ping_interval_ms: Some(self.ping_interval.as_millis() as u64),
            watchdog_poll_ms: Some(self.watchdog_poll.as_millis() as u64),
            connect_timeout_ms: Some(self.connect_timeout.as_millis() as u64),
            request_timeout_ms: Some(self.request_timeout.as_millis() as u64),
        };
        toml::to_string_pretty(&file)
            .map_err(|e| ClientError::Config(format!("failed to serialize config: {}", e)))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("wsbus")
            .join("client.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.reconnect_delay, Duration::from_millis(1500));
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.watchdog_poll, Duration::from_millis(300));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
url = "ws://example.test:9000/bus"
auth_token = "abc"
reconnect_delay_ms = 250
"#
        )
        .unwrap();

        let config = ClientConfig::load_from(file.path()).unwrap();
        assert_eq!(config.url, "ws://example.test:9000/bus");
        assert_eq!(config.auth_token.as_deref(), Some("abc"));
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ClientConfig::parse("retries = 3").unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn zero_windows_are_rejected() {
        for key in [
            "ping_interval_ms",
            "watchdog_poll_ms",
            "connect_timeout_ms",
            "request_timeout_ms",
        ] {
            let err = ClientConfig::parse(&format!("{key} = 0")).unwrap_err();
            assert!(matches!(&err, ClientError::Config(msg) if msg.contains(key)), "{key}: {err}");
        }

        let config = ClientConfig::default().with_watchdog_poll(Duration::ZERO);
        assert!(config.validate().is_err());
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn to_toml_masks_token() {
        let rendered = ClientConfig::new("ws://h/ws")
            .with_auth_token("hunter2")
            .to_toml()
            .unwrap();
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("reconnect_delay_ms = 1500"));

        let reparsed = ClientConfig::parse(&rendered).unwrap();
        assert_eq!(reparsed.url, "ws://h/ws");
    }

    #[test]
    fn default_path_is_under_wsbus() {
        let path = ClientConfig::default_path();
        assert!(path.ends_with("wsbus/client.toml"));
    }
}
