//! Server configuration.
//!
//! Settings come from `server.toml` under the user config directory, or from
//! an explicit path. Durations are written in milliseconds:
//!
//! ```toml
//! bind = "127.0.0.1:8080"
//! path = "/ws"
//! ping_interval_ms = 30000
//! request_timeout_ms = 30000
//! auth_token = "secret"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use wsbus_core::{DEFAULT_PING_INTERVAL, DEFAULT_REQUEST_TIMEOUT};

use crate::error::{ServerError, ServerResult};

/// Default upgrade path prefix.
pub const DEFAULT_PATH: &str = "/ws";

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: SocketAddr,

    /// Required request path prefix for upgrades. `None` accepts any path.
    pub path: Option<String>,

    /// Liveness probe period.
    pub ping_interval: Duration,

    /// Window for server-initiated requests.
    pub request_timeout: Duration,

    /// Bearer token required on upgrade, if any.
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            path: Some(DEFAULT_PATH.to_string()),
            ping_interval: DEFAULT_PING_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            auth_token: None,
        }
    }
}

/// On-disk form; every field is optional and falls back to the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    bind: Option<SocketAddr>,
    path: Option<String>,
    ping_interval_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    auth_token: Option<String>,
}

impl ServerConfig {
    /// Creates a configuration listening on `bind`.
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            ..Default::default()
        }
    }

    /// Builder: set the upgrade path prefix.
    pub fn with_path(mut self, path: Option<String>) -> Self {
        self.path = path;
        self
    }

    /// Builder: set the probe period.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Builder: set the request window.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Builder: require a bearer token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Loads configuration from the default path, or returns the defaults if
    /// the file does not exist.
    pub fn load() -> ServerResult<Self> {
        let path = default_config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ServerResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServerError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> ServerResult<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| ServerError::config(format!("failed to parse config: {}", e)))?;

        let defaults = Self::default();
        let config = Self {
            bind: file.bind.unwrap_or(defaults.bind),
            path: match file.path {
                Some(p) if p.is_empty() => None,
                Some(p) => Some(p),
                None => defaults.path,
            },
            ping_interval: file
                .ping_interval_ms
                .map_or(defaults.ping_interval, Duration::from_millis),
            request_timeout: file
                .request_timeout_ms
                .map_or(defaults.request_timeout, Duration::from_millis),
            auth_token: file.auth_token.or(defaults.auth_token),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the server cannot run with.
    pub fn validate(&self) -> ServerResult<()> {
        if self.ping_interval.is_zero() {
            return Err(ServerError::config("ping_interval_ms must be greater than zero"));
        }
        if self.request_timeout.is_zero() {
            return Err(ServerError::config("request_timeout_ms must be greater than zero"));
        }
        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(ServerError::config(format!("path must start with '/': {path}")));
            }
        }
        Ok(())
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wsbus")
        .join("server.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.path.as_deref(), Some("/ws"));
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn builder_methods() {
        let config = ServerConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_path(None)
            .with_ping_interval(Duration::from_millis(250))
            .with_auth_token("t0k");

        assert_eq!(config.bind.port(), 9000);
        assert!(config.path.is_none());
        assert_eq!(config.ping_interval, Duration::from_millis(250));
        assert_eq!(config.auth_token.as_deref(), Some("t0k"));
    }

    #[test]
    fn load_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
bind = "127.0.0.1:7000"
ping_interval_ms = 1500
auth_token = "secret"
"#
        )
        .unwrap();

        let config = ServerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.bind.port(), 7000);
        assert_eq!(config.ping_interval, Duration::from_millis(1500));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.path.as_deref(), Some("/ws"));
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn empty_path_accepts_everything() {
        let config = ServerConfig::parse(r#"path = """#).unwrap();
        assert!(config.path.is_none());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(matches!(
            ServerConfig::parse("ping_interval_ms = 0"),
            Err(ServerError::Config { .. })
        ));
        assert!(matches!(
            ServerConfig::parse(r#"path = "ws""#),
            Err(ServerError::Config { .. })
        ));
        assert!(matches!(
            ServerConfig::parse("unknown = 1"),
            Err(ServerError::Config { .. })
        ));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerConfig::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }
}
