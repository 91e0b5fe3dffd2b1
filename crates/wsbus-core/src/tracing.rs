//! Log setup shared by the wsbus binaries.
//!
//! ```ignore
//! use wsbus_core::tracing::{init_tracing, LogConfig};
//!
//! // Interactive tools
//! init_tracing(LogConfig::cli(1))?;
//!
//! // Long-running server
//! init_tracing(LogConfig::service())?;
//! ```

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Target prefix shared by every wsbus crate.
const LOG_TARGET: &str = "wsbus";

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("invalid log filter: {0}")]
    EnvFilter(#[from] tracing_subscriber::filter::ParseError),
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line human output.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// One JSON object per event.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for wsbus targets when `RUST_LOG` is unset.
    pub level: Level,
    pub format: LogFormat,
    /// Include file and line.
    pub with_location: bool,
    pub with_timestamp: bool,
    /// Log span open/close.
    pub with_span_events: bool,
    /// Explicit filter directive; wins over both `level` and `RUST_LOG`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_location: false,
            with_timestamp: true,
            with_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Settings for command-line tools. `verbosity` counts `-v` flags.
    #[must_use]
    pub fn cli(verbosity: u8) -> Self {
        let level = match verbosity {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        Self {
            level,
            format: LogFormat::Compact,
            with_location: verbosity >= 2,
            with_timestamp: false,
            ..Self::default()
        }
    }

    /// Settings for the server process.
    #[must_use]
    pub fn service() -> Self {
        Self {
            format: LogFormat::Json,
            with_location: true,
            with_span_events: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Returns the directive used when neither `filter` nor `RUST_LOG` is set.
    pub fn default_directive(&self) -> String {
        format!("{LOG_TARGET}={}", self.level)
    }

    fn env_filter(&self) -> Result<EnvFilter, TracingError> {
        if let Some(filter) = &self.filter {
            return Ok(EnvFilter::try_new(filter)?);
        }
        Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_directive())))
    }
}

/// Installs the global subscriber. Call once per process.
///
/// # Errors
///
/// Fails if a subscriber is already installed or the filter does not parse.
pub fn init_tracing(config: LogConfig) -> Result<(), TracingError> {
    let filter = config.env_filter()?;
    let spans = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_location)
            .with_line_number(config.with_location)
            .with_span_events(spans)
            .boxed(),
        LogFormat::Compact if config.with_timestamp => fmt::layer()
            .compact()
            .with_file(config.with_location)
            .with_line_number(config.with_location)
            .with_span_events(spans)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .without_time()
            .with_file(config.with_location)
            .with_line_number(config.with_location)
            .with_span_events(spans)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_location)
            .with_line_number(config.with_location)
            .with_span_events(spans)
            .boxed(),
    };

    tracing::subscriber::set_global_default(tracing_subscriber::registry().with(filter).with(layer))?;
    Ok(())
}
