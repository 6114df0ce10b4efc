// Logging setup
//
// Installs a tracing-subscriber registry with an EnvFilter'd fmt layer.
// Output always goes to stderr: process workers reserve stdout for frames.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when neither `RUST_LOG` nor `LOG_LEVEL` is set
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log filter (e.g., "info", "debug", "switchyard_dispatch=trace")
    pub log_filter: Option<String>,
    /// Whether to emit ANSI colour codes
    pub ansi: bool,
    /// Whether to include the event target
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            ansi: true,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `NO_COLOR`: Disables ANSI colours when set
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            log_filter: lookup("RUST_LOG").or_else(|| lookup("LOG_LEVEL")),
            ansi: lookup("NO_COLOR").is_none(),
            with_target: true,
        }
    }

    /// Settings for a process worker: no colours, since stderr is usually
    /// captured by the parent rather than a terminal
    pub fn for_worker_process() -> Self {
        Self {
            ansi: false,
            ..Self::from_env()
        }
    }

    /// Set the log filter
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    fn filter(&self) -> Result<EnvFilter, LoggingError> {
        match &self.log_filter {
            Some(filter) => {
                EnvFilter::try_new(filter).map_err(|e| LoggingError::InvalidFilter {
                    filter: filter.clone(),
                    reason: e.to_string(),
                })
            }
            None => Ok(EnvFilter::new(DEFAULT_LOG_FILTER)),
        }
    }
}

/// Logging setup errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The filter directive does not parse
    #[error("invalid log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    /// A global subscriber was installed earlier
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Install the global subscriber
///
/// # Example
///
/// ```ignore
/// use switchyard_dispatch::telemetry::{init_logging, LoggingConfig};
///
/// init_logging(LoggingConfig::from_env())?;
/// ```
pub fn init_logging(config: LoggingConfig) -> Result<(), LoggingError> {
    let filter = config.filter()?;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .with_target(config.with_target)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}
