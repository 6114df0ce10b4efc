//! Cluster configuration
//!
//! Every component carries its own serde-friendly config struct with
//! `Default` and `with_*` builders. [`ClusterConfig`] aggregates them and
//! overlays `SWITCHYARD_*` environment variables on top of the defaults.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fastpath::AdmissionLimits;
use crate::pool::PoolConfig;
use crate::telemetry::LoggingConfig;

/// Environment variable prefix shared by every setting
pub const ENV_PREFIX: &str = "SWITCHYARD_";

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable holds a value that does not parse
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },

    /// A pool needs room for at least one worker
    #[error("pool limit must be at least 1")]
    ZeroLimit,

    /// A worker needs room for at least one item
    #[error("worker capacity must be at least 1")]
    ZeroCapacity,

    /// More workers requested up front than the pool may hold
    #[error("initial size {initial_size} exceeds pool limit {limit}")]
    InitialSizeAboveLimit { initial_size: usize, limit: usize },
}

/// Complete configuration of one dispatch front end
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Worker pool settings
    pub pool: PoolConfig,
    /// Fast-path admission limits
    pub admission: AdmissionLimits,
    /// Logging setup
    pub logging: LoggingConfig,
}

impl ClusterConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables (all optional, prefixed with `SWITCHYARD_`):
    /// - `POOL_LIMIT`, `POOL_INITIAL_SIZE`, `WORKER_CAPACITY`, `MAX_PENDING`
    /// - `ASSIGN_TIMEOUT_MS`, `SHUTDOWN_TIMEOUT_MS`, `SPAWN_TIMEOUT_MS`
    /// - `ERROR_THRESHOLD`, `ERROR_WINDOW_MS`, `ERROR_INIT_PERIOD_MS`
    /// - `SPAWN_RETRY_ATTEMPTS`, `SPAWN_RETRY_DELAY_MS`
    /// - `MAX_URI_LENGTH`, `MAX_HEADERS_SIZE`, `MAX_PAYLOAD_SIZE`
    /// - `RUST_LOG` or `LOG_LEVEL` for the log filter
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource::new(lookup);
        let config = Self {
            pool: PoolConfig::from_source(&env)?,
            admission: AdmissionLimits::from_source(&env)?,
            logging: LoggingConfig::from_lookup(|name| env.raw(name)),
        };
        config.pool.validate()?;
        Ok(config)
    }
}

/// Typed access to prefixed variables
pub(crate) struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    pub(crate) fn new(lookup: F) -> Self {
        Self { lookup }
    }

    /// Look up an unprefixed variable
    pub(crate) fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    /// Parse `SWITCHYARD_<name>`; unset or blank yields `None`
    pub(crate) fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let var = format!("{ENV_PREFIX}{name}");
        let Some(raw) = (self.lookup)(&var) else {
            return Ok(None);
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            })
    }

    /// Parse `SWITCHYARD_<name>` as a millisecond duration
    pub(crate) fn millis(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }
}

/// Serialize `Duration` as integer milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
