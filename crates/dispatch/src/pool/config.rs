//! Worker pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{duration_millis, ConfigError, EnvSource};
use crate::reliability::{ErrorMonitorConfig, RetryPolicy};

/// What happens to the slot of a worker whose error monitor breached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErroredPolicy {
    /// Free the slot: a replacement is spawned once work or the
    /// `initial_size` floor calls for one, while the errored worker drains
    #[default]
    Replace,
    /// Retire the slot: the pool runs one worker short from then on
    ReduceCapacity,
}

/// Worker pool configuration
///
/// # Example
///
/// ```
/// use switchyard_dispatch::pool::{ErroredPolicy, PoolConfig};
/// use std::time::Duration;
///
/// let config = PoolConfig::new(4)
///     .with_capacity(2)
///     .with_assign_timeout(Duration::from_secs(5))
///     .with_errored_policy(ErroredPolicy::ReduceCapacity);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of live workers
    pub limit: usize,

    /// Workers spawned up front and kept alive
    pub initial_size: usize,

    /// Items a single worker may have in flight at once
    pub capacity: usize,

    /// Items allowed to wait for a worker before `assign` fails fast
    pub max_pending: usize,

    /// Deadline for one `assign`, queueing included
    #[serde(with = "duration_millis")]
    pub assign_timeout: Duration,

    /// How long shutdown waits for in-flight work before killing workers
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// How long a new worker may take to signal readiness
    #[serde(with = "duration_millis")]
    pub spawn_timeout: Duration,

    /// Error density monitor applied to each worker
    pub worker_monitor: ErrorMonitorConfig,

    /// Optional monitor over every failure in the pool
    #[serde(default)]
    pub pool_monitor: Option<ErrorMonitorConfig>,

    /// Retries for workers that fail to come up
    pub spawn_retry: RetryPolicy,

    /// Handling of workers whose monitor breached
    #[serde(default)]
    pub errored_policy: ErroredPolicy,

    /// Kill a worker whose assignment timed out
    pub terminate_on_timeout: bool,

    /// Buffered lifecycle events per subscriber
    pub event_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            limit: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            initial_size: 0,
            capacity: 1,
            max_pending: 1024,
            assign_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            spawn_timeout: Duration::from_secs(10),
            worker_monitor: ErrorMonitorConfig::default(),
            pool_monitor: None,
            spawn_retry: RetryPolicy::default(),
            errored_policy: ErroredPolicy::default(),
            terminate_on_timeout: true,
            event_capacity: 256,
        }
    }
}

impl PoolConfig {
    /// Create a configuration for at most `limit` workers
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    /// Create configuration from `SWITCHYARD_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::from_source(&EnvSource::new(|name| std::env::var(name).ok()))?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn from_source<F>(env: &EnvSource<F>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(limit) = env.parse("POOL_LIMIT")? {
            config.limit = limit;
        }
        if let Some(initial_size) = env.parse("POOL_INITIAL_SIZE")? {
            config.initial_size = initial_size;
        }
        if let Some(capacity) = env.parse("WORKER_CAPACITY")? {
            config.capacity = capacity;
        }
        if let Some(max_pending) = env.parse("MAX_PENDING")? {
            config.max_pending = max_pending;
        }
        if let Some(timeout) = env.millis("ASSIGN_TIMEOUT_MS")? {
            config.assign_timeout = timeout;
        }
        if let Some(timeout) = env.millis("SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = timeout;
        }
        if let Some(timeout) = env.millis("SPAWN_TIMEOUT_MS")? {
            config.spawn_timeout = timeout;
        }
        if let Some(threshold) = env.parse("ERROR_THRESHOLD")? {
            config.worker_monitor.threshold = threshold;
        }
        if let Some(window) = env.millis("ERROR_WINDOW_MS")? {
            config.worker_monitor.density_interval = window;
        }
        if let Some(period) = env.millis("ERROR_INIT_PERIOD_MS")? {
            config.worker_monitor.init_period = period;
        }
        if let Some(attempts) = env.parse("SPAWN_RETRY_ATTEMPTS")? {
            config.spawn_retry = config.spawn_retry.with_max_attempts(attempts);
        }
        if let Some(delay) = env.millis("SPAWN_RETRY_DELAY_MS")? {
            config.spawn_retry = config.spawn_retry.with_base_delay(delay);
        }
        Ok(config)
    }

    /// Check the settings are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::ZeroLimit);
        }
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.initial_size > self.limit {
            return Err(ConfigError::InitialSizeAboveLimit {
                initial_size: self.initial_size,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Set the worker limit
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set the number of workers spawned up front
    pub fn with_initial_size(mut self, size: usize) -> Self {
        self.initial_size = size;
        self
    }

    /// Set per-worker concurrency
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the pending queue bound
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Set the assignment deadline
    pub fn with_assign_timeout(mut self, timeout: Duration) -> Self {
        self.assign_timeout = timeout;
        self
    }

    /// Set the graceful shutdown deadline
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the readiness deadline
    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Set the per-worker error monitor
    pub fn with_worker_monitor(mut self, config: ErrorMonitorConfig) -> Self {
        self.worker_monitor = config;
        self
    }

    /// Enable the pool-wide error monitor
    pub fn with_pool_monitor(mut self, config: ErrorMonitorConfig) -> Self {
        self.pool_monitor = Some(config);
        self
    }

    /// Set the spawn retry policy
    pub fn with_spawn_retry(mut self, policy: RetryPolicy) -> Self {
        self.spawn_retry = policy;
        self
    }

    /// Set the errored-worker policy
    pub fn with_errored_policy(mut self, policy: ErroredPolicy) -> Self {
        self.errored_policy = policy;
        self
    }

    /// Choose whether a timed-out assignment kills its worker
    pub fn with_terminate_on_timeout(mut self, terminate: bool) -> Self {
        self.terminate_on_timeout = terminate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert!(config.limit >= 1);
        assert_eq!(config.capacity, 1);
        assert_eq!(config.assign_timeout, Duration::from_secs(30));
        assert_eq!(config.errored_policy, ErroredPolicy::Replace);
        assert!(config.terminate_on_timeout);
        assert!(config.pool_monitor.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        assert_eq!(
            PoolConfig::new(0).validate(),
            Err(ConfigError::ZeroLimit)
        );
        assert_eq!(
            PoolConfig::new(2).with_capacity(0).validate(),
            Err(ConfigError::ZeroCapacity)
        );
        assert_eq!(
            PoolConfig::new(2).with_initial_size(3).validate(),
            Err(ConfigError::InitialSizeAboveLimit {
                initial_size: 3,
                limit: 2
            })
        );
    }

    #[test]
    fn test_serde_uses_millis_and_defaults_optional_fields() {
        let config = PoolConfig::new(2).with_spawn_timeout(Duration::from_millis(1500));
        let mut json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["spawn_timeout"], 1500);
        assert_eq!(json["errored_policy"], "replace");

        let object = json.as_object_mut().unwrap();
        object.remove("pool_monitor");
        object.remove("errored_policy");
        let parsed: PoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
