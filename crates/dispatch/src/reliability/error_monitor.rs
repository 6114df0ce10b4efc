//! Error density monitoring
//!
//! An [`ErrorMonitor`] watches the failure stream of one subject (a worker or
//! the whole pool) and fires its breach callback when too many failures land
//! inside a sliding window.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::duration_millis;

/// Error monitor configuration
///
/// # Example
///
/// ```
/// use switchyard_dispatch::reliability::ErrorMonitorConfig;
/// use std::time::Duration;
///
/// let config = ErrorMonitorConfig::default()
///     .with_threshold(5)
///     .with_density_interval(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorMonitorConfig {
    /// Grace period after construction during which failures are ignored
    #[serde(with = "duration_millis")]
    pub init_period: Duration,

    /// Width of the sliding window failures are counted in
    #[serde(with = "duration_millis")]
    pub density_interval: Duration,

    /// Failures tolerated inside the window; one more is a breach
    pub threshold: usize,
}

impl Default for ErrorMonitorConfig {
    fn default() -> Self {
        Self {
            init_period: Duration::from_secs(3),
            density_interval: Duration::from_secs(3),
            threshold: 3,
        }
    }
}

impl ErrorMonitorConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the startup grace period
    pub fn with_init_period(mut self, period: Duration) -> Self {
        self.init_period = period;
        self
    }

    /// Set the sliding window width
    pub fn with_density_interval(mut self, interval: Duration) -> Self {
        self.density_interval = interval;
        self
    }

    /// Set the number of tolerated failures per window
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }
}

/// Details handed to the breach callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreachInfo {
    /// Failures retained in the window when the breach fired
    pub failures: usize,
    /// Window the failures were counted in
    pub density_interval: Duration,
}

/// Callback invoked once per breach episode
pub type BreachCallback = Box<dyn FnMut(BreachInfo) + Send>;

/// Error monitor configuration errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MonitorConfigError {
    /// The monitor would have nobody to tell about a breach
    #[error("error monitor requires a breach callback")]
    MissingBreachCallback,
}

/// Sliding-window failure density detector
///
/// [`feed`](Self::feed) records one failure. Samples older than the density
/// interval are discarded first; a sample exactly `density_interval` old has
/// expired, so a zero interval keeps only the latest sample. When more than
/// `threshold` samples remain and the grace period is over, the breach
/// callback fires.
///
/// Breach is edge-triggered: once fired, further failures are still
/// recorded but do not fire again until [`reset`](Self::reset).
pub struct ErrorMonitor {
    config: ErrorMonitorConfig,
    created_at: Instant,
    samples: VecDeque<Instant>,
    breached: bool,
    on_breach: BreachCallback,
}

impl ErrorMonitor {
    /// Create a monitor that reports breaches to `on_breach`
    pub fn new<F>(config: ErrorMonitorConfig, on_breach: F) -> Self
    where
        F: FnMut(BreachInfo) + Send + 'static,
    {
        Self {
            config,
            created_at: Instant::now(),
            samples: VecDeque::new(),
            breached: false,
            on_breach: Box::new(on_breach),
        }
    }

    /// Start building a monitor whose callback is supplied separately
    pub fn builder(config: ErrorMonitorConfig) -> ErrorMonitorBuilder {
        ErrorMonitorBuilder {
            config,
            on_breach: None,
        }
    }

    /// Record one failure; returns whether this failure fired the breach
    pub fn feed(&mut self) -> bool {
        let now = Instant::now();

        if now.saturating_duration_since(self.created_at) < self.config.init_period {
            trace!("failure ignored during init period");
            return false;
        }

        self.expire(now);
        self.samples.push_back(now);

        if self.breached || self.samples.len() <= self.config.threshold {
            return false;
        }

        self.fire();
        true
    }

    /// Fire the breach unless already breached; returns whether it fired
    pub fn trigger(&mut self) -> bool {
        if self.breached {
            return false;
        }
        self.fire();
        true
    }

    /// Forget all samples and re-arm the breach trigger
    pub fn reset(&mut self) {
        self.samples.clear();
        self.breached = false;
    }

    /// Whether the current breach episode has fired
    pub fn is_breached(&self) -> bool {
        self.breached
    }

    /// Samples still inside the window
    pub fn sample_count(&mut self) -> usize {
        self.expire(Instant::now());
        self.samples.len()
    }

    /// The monitor's configuration
    pub fn config(&self) -> &ErrorMonitorConfig {
        &self.config
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.samples.front() {
            if now.saturating_duration_since(oldest) < self.config.density_interval {
                break;
            }
            self.samples.pop_front();
        }
    }

    fn fire(&mut self) {
        self.breached = true;
        let info = BreachInfo {
            failures: self.samples.len(),
            density_interval: self.config.density_interval,
        };
        debug!(
            failures = info.failures,
            window_ms = info.density_interval.as_millis() as u64,
            "error density breach"
        );
        (self.on_breach)(info);
    }
}

impl fmt::Debug for ErrorMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMonitor")
            .field("config", &self.config)
            .field("samples", &self.samples.len())
            .field("breached", &self.breached)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ErrorMonitor`]
pub struct ErrorMonitorBuilder {
    config: ErrorMonitorConfig,
    on_breach: Option<BreachCallback>,
}

impl ErrorMonitorBuilder {
    /// Set the breach callback
    pub fn on_breach<F>(mut self, on_breach: F) -> Self
    where
        F: FnMut(BreachInfo) + Send + 'static,
    {
        self.on_breach = Some(Box::new(on_breach));
        self
    }

    /// Build the monitor; fails when no breach callback was given
    pub fn build(self) -> Result<ErrorMonitor, MonitorConfigError> {
        let on_breach = self
            .on_breach
            .ok_or(MonitorConfigError::MissingBreachCallback)?;

        Ok(ErrorMonitor {
            config: self.config,
            created_at: Instant::now(),
            samples: VecDeque::new(),
            breached: false,
            on_breach,
        })
    }
}
