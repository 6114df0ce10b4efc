//! Respawn backoff for workers that fail to come up

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

/// How often, and how quickly, the pool re-attempts a failed spawn
///
/// A spawn fails when the execution unit cannot be created, exits before
/// signalling readiness, or misses the readiness deadline. Each consecutive
/// failure doubles the wait, up to `max_delay`. After `max_attempts`
/// consecutive failures the pool stops spawning and reports a fatal error.
///
/// # Example
///
/// ```
/// use switchyard_dispatch::reliability::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::fixed(Duration::from_millis(50), 3);
///
/// assert_eq!(policy.next_delay(1), Some(Duration::from_millis(50)));
/// assert_eq!(policy.next_delay(2), Some(Duration::from_millis(50)));
/// assert_eq!(policy.next_delay(3), None);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Spawn attempts in a row, the first one included
    pub max_attempts: u32,

    /// Wait after the first failure
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Longest wait between attempts
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Fraction shaved off each wait at random (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// 3 attempts, 100ms doubling to at most 2s, 20% jitter
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// The same wait before every retry, no jitter
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Wait before the next spawn after `failures` consecutive failures
    ///
    /// `None` means the attempts are used up.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures == 0 {
            return Some(Duration::ZERO);
        }
        if failures >= self.max_attempts {
            return None;
        }

        let doublings = (failures - 1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay);

        if self.jitter > 0.0 && !delay.is_zero() {
            let shave = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
            return Some(delay.mul_f64(1.0 - shave));
        }
        Some(delay)
    }
}
