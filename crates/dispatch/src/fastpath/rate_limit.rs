//! Per-client request rate limiting
//!
//! Requests are counted per client in two back-to-back windows. The previous
//! window's count is weighted by how much of it still overlaps a window-long
//! span ending now, which approximates a sliding log without keeping one.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::duration_millis;

/// How many requests a client may make per window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    #[serde(with = "duration_millis")]
    pub window: Duration,
}

impl RateLimit {
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// A client went over its rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{hits} requests exceeds limit of {limit}")]
pub struct RateExceeded {
    /// Weighted request count, this request included, rounded up
    pub hits: u32,
    pub limit: u32,
}

#[derive(Debug)]
struct Windows {
    started: Instant,
    previous: HashMap<String, u32>,
    current: HashMap<String, u32>,
}

impl Windows {
    /// Advance to the window containing `now`; windows stay aligned
    fn roll(&mut self, now: Instant, window: Duration) {
        let elapsed = now.duration_since(self.started);
        if window.is_zero() {
            self.previous.clear();
            self.current.clear();
            self.started = now;
            return;
        }
        if elapsed < window {
            return;
        }
        if elapsed < window * 2 {
            self.previous = std::mem::take(&mut self.current);
        } else {
            self.previous.clear();
            self.current.clear();
        }
        let into_window = elapsed.as_nanos() % window.as_nanos();
        self.started = now - Duration::from_nanos(into_window as u64);
    }
}

/// Sliding-window request counter keyed by client
///
/// Rejected requests still count, so a client hammering the gateway stays
/// limited until it backs off.
///
/// # Example
///
/// ```
/// use switchyard_dispatch::fastpath::{RateLimit, RateLimiter};
///
/// # tokio_test::block_on(async {
/// let limiter = RateLimiter::new(RateLimit::per_minute(2));
///
/// assert!(limiter.check("10.0.0.1").is_ok());
/// assert!(limiter.check("10.0.0.1").is_ok());
/// assert!(limiter.check("10.0.0.1").is_err());
/// assert!(limiter.check("10.0.0.2").is_ok());
/// # });
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            windows: Mutex::new(Windows {
                started: Instant::now(),
                previous: HashMap::new(),
                current: HashMap::new(),
            }),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Count one request from `client` and decide whether it may proceed
    pub fn check(&self, client: &str) -> Result<(), RateExceeded> {
        let window = self.limit.window;
        let now = Instant::now();

        let mut windows = self.windows.lock();
        windows.roll(now, window);

        let current = windows.current.entry(client.to_string()).or_insert(0);
        *current = current.saturating_add(1);
        let current = *current;
        let previous = windows.previous.get(client).copied().unwrap_or(0);

        let overlap = if window.is_zero() {
            0.0
        } else {
            1.0 - (now.duration_since(windows.started).as_secs_f64() / window.as_secs_f64())
                .min(1.0)
        };
        let weighted = f64::from(previous) * overlap + f64::from(current);

        if weighted <= f64::from(self.limit.max_requests) {
            Ok(())
        } else {
            Err(RateExceeded {
                hits: weighted.ceil() as u32,
                limit: self.limit.max_requests,
            })
        }
    }

    /// Clients seen in the tracked windows
    pub fn tracked_clients(&self) -> usize {
        let windows = self.windows.lock();
        windows
            .current
            .keys()
            .chain(windows.previous.keys().filter(|k| !windows.current.contains_key(*k)))
            .count()
    }
}
