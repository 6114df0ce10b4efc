//! Reliability patterns for the dispatch pool
//!
//! This module provides:
//! - [`ErrorMonitor`] - Sliding-window failure density detector with an edge-triggered breach
//! - [`RetryPolicy`] - Bounded respawn backoff for workers that fail to come up

mod error_monitor;
mod retry;

pub use error_monitor::{
    BreachCallback, BreachInfo, ErrorMonitor, ErrorMonitorBuilder, ErrorMonitorConfig,
    MonitorConfigError,
};
pub use retry::RetryPolicy;
