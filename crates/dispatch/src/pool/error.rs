//! Pool error types

use std::time::Duration;

use crate::config::ConfigError;
use crate::unit::WorkerId;

/// Why an `assign` call produced no output
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AssignError {
    /// Every worker is busy and the pending queue is full
    #[error("pool saturated: {pending} items already pending")]
    Backpressure { pending: usize },

    /// The item did not finish in time
    #[error("assignment timed out after {after:?}")]
    Timeout { after: Duration },

    /// The worker went away while executing the item
    #[error("worker {worker} terminated before completing the item")]
    WorkerTerminated { worker: WorkerId },

    /// The worker reported a failure
    #[error("worker failed: {message}")]
    Application {
        message: String,
        status: Option<u16>,
    },

    /// The item could not be delivered to the worker
    #[error("transport failure: {0}")]
    Transport(String),

    /// The pool is draining
    #[error("pool is shutting down")]
    ShuttingDown,

    /// The pool-wide error monitor breached
    #[error("pool is disabled after an error density breach")]
    Disabled,

    /// Every slot has been retired
    #[error("pool has no capacity left")]
    NoCapacity,

    /// Workers could not be started
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// The pool task is gone
    #[error("pool is closed")]
    Closed,
}

impl AssignError {
    /// Status code to report to a raw client
    pub fn status(&self) -> u16 {
        match self {
            Self::Timeout { .. } => 408,
            Self::Application { status, .. } => status.unwrap_or(500),
            Self::WorkerTerminated { .. } | Self::Transport(_) => 502,
            Self::Backpressure { .. }
            | Self::ShuttingDown
            | Self::Disabled
            | Self::NoCapacity
            | Self::SpawnFailed(_)
            | Self::Closed => 503,
        }
    }

    /// Whether the failure was raised before any worker saw the item
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::Backpressure { .. } | Self::ShuttingDown | Self::Disabled | Self::NoCapacity
        )
    }
}

/// Pool management errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Configuration error
    #[error("invalid pool configuration: {0}")]
    Config(#[from] ConfigError),

    /// The pool needs a tokio runtime to run its task on
    #[error("worker pool must be created inside a tokio runtime")]
    NoRuntime,

    /// The pool task is gone
    #[error("worker pool is closed")]
    Closed,

    /// Workers still had work when the shutdown deadline passed
    #[error("graceful shutdown timed out; {forced} workers were killed")]
    ShutdownTimeout { forced: usize },
}
