//! Lifecycle events and pool introspection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::unit::{ItemId, WorkerId, WorkerKind, WorkerState};

/// Lifecycle notifications published to [`WorkerPool::subscribe`] receivers
///
/// [`WorkerPool::subscribe`]: super::WorkerPool::subscribe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    /// A worker signalled readiness and joined the rotation
    Online { worker: WorkerId, kind: WorkerKind },

    /// A worker or one of its items failed
    Error {
        worker: Option<WorkerId>,
        item: Option<ItemId>,
        message: String,
    },

    /// A worker's error density breached; it receives no new work
    Errored { worker: WorkerId, failures: usize },

    /// A worker left the rotation for good
    Terminated { worker: WorkerId, reason: String },

    /// The pool-wide error density breached; the pool is disabled
    PoolBreach { failures: usize },

    /// Workers could not be brought up within the retry budget
    Fatal { message: String, attempts: u32 },
}

/// Pool-level status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Accepting work
    Running,
    /// Pool-wide breach; rejecting work until reset
    Disabled,
    /// Draining workers
    ShuttingDown,
    /// Every worker is gone
    Stopped,
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub kind: WorkerKind,
    pub state: WorkerState,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    /// Failures still inside the monitor's window
    pub recent_failures: usize,
    pub spawned_at: DateTime<Utc>,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub status: PoolStatus,
    /// Workers ordered by id
    pub workers: Vec<WorkerSnapshot>,
    /// Items waiting for a worker
    pub pending: usize,
    /// Items a worker is executing
    pub in_flight: usize,
    /// Broadcasts replayed to new workers
    pub broadcasts: usize,
    /// Slots given up under [`ErroredPolicy::ReduceCapacity`](super::ErroredPolicy)
    pub retired: usize,
    pub taken_at: DateTime<Utc>,
}

impl PoolSnapshot {
    /// Workers currently in `state`
    pub fn count_in(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| w.state == state).count()
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerSnapshot> {
        self.workers.iter().find(|w| w.id == id)
    }
}
