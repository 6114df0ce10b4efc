//! Worker pool for dispatching work items
//!
//! This module provides:
//! - [`WorkerPool`] - Cloneable handle to a pool of thread or process workers
//! - [`PoolConfig`] - Limits, timeouts, and error density settings
//! - [`PoolEvent`] - Lifecycle notifications for observers
//! - [`AssignError`] - Why an item produced no output
//!
//! # Assignment
//!
//! An item goes to the least-busy worker that is online and below its
//! capacity; ties go to the lowest worker id. With no such worker, the item
//! waits in a FIFO queue of at most `max_pending` entries while the pool
//! spawns workers up to `limit`. A full queue fails fast with
//! [`AssignError::Backpressure`].

mod actor;
mod config;
mod error;
mod events;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, instrument};

pub use self::config::{ErroredPolicy, PoolConfig};
pub use self::error::{AssignError, PoolError};
pub use self::events::{PoolEvent, PoolSnapshot, PoolStatus, WorkerSnapshot};

use self::actor::{Command, PoolCore};
use crate::store::SharedStore;
use crate::unit::{Handler, ProcessWorkerFactory, ThreadWorkerFactory, WorkerFactory, WorkerKind};
use crate::work::{Completion, WorkItem};

/// Handle to a running worker pool
///
/// The pool itself is a background task; handles are cheap to clone and may
/// be used from anywhere. Dropping every handle shuts the pool down.
///
/// # Example
///
/// ```ignore
/// use switchyard_dispatch::pool::{PoolConfig, WorkerPool};
/// use switchyard_dispatch::store::SharedStore;
/// use std::sync::Arc;
///
/// let pool = WorkerPool::threads(PoolConfig::new(4), MyHandler, Arc::new(SharedStore::new()))?;
/// let output = pool.submit(json!({"path": "/echo"})).await?;
/// pool.shutdown().await?;
/// ```
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<PoolEvent>,
    config: Arc<PoolConfig>,
    kind: WorkerKind,
}

impl WorkerPool {
    /// Start a pool whose workers come from `factory`
    ///
    /// Must be called inside a tokio runtime. Workers answer store requests
    /// from `store`.
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn WorkerFactory>,
        store: Arc<SharedStore>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PoolError::NoRuntime)?;

        let config = Arc::new(config);
        let kind = factory.kind();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let core = PoolCore::new(
            Arc::clone(&config),
            factory,
            store,
            events.clone(),
            command_rx,
        );
        runtime.spawn(core.run());

        Ok(Self {
            commands,
            events,
            config,
            kind,
        })
    }

    /// Start a pool of thread workers running `handler`
    pub fn threads(
        config: PoolConfig,
        handler: impl Handler,
        store: Arc<SharedStore>,
    ) -> Result<Self, PoolError> {
        Self::new(config, Arc::new(ThreadWorkerFactory::new(handler)), store)
    }

    /// Start a pool of process workers
    pub fn processes(
        config: PoolConfig,
        factory: ProcessWorkerFactory,
        store: Arc<SharedStore>,
    ) -> Result<Self, PoolError> {
        Self::new(config, Arc::new(factory), store)
    }

    /// Run one item and wait for its terminal result
    ///
    /// Never fails outright: every error, including a closed pool, comes
    /// back inside the [`Completion`] together with the item's connection.
    #[instrument(skip(self, item), fields(item = %item.id))]
    pub async fn assign(&self, item: WorkItem) -> Completion {
        let id = item.id;
        let (reply, rx) = oneshot::channel();

        if let Err(mpsc::error::SendError(command)) =
            self.commands.send(Command::Assign { item, reply })
        {
            let connection = match command {
                Command::Assign { item, .. } => item.connection,
                _ => None,
            };
            return Completion::new(id, Err(AssignError::Closed), connection);
        }

        rx.await
            .unwrap_or_else(|_| Completion::new(id, Err(AssignError::Closed), None))
    }

    /// Run a bare payload and return the worker's output
    pub async fn submit(&self, payload: Value) -> Result<Value, AssignError> {
        self.assign(WorkItem::new(payload)).await.into_result()
    }

    /// Deliver `data` to every live worker and to every worker spawned later
    ///
    /// Returns the number of workers it was delivered to right away.
    #[instrument(skip(self, data))]
    pub async fn broadcast(&self, data: Value) -> Result<usize, PoolError> {
        self.request(|reply| Command::Broadcast { data, reply }).await
    }

    /// Current state of the pool and its workers
    pub async fn snapshot(&self) -> Result<PoolSnapshot, PoolError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Re-arm the pool-wide error monitor and re-enable a disabled pool
    ///
    /// Also lifts the spawn block left behind by a [`PoolEvent::Fatal`].
    #[instrument(skip(self))]
    pub async fn reset(&self) -> Result<(), PoolError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Terminate every worker, draining in-flight work first
    ///
    /// Queued items fail with [`AssignError::ShuttingDown`]. Workers still
    /// busy after `shutdown_timeout` are killed and their items fail with
    /// [`AssignError::WorkerTerminated`]; the call then reports
    /// [`PoolError::ShutdownTimeout`].
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        info!("shutdown requested");
        match self.request(|reply| Command::Shutdown { reply }).await {
            Ok(result) => result,
            // The pool already stopped.
            Err(PoolError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Subscribe to lifecycle events
    ///
    /// Slow receivers lose the oldest events once `event_capacity` of them
    /// are buffered.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Whether the pool task is gone
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T, F>(&self, command: F) -> Result<T, PoolError>
    where
        F: FnOnce(oneshot::Sender<T>) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("kind", &self.kind)
            .field("limit", &self.config.limit)
            .field("closed", &self.is_closed())
            .finish()
    }
}
