//! Worker execution units
//!
//! A worker unit wraps one isolated execution context behind a uniform
//! contract: the pool sends [`PoolMessage`]s through a [`UnitSender`],
//! receives [`UnitEvent`]s on the channel handed over at spawn time, and can
//! force a unit down with [`WorkerUnit::terminate`]. Which primitive backs
//! the unit is invisible to the pool.
//!
//! This module provides:
//! - [`WorkerUnit`] / [`WorkerFactory`] - The capability set the pool depends on
//! - [`ThreadWorkerFactory`] - Units backed by a dedicated OS thread
//! - [`ProcessWorkerFactory`] - Units backed by a child process over stdio
//! - [`Handler`] / [`serve`] / [`serve_stdio`] - The worker-side runtime
//! - [`PoolMessage`] / [`WorkerMessage`] - The channel protocol
//!
//! # Lifecycle
//!
//! ```text
//!              online signal            dispatch
//! ┌──────────┐ ───────────► ┌────────┐ ─────────► ┌──────┐
//! │ Spawning │              │ Online │ ◄───────── │ Busy │
//! └──────────┘              └────────┘ completion └──────┘
//!      │                                  density breach │
//!      │                                                 ▼
//!      │        exit, kill or shutdown              ┌─────────┐
//!      └─────────────► (slot removed) ◄──────────── │ Errored │
//!                                         drained   └─────────┘
//! ```
//!
//! A terminated unit has no state of its own: the pool drops its slot and
//! emits [`PoolEvent::Terminated`](crate::pool::PoolEvent::Terminated).

mod process;
mod protocol;
mod runtime;
mod thread;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use process::{ProcessWorkerFactory, WORKER_ID_ENV, WORKER_KIND_ENV};
pub use protocol::{
    decode_frame, encode_frame, ItemId, Outcome, PoolMessage, ProtocolError, WorkFailure,
    WorkerMessage, MAX_FRAME_BYTES,
};
pub use runtime::{
    serve, serve_stdio, Handler, HandlerError, MessageSink, StoreRequestError, WorkerContext,
    WorkerError,
};
pub use thread::ThreadWorkerFactory;

/// Numeric worker identity, unique within one pool
pub type WorkerId = u64;

/// Which execution primitive backs a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// A dedicated OS thread in the pool's process
    Thread,
    /// A child OS process
    Process,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => write!(f, "thread"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Lifecycle state of a unit as tracked by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Created, readiness not yet signalled
    Spawning,
    /// Ready with no work in flight
    Online,
    /// At least one item in flight
    Busy,
    /// Density breach; drains in-flight work, receives nothing new
    Errored,
}

impl WorkerState {
    /// Whether the unit may receive new assignments (capacity aside)
    pub fn accepts_work(self) -> bool {
        matches!(self, Self::Online | Self::Busy)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawning => write!(f, "spawning"),
            Self::Online => write!(f, "online"),
            Self::Busy => write!(f, "busy"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// How an execution unit ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitExit {
    /// Whether the unit exited on its own terms
    pub clean: bool,
    /// Human-readable exit description
    pub detail: String,
}

impl UnitExit {
    /// A clean exit
    pub fn clean() -> Self {
        Self {
            clean: true,
            detail: "exited".to_string(),
        }
    }

    /// An abnormal exit
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            clean: false,
            detail: detail.into(),
        }
    }
}

/// Something a unit reports to the pool
#[derive(Debug, Clone, PartialEq)]
pub enum UnitEvent {
    /// A protocol message from the worker
    Message(WorkerMessage),
    /// The execution unit is gone; always the unit's last event
    Exited(UnitExit),
}

/// Channel every unit of a pool reports on
pub type EventSender = mpsc::UnboundedSender<(WorkerId, UnitEvent)>;

/// Transport errors on a unit's channel
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    /// The receiving side of the channel is gone
    #[error("channel to worker {0} is closed")]
    Closed(WorkerId),

    /// The worker's channel back to the pool is gone
    #[error("channel to the pool is closed")]
    PoolClosed,
}

/// Errors creating an execution unit
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The OS refused to start a thread
    #[error("failed to start worker thread: {0}")]
    Thread(#[source] std::io::Error),

    /// The OS refused to start a process
    #[error("failed to start worker process {program}: {source}")]
    Process {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A piped stdio handle was not available after spawn
    #[error("worker process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// Cloneable sending half of a unit's channel
#[derive(Debug, Clone)]
pub struct UnitSender {
    id: WorkerId,
    tx: mpsc::UnboundedSender<PoolMessage>,
}

impl UnitSender {
    /// Wrap the pool-to-worker channel of unit `id`
    pub fn new(id: WorkerId, tx: mpsc::UnboundedSender<PoolMessage>) -> Self {
        Self { id, tx }
    }

    /// Queue a message for the worker
    pub fn send(&self, message: PoolMessage) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .map_err(|_| TransportError::Closed(self.id))
    }
}

/// One execution unit as seen by the pool
pub trait WorkerUnit: Send {
    /// Unit identity
    fn id(&self) -> WorkerId;

    /// Backing primitive
    fn kind(&self) -> WorkerKind;

    /// Sending half of the unit's channel
    fn sender(&self) -> &UnitSender;

    /// Send one message to the worker
    fn send(&self, message: PoolMessage) -> Result<(), TransportError> {
        self.sender().send(message)
    }

    /// Force the unit down without waiting for in-flight work
    fn terminate(&mut self);
}

/// Creates units of one kind
///
/// `spawn` must not block: the unit starts in `Spawning` and announces
/// readiness with [`WorkerMessage::Online`] on `events`.
pub trait WorkerFactory: Send + Sync {
    /// Kind of the units this factory creates
    fn kind(&self) -> WorkerKind;

    /// Start a new unit reporting on `events`
    fn spawn(&self, id: WorkerId, events: EventSender) -> Result<Box<dyn WorkerUnit>, SpawnError>;
}
