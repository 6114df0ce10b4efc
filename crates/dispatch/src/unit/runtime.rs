//! Worker-side runtime
//!
//! [`serve`] drives one worker: it announces readiness, runs every assigned
//! item through the [`Handler`] on its own task, answers store replies, and
//! exits once termination was requested and in-flight work has drained.
//! Thread units call it directly; process workers call [`serve_stdio`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::WORKER_ID_ENV;
use super::protocol::{
    decode_frame, encode_frame, ItemId, Outcome, PoolMessage, WorkFailure, WorkerMessage,
    MAX_FRAME_BYTES,
};
use super::{TransportError, WorkerId, WorkerKind};
use crate::store::{StoreOp, StoreResult};

/// Application logic executed inside a worker
///
/// One handler instance serves every item of its worker, possibly several
/// at once when the pool's per-worker capacity is above one.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Runs once before the worker announces readiness
    async fn init(&self, _ctx: &WorkerContext) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Execute one work item
    async fn handle(&self, payload: Value, ctx: WorkerContext) -> Result<Value, HandlerError>;

    /// Receive a pool-wide broadcast
    async fn on_broadcast(&self, _data: Value, _ctx: &WorkerContext) {}
}

/// Application failure returned by a [`Handler`]
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// Status to surface to the client instead of the default 500
    pub status: Option<u16>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl From<HandlerError> for WorkFailure {
    fn from(error: HandlerError) -> Self {
        Self {
            message: error.message,
            status: error.status,
        }
    }
}

impl From<StoreRequestError> for HandlerError {
    fn from(error: StoreRequestError) -> Self {
        Self::new(error.to_string())
    }
}

/// Errors reaching the shared store from inside a worker
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreRequestError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The pool went away before answering
    #[error("store request was not answered")]
    NoReply,

    /// The store refused the operation
    #[error("store rejected request: {0}")]
    Rejected(String),

    /// The reply does not fit the request
    #[error("unexpected store reply: {0:?}")]
    UnexpectedReply(StoreResult),
}

/// Errors that end a worker
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The handler refused to start
    #[error("worker initialization failed: {0}")]
    Init(#[source] HandlerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The process environment is unusable
    #[error("invalid worker environment: {0}")]
    Environment(String),

    /// Framing on stdio failed
    #[error("stdio framing failed: {0}")]
    Codec(#[from] LinesCodecError),
}

/// Where a worker's outbound messages go
pub trait MessageSink: Send + Sync + 'static {
    fn deliver(&self, message: WorkerMessage) -> Result<(), TransportError>;
}

impl MessageSink for mpsc::UnboundedSender<WorkerMessage> {
    fn deliver(&self, message: WorkerMessage) -> Result<(), TransportError> {
        self.send(message).map_err(|_| TransportError::PoolClosed)
    }
}

/// Per-worker context handed to every handler call
///
/// Cheap to clone. Store methods travel to the pool as `Store` frames and
/// resolve when the matching reply arrives.
#[derive(Clone)]
pub struct WorkerContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    worker_id: WorkerId,
    kind: WorkerKind,
    sink: Arc<dyn MessageSink>,
    pending: Mutex<HashMap<u64, oneshot::Sender<StoreResult>>>,
    next_request: AtomicU64,
}

impl WorkerContext {
    pub fn new(worker_id: WorkerId, kind: WorkerKind, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                worker_id,
                kind,
                sink,
                pending: Mutex::new(HashMap::new()),
                next_request: AtomicU64::new(1),
            }),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.inner.worker_id
    }

    pub fn kind(&self) -> WorkerKind {
        self.inner.kind
    }

    /// Send one raw store operation and wait for its result
    pub async fn store(&self, op: StoreOp) -> Result<StoreResult, StoreRequestError> {
        let request = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request, tx);

        if let Err(e) = self.send(WorkerMessage::Store { request, op }) {
            self.inner.pending.lock().remove(&request);
            return Err(e.into());
        }

        rx.await.map_err(|_| StoreRequestError::NoReply)
    }

    /// Read a key from the shared store
    pub async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>, StoreRequestError> {
        let op = StoreOp::Get {
            scope: scope.to_owned(),
            key: key.to_owned(),
        };
        match self.store(op).await? {
            StoreResult::Found { value } => Ok(Some(value)),
            StoreResult::Missing => Ok(None),
            StoreResult::Failed { message } => Err(StoreRequestError::Rejected(message)),
            other => Err(StoreRequestError::UnexpectedReply(other)),
        }
    }

    /// Write a key in the shared store
    pub async fn set(&self, scope: &str, key: &str, value: Value) -> Result<(), StoreRequestError> {
        let op = StoreOp::Set {
            scope: scope.to_owned(),
            key: key.to_owned(),
            value,
        };
        self.expect_done(op).await
    }

    /// Remove a key from the shared store
    pub async fn delete(&self, scope: &str, key: &str) -> Result<(), StoreRequestError> {
        let op = StoreOp::Delete {
            scope: scope.to_owned(),
            key: key.to_owned(),
        };
        self.expect_done(op).await
    }

    /// Atomically add `by` to an integer key, returning the new value
    pub async fn increment(&self, scope: &str, key: &str, by: i64) -> Result<i64, StoreRequestError> {
        let op = StoreOp::Increment {
            scope: scope.to_owned(),
            key: key.to_owned(),
            by,
        };
        match self.store(op).await? {
            StoreResult::Found { value } => match value.as_i64() {
                Some(n) => Ok(n),
                None => Err(StoreRequestError::UnexpectedReply(StoreResult::Found { value })),
            },
            StoreResult::Failed { message } => Err(StoreRequestError::Rejected(message)),
            other => Err(StoreRequestError::UnexpectedReply(other)),
        }
    }

    async fn expect_done(&self, op: StoreOp) -> Result<(), StoreRequestError> {
        match self.store(op).await? {
            StoreResult::Done => Ok(()),
            StoreResult::Failed { message } => Err(StoreRequestError::Rejected(message)),
            other => Err(StoreRequestError::UnexpectedReply(other)),
        }
    }

    fn send(&self, message: WorkerMessage) -> Result<(), TransportError> {
        self.inner.sink.deliver(message)
    }

    fn resolve(&self, request: u64, result: StoreResult) {
        match self.inner.pending.lock().remove(&request) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => warn!(request, "store reply for unknown request"),
        }
    }

    /// Fail every outstanding store request
    fn abandon_store_requests(&self) {
        self.inner.pending.lock().clear();
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("worker_id", &self.inner.worker_id)
            .field("kind", &self.inner.kind)
            .finish_non_exhaustive()
    }
}

/// Run one worker until it is told to stop
///
/// Returns once a `Terminate` message arrived (or the inbound channel
/// closed) and every in-flight item has reported back, or immediately when
/// `cancel` fires, initialization included.
pub async fn serve(
    handler: Arc<dyn Handler>,
    worker_id: WorkerId,
    kind: WorkerKind,
    mut inbound: mpsc::UnboundedReceiver<PoolMessage>,
    sink: Arc<dyn MessageSink>,
    cancel: CancellationToken,
) -> Result<(), WorkerError> {
    let ctx = WorkerContext::new(worker_id, kind, sink);

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(worker_id, "worker cancelled before coming online");
            return Ok(());
        }
        result = handler.init(&ctx) => result.map_err(WorkerError::Init)?,
    }
    ctx.send(WorkerMessage::Online)?;
    info!(worker_id, %kind, "worker online");

    let mut tasks = JoinSet::new();
    let mut draining = false;
    let mut inbound_open = true;

    loop {
        if draining && tasks.is_empty() {
            break;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(worker_id, in_flight = tasks.len(), "worker cancelled");
                tasks.abort_all();
                return Ok(());
            }

            Some(joined) = tasks.join_next() => {
                if let Err(e) = joined {
                    warn!(worker_id, error = %e, "work task ended abnormally");
                }
            }

            message = inbound.recv(), if inbound_open => match message {
                Some(PoolMessage::Assign { id, payload }) => {
                    if draining {
                        let failure = WorkFailure::new("worker is terminating").with_status(503);
                        ctx.send(WorkerMessage::Completed { id, outcome: Outcome::Failure(failure) })?;
                        continue;
                    }
                    tasks.spawn(run_item(Arc::clone(&handler), ctx.clone(), id, payload));
                }
                Some(PoolMessage::Broadcast { data }) => handler.on_broadcast(data, &ctx).await,
                Some(PoolMessage::StoreReply { request, result }) => ctx.resolve(request, result),
                Some(PoolMessage::Terminate) => {
                    debug!(worker_id, in_flight = tasks.len(), "termination requested, draining");
                    draining = true;
                }
                None => {
                    debug!(worker_id, "pool channel closed, draining");
                    inbound_open = false;
                    draining = true;
                    ctx.abandon_store_requests();
                }
            },
        }
    }

    info!(worker_id, "worker stopped");
    Ok(())
}

async fn run_item(handler: Arc<dyn Handler>, ctx: WorkerContext, id: ItemId, payload: Value) {
    let result = AssertUnwindSafe(handler.handle(payload, ctx.clone()))
        .catch_unwind()
        .await;

    let outcome = match result {
        Ok(Ok(output)) => Outcome::Success { output },
        Ok(Err(e)) => Outcome::Failure(e.into()),
        Err(panic) => Outcome::Failure(WorkFailure::new(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };

    if let Err(e) = ctx.send(WorkerMessage::Completed { id, outcome }) {
        warn!(item = %id, error = %e, "could not report completion");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Run a process worker over stdin/stdout
///
/// The worker id comes from the environment the pool sets up. Logging must
/// go to stderr; anything else written to stdout corrupts the channel.
///
/// Reading stdin parks a blocking thread, so callers should end the
/// process explicitly once this returns.
pub async fn serve_stdio(handler: Arc<dyn Handler>) -> Result<(), WorkerError> {
    let worker_id = match std::env::var(WORKER_ID_ENV) {
        Ok(raw) => raw.parse::<WorkerId>().map_err(|e| {
            WorkerError::Environment(format!("{WORKER_ID_ENV}={raw:?}: {e}"))
        })?,
        Err(_) => 0,
    };

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WorkerMessage>();

    let reader = tokio::spawn(async move {
        let mut frames = FramedRead::new(
            tokio::io::stdin(),
            LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
        );
        while let Some(line) = frames.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match decode_frame::<PoolMessage>(&line) {
                Ok(message) => {
                    if inbound_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "dropping undecodable frame"),
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut frames = FramedWrite::new(tokio::io::stdout(), LinesCodec::new());
        while let Some(message) = outbound_rx.recv().await {
            match encode_frame(&message) {
                Ok(line) => frames.send(line).await?,
                Err(e) => warn!(error = %e, "dropping unencodable message"),
            }
        }
        Ok::<_, LinesCodecError>(())
    });

    let sink: Arc<dyn MessageSink> = Arc::new(outbound_tx);
    let result = serve(
        handler,
        worker_id,
        WorkerKind::Process,
        inbound_rx,
        sink,
        CancellationToken::new(),
    )
    .await;

    reader.abort();
    // Every sender is gone now; the writer flushes what is left and stops.
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            if result.is_ok() {
                return Err(e.into());
            }
        }
        Err(e) => warn!(error = %e, "stdout writer task failed"),
    }
    result
}
