//! Thread-backed worker units
//!
//! Each unit owns a dedicated OS thread running a single-threaded tokio
//! runtime, so a handler that blocks or spins only stalls its own worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::protocol::{PoolMessage, WorkerMessage};
use super::runtime::{serve, Handler, MessageSink};
use super::{
    EventSender, SpawnError, TransportError, UnitEvent, UnitExit, UnitSender, WorkerFactory,
    WorkerId, WorkerKind, WorkerUnit,
};

/// Creates thread units that all run the same [`Handler`]
pub struct ThreadWorkerFactory {
    handler: Arc<dyn Handler>,
}

impl ThreadWorkerFactory {
    pub fn new(handler: impl Handler) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    pub fn from_arc(handler: Arc<dyn Handler>) -> Self {
        Self { handler }
    }
}

impl std::fmt::Debug for ThreadWorkerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadWorkerFactory").finish_non_exhaustive()
    }
}

impl WorkerFactory for ThreadWorkerFactory {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Thread
    }

    fn spawn(&self, id: WorkerId, events: EventSender) -> Result<Box<dyn WorkerUnit>, SpawnError> {
        let (tx, inbound) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handler = Arc::clone(&self.handler);
        let worker_cancel = cancel.clone();

        std::thread::Builder::new()
            .name(format!("switchyard-worker-{id}"))
            .spawn(move || {
                let exit = run_thread(handler, id, inbound, events.clone(), worker_cancel);
                debug!(worker_id = id, clean = exit.clean, detail = %exit.detail, "worker thread exited");
                // Same channel as the worker's messages, so this lands last.
                let _ = events.send((id, UnitEvent::Exited(exit)));
            })
            .map_err(SpawnError::Thread)?;

        Ok(Box::new(ThreadUnit {
            id,
            sender: UnitSender::new(id, tx),
            cancel,
        }))
    }
}

fn run_thread(
    handler: Arc<dyn Handler>,
    id: WorkerId,
    inbound: mpsc::UnboundedReceiver<PoolMessage>,
    events: EventSender,
    cancel: CancellationToken,
) -> UnitExit {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return UnitExit::failed(format!("failed to build worker runtime: {e}")),
    };

    let sink: Arc<dyn MessageSink> = Arc::new(TaggedSink { id, events });
    let result = catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(serve(handler, id, WorkerKind::Thread, inbound, sink, cancel))
    }));

    match result {
        Ok(Ok(())) => UnitExit::clean(),
        Ok(Err(e)) => {
            warn!(worker_id = id, error = %e, "worker failed");
            UnitExit::failed(e.to_string())
        }
        Err(_) => UnitExit::failed("worker thread panicked"),
    }
}

/// Tags a thread worker's messages with its id on the pool's event channel
struct TaggedSink {
    id: WorkerId,
    events: EventSender,
}

impl MessageSink for TaggedSink {
    fn deliver(&self, message: WorkerMessage) -> Result<(), TransportError> {
        self.events
            .send((self.id, UnitEvent::Message(message)))
            .map_err(|_| TransportError::PoolClosed)
    }
}

struct ThreadUnit {
    id: WorkerId,
    sender: UnitSender,
    cancel: CancellationToken,
}

impl WorkerUnit for ThreadUnit {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Thread
    }

    fn sender(&self) -> &UnitSender {
        &self.sender
    }

    fn terminate(&mut self) {
        // A handler stuck in blocking code keeps its thread until it returns;
        // the unit is gone for the pool either way.
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{HandlerError, ItemId, Outcome, WorkerContext};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, payload: Value, ctx: WorkerContext) -> Result<Value, HandlerError> {
            if payload == json!("hang") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(json!({"worker": ctx.worker_id(), "echo": payload}))
        }
    }

    async fn next_event(
        events: &mut mpsc::UnboundedReceiver<(WorkerId, UnitEvent)>,
    ) -> (WorkerId, UnitEvent) {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event within deadline")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn test_thread_unit_round_trip() {
        let factory = ThreadWorkerFactory::new(Echo);
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let unit = factory.spawn(9, events_tx).unwrap();
        assert_eq!(unit.kind(), WorkerKind::Thread);
        assert_eq!(
            next_event(&mut events).await,
            (9, UnitEvent::Message(WorkerMessage::Online))
        );

        let id = ItemId::new();
        unit.send(PoolMessage::Assign {
            id,
            payload: json!("hi"),
        })
        .unwrap();
        assert_eq!(
            next_event(&mut events).await,
            (
                9,
                UnitEvent::Message(WorkerMessage::Completed {
                    id,
                    outcome: Outcome::Success {
                        output: json!({"worker": 9, "echo": "hi"})
                    },
                })
            )
        );

        unit.send(PoolMessage::Terminate).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            (9, UnitEvent::Exited(UnitExit::clean()))
        );
    }

    #[tokio::test]
    async fn test_terminate_abandons_in_flight_work() {
        let factory = ThreadWorkerFactory::new(Echo);
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let mut unit = factory.spawn(1, events_tx).unwrap();
        next_event(&mut events).await;

        unit.send(PoolMessage::Assign {
            id: ItemId::new(),
            payload: json!("hang"),
        })
        .unwrap();
        unit.terminate();

        let (id, event) = next_event(&mut events).await;
        assert_eq!(id, 1);
        assert!(matches!(event, UnitEvent::Exited(_)));
    }
}
