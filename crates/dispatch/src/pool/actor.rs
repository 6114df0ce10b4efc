//! The pool task
//!
//! One task owns every piece of pool bookkeeping (slots, the pending queue,
//! in-flight items, broadcast history) and is driven purely by messages:
//! commands from [`WorkerPool`](super::WorkerPool) handles, events from
//! worker units, and timer expiries. Nothing here is shared, so nothing here
//! is locked.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::config::{ErroredPolicy, PoolConfig};
use super::error::{AssignError, PoolError};
use super::events::{PoolEvent, PoolSnapshot, PoolStatus, WorkerSnapshot};
use crate::reliability::ErrorMonitor;
use crate::store::{SharedStore, StoreOp};
use crate::unit::{
    EventSender, ItemId, Outcome, PoolMessage, UnitEvent, UnitExit, WorkerFactory, WorkerId,
    WorkerMessage, WorkerState, WorkerUnit,
};
use crate::work::{Completion, Connection, WorkItem};

/// Requests from pool handles
pub(super) enum Command {
    Assign {
        item: WorkItem,
        reply: oneshot::Sender<Completion>,
    },
    Broadcast {
        data: Value,
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<PoolSnapshot>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
}

/// Timer expiries
enum Internal {
    ItemTimeout(ItemId),
    ReadinessDeadline(WorkerId),
    RetrySpawn { attempt: u32 },
}

struct Slot {
    unit: Box<dyn WorkerUnit>,
    state: WorkerState,
    in_flight: usize,
    monitor: ErrorMonitor,
    /// Spawn attempt that produced this worker
    attempt: u32,
    readiness: Option<AbortHandle>,
    terminate_sent: bool,
    completed: u64,
    failed: u64,
    spawned_at: DateTime<Utc>,
}

struct Pending {
    item: WorkItem,
    reply: oneshot::Sender<Completion>,
    timer: AbortHandle,
}

struct Running {
    worker: WorkerId,
    connection: Option<Connection>,
    reply: oneshot::Sender<Completion>,
    timer: AbortHandle,
}

struct Draining {
    deadline: Instant,
    waiters: Vec<oneshot::Sender<Result<(), PoolError>>>,
}

pub(super) struct PoolCore {
    config: Arc<PoolConfig>,
    factory: Arc<dyn WorkerFactory>,
    store: Arc<SharedStore>,
    events: broadcast::Sender<PoolEvent>,

    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    unit_events_tx: EventSender,
    unit_events: mpsc::UnboundedReceiver<(WorkerId, UnitEvent)>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal: mpsc::UnboundedReceiver<Internal>,

    slots: BTreeMap<WorkerId, Slot>,
    next_worker: WorkerId,
    pending: VecDeque<Pending>,
    running: HashMap<ItemId, Running>,
    /// Timed-out items whose worker still holds a capacity unit
    abandoned: HashMap<ItemId, WorkerId>,
    history: Vec<Value>,

    pool_monitor: Option<ErrorMonitor>,
    status: PoolStatus,
    retired: usize,
    retries_scheduled: usize,
    /// Last spawn error once the retry budget ran out; blocks spawning
    spawn_exhausted: Option<String>,
    draining: Option<Draining>,
}

impl PoolCore {
    pub(super) fn new(
        config: Arc<PoolConfig>,
        factory: Arc<dyn WorkerFactory>,
        store: Arc<SharedStore>,
        events: broadcast::Sender<PoolEvent>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (unit_events_tx, unit_events) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();

        let pool_monitor = config.pool_monitor.clone().map(|monitor| {
            let events = events.clone();
            ErrorMonitor::new(monitor, move |info| {
                let _ = events.send(PoolEvent::PoolBreach {
                    failures: info.failures,
                });
            })
        });

        Self {
            config,
            factory,
            store,
            events,
            commands,
            commands_open: true,
            unit_events_tx,
            unit_events,
            internal_tx,
            internal,
            slots: BTreeMap::new(),
            next_worker: 1,
            pending: VecDeque::new(),
            running: HashMap::new(),
            abandoned: HashMap::new(),
            history: Vec::new(),
            pool_monitor,
            status: PoolStatus::Running,
            retired: 0,
            retries_scheduled: 0,
            spawn_exhausted: None,
            draining: None,
        }
    }

    pub(super) async fn run(mut self) {
        info!(
            kind = %self.factory.kind(),
            limit = self.config.limit,
            initial_size = self.config.initial_size,
            capacity = self.config.capacity,
            "worker pool started"
        );
        self.replenish();

        while self.status != PoolStatus::Stopped {
            let deadline = self.draining.as_ref().map(|d| d.deadline);

            tokio::select! {
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("all pool handles dropped");
                        self.commands_open = false;
                        self.begin_shutdown(None);
                    }
                },
                Some((worker, event)) = self.unit_events.recv() => self.on_unit_event(worker, event),
                Some(internal) = self.internal.recv() => self.on_internal(internal),
                _ = wait_until(deadline) => self.force_shutdown(),
            }
        }

        self.close_commands();
        info!("worker pool stopped");
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Assign { item, reply } => self.admit(item, reply),
            Command::Broadcast { data, reply } => {
                let delivered = self.broadcast(data);
                let _ = reply.send(delivered);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Reset { reply } => {
                self.reset();
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => self.begin_shutdown(Some(reply)),
        }
    }

    fn admit(&mut self, item: WorkItem, reply: oneshot::Sender<Completion>) {
        if let Some(error) = self.admission_error() {
            debug!(item = %item.id, %error, "item rejected at admission");
            let _ = reply.send(Completion::new(item.id, Err(error), item.connection));
            return;
        }

        let worker = if self.pending.is_empty() {
            self.pick_worker()
        } else {
            None
        };
        // Items waiting on a worker that is starting, or may still be
        // started, are not backlog.
        let bound = self.config.max_pending + self.upcoming_capacity();
        if worker.is_none() && self.pending.len() >= bound {
            let error = AssignError::Backpressure {
                pending: self.pending.len(),
            };
            debug!(item = %item.id, %error, "item rejected");
            let _ = reply.send(Completion::new(item.id, Err(error), item.connection));
            return;
        }

        let timer = self.schedule(self.config.assign_timeout, Internal::ItemTimeout(item.id));
        let pending = Pending { item, reply, timer };
        match worker {
            Some(worker) => self.dispatch_to(worker, pending),
            None => {
                trace!(item = %pending.item.id, queued = self.pending.len() + 1, "item queued");
                self.pending.push_back(pending);
                self.replenish();
            }
        }
    }

    fn admission_error(&self) -> Option<AssignError> {
        match self.status {
            PoolStatus::Running => {}
            PoolStatus::Disabled => return Some(AssignError::Disabled),
            PoolStatus::ShuttingDown | PoolStatus::Stopped => {
                return Some(AssignError::ShuttingDown)
            }
        }
        if self.effective_limit() == 0 {
            return Some(AssignError::NoCapacity);
        }
        if let Some(message) = &self.spawn_exhausted {
            if !self.can_serve() {
                return Some(AssignError::SpawnFailed(message.clone()));
            }
        }
        None
    }

    /// Whether some worker is running or about to
    fn can_serve(&self) -> bool {
        self.slots
            .values()
            .any(|slot| slot.state.accepts_work() || slot.state == WorkerState::Spawning)
    }

    fn broadcast(&mut self, data: Value) -> usize {
        self.history.push(data.clone());

        let mut delivered = 0;
        for (id, slot) in &self.slots {
            // Spawning workers get the whole history once they are online.
            if slot.state == WorkerState::Spawning {
                continue;
            }
            match slot.unit.send(PoolMessage::Broadcast { data: data.clone() }) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(worker = id, error = %e, "broadcast undeliverable"),
            }
        }
        info!(delivered, history = self.history.len(), "broadcast sent");
        delivered
    }

    fn snapshot(&mut self) -> PoolSnapshot {
        let workers = self
            .slots
            .iter_mut()
            .map(|(id, slot)| WorkerSnapshot {
                id: *id,
                kind: slot.unit.kind(),
                state: slot.state,
                in_flight: slot.in_flight,
                completed: slot.completed,
                failed: slot.failed,
                recent_failures: slot.monitor.sample_count(),
                spawned_at: slot.spawned_at,
            })
            .collect();

        PoolSnapshot {
            status: self.status,
            workers,
            pending: self.pending.len(),
            in_flight: self.running.len(),
            broadcasts: self.history.len(),
            retired: self.retired,
            taken_at: Utc::now(),
        }
    }

    fn reset(&mut self) {
        if let Some(monitor) = self.pool_monitor.as_mut() {
            monitor.reset();
        }
        if self.status == PoolStatus::Disabled {
            info!("pool re-enabled");
            self.status = PoolStatus::Running;
        }
        self.spawn_exhausted = None;
        self.pump();
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Least-busy eligible worker; ties go to the lowest id
    fn pick_worker(&self) -> Option<WorkerId> {
        let capacity = self.config.capacity;
        self.slots
            .iter()
            .filter(|(_, slot)| slot.state.accepts_work() && slot.in_flight < capacity)
            .min_by_key(|(_, slot)| slot.in_flight)
            .map(|(id, _)| *id)
    }

    fn dispatch_to(&mut self, worker: WorkerId, pending: Pending) {
        let Pending { item, reply, timer } = pending;
        let WorkItem {
            id,
            payload,
            connection,
        } = item;

        let Some(slot) = self.slots.get_mut(&worker) else {
            timer.abort();
            let error = AssignError::Transport(format!("worker {worker} is gone"));
            let _ = reply.send(Completion::new(id, Err(error), connection));
            return;
        };

        match slot.unit.send(PoolMessage::Assign { id, payload }) {
            Ok(()) => {
                slot.in_flight += 1;
                slot.state = WorkerState::Busy;
                debug!(worker, item = %id, in_flight = slot.in_flight, "item dispatched");
                self.running.insert(
                    id,
                    Running {
                        worker,
                        connection,
                        reply,
                        timer,
                    },
                );
            }
            Err(e) => {
                timer.abort();
                warn!(worker, item = %id, error = %e, "failed to deliver item");
                let error = AssignError::Transport(e.to_string());
                let _ = reply.send(Completion::new(id, Err(error), connection));
                self.record_failure(worker, Some(id), e.to_string());
            }
        }
    }

    /// Move queued items onto free workers, then top up the worker set
    fn pump(&mut self) {
        while !self.pending.is_empty() {
            let Some(worker) = self.pick_worker() else {
                break;
            };
            if let Some(pending) = self.pending.pop_front() {
                self.dispatch_to(worker, pending);
            }
        }

        if self.effective_limit() == 0 && !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "every slot retired, failing queued items");
            self.fail_pending(|| AssignError::NoCapacity);
        }

        self.replenish();
    }

    fn release(&mut self, worker: WorkerId) {
        let Some(slot) = self.slots.get_mut(&worker) else {
            return;
        };
        slot.in_flight = slot.in_flight.saturating_sub(1);
        if slot.in_flight > 0 {
            return;
        }
        match slot.state {
            WorkerState::Busy => slot.state = WorkerState::Online,
            WorkerState::Errored if !slot.terminate_sent => {
                debug!(worker, "errored worker drained, terminating");
                let _ = slot.unit.send(PoolMessage::Terminate);
                slot.terminate_sent = true;
            }
            _ => {}
        }
    }

    fn fail_pending<F>(&mut self, error: F)
    where
        F: Fn() -> AssignError,
    {
        for pending in self.pending.drain(..) {
            pending.timer.abort();
            let id = pending.item.id;
            let _ = pending
                .reply
                .send(Completion::new(id, Err(error()), pending.item.connection));
        }
    }

    // =========================================================================
    // Worker lifecycle
    // =========================================================================

    fn effective_limit(&self) -> usize {
        self.config.limit.saturating_sub(self.retired)
    }

    /// Workers counting against the limit, including scheduled respawns
    fn active_count(&self) -> usize {
        let live = self
            .slots
            .values()
            .filter(|slot| slot.state != WorkerState::Errored)
            .count();
        live + self.retries_scheduled
    }

    /// Items that spawning, retrying or not yet spawned workers can take
    fn upcoming_capacity(&self) -> usize {
        if self.status != PoolStatus::Running {
            return 0;
        }
        let starting = self
            .slots
            .values()
            .filter(|slot| slot.state == WorkerState::Spawning)
            .count()
            + self.retries_scheduled;
        let spawnable = match self.spawn_exhausted {
            Some(_) => 0,
            None => self.effective_limit().saturating_sub(self.active_count()),
        };
        (starting + spawnable) * self.config.capacity
    }

    fn needs_worker(&self) -> bool {
        if matches!(self.status, PoolStatus::ShuttingDown | PoolStatus::Stopped)
            || self.spawn_exhausted.is_some()
        {
            return false;
        }
        let active = self.active_count();
        if active >= self.effective_limit() {
            return false;
        }

        let starting = self
            .slots
            .values()
            .filter(|slot| slot.state == WorkerState::Spawning)
            .count()
            + self.retries_scheduled;
        let below_floor = active < self.config.initial_size;
        let unserved = self.pending.len() > starting * self.config.capacity;
        below_floor || unserved
    }

    fn replenish(&mut self) {
        while self.needs_worker() {
            if !self.spawn_worker(1) {
                break;
            }
        }
    }

    fn spawn_worker(&mut self, attempt: u32) -> bool {
        let id = self.next_worker;
        self.next_worker += 1;

        match self.factory.spawn(id, self.unit_events_tx.clone()) {
            Ok(unit) => {
                debug!(worker = id, attempt, kind = %unit.kind(), "worker spawning");
                let readiness =
                    self.schedule(self.config.spawn_timeout, Internal::ReadinessDeadline(id));
                let monitor = self.worker_monitor(id);
                self.slots.insert(
                    id,
                    Slot {
                        unit,
                        state: WorkerState::Spawning,
                        in_flight: 0,
                        monitor,
                        attempt,
                        readiness: Some(readiness),
                        terminate_sent: false,
                        completed: 0,
                        failed: 0,
                        spawned_at: Utc::now(),
                    },
                );
                true
            }
            Err(e) => {
                warn!(worker = id, attempt, error = %e, "worker spawn failed");
                self.on_spawn_failure(attempt, e.to_string());
                false
            }
        }
    }

    fn worker_monitor(&self, worker: WorkerId) -> ErrorMonitor {
        let events = self.events.clone();
        ErrorMonitor::new(self.config.worker_monitor.clone(), move |info| {
            let _ = events.send(PoolEvent::Errored {
                worker,
                failures: info.failures,
            });
        })
    }

    fn on_spawn_failure(&mut self, attempt: u32, message: String) {
        self.emit(PoolEvent::Error {
            worker: None,
            item: None,
            message: format!("spawn attempt {attempt} failed: {message}"),
        });
        if matches!(self.status, PoolStatus::ShuttingDown | PoolStatus::Stopped) {
            return;
        }

        if let Some(delay) = self.config.spawn_retry.next_delay(attempt) {
            let next = attempt + 1;
            debug!(attempt = next, delay_ms = delay.as_millis() as u64, "retrying worker spawn");
            self.retries_scheduled += 1;
            self.schedule(delay, Internal::RetrySpawn { attempt: next });
            return;
        }

        error!(attempts = attempt, error = %message, "giving up on spawning workers");
        self.emit(PoolEvent::Fatal {
            message: message.clone(),
            attempts: attempt,
        });
        if !self.can_serve() {
            self.fail_pending(|| AssignError::SpawnFailed(message.clone()));
        }
        self.spawn_exhausted = Some(message);
    }

    fn on_unit_event(&mut self, worker: WorkerId, event: UnitEvent) {
        match event {
            UnitEvent::Message(WorkerMessage::Online) => self.on_online(worker),
            UnitEvent::Message(WorkerMessage::Completed { id, outcome }) => {
                self.on_completed(worker, id, outcome)
            }
            UnitEvent::Message(WorkerMessage::Store { request, op }) => {
                self.on_store_request(worker, request, op)
            }
            UnitEvent::Exited(exit) => self.on_exited(worker, exit),
        }
    }

    fn on_online(&mut self, worker: WorkerId) {
        let Some(slot) = self.slots.get_mut(&worker) else {
            return;
        };
        if slot.state != WorkerState::Spawning {
            warn!(worker, state = %slot.state, "duplicate online signal ignored");
            return;
        }
        if let Some(readiness) = slot.readiness.take() {
            readiness.abort();
        }

        for data in &self.history {
            if let Err(e) = slot.unit.send(PoolMessage::Broadcast { data: data.clone() }) {
                warn!(worker, error = %e, "broadcast replay undeliverable");
            }
        }
        slot.state = WorkerState::Online;
        let kind = slot.unit.kind();

        self.spawn_exhausted = None;
        info!(worker, %kind, replayed = self.history.len(), "worker online");
        self.emit(PoolEvent::Online { worker, kind });
        self.pump();
    }

    fn on_completed(&mut self, worker: WorkerId, id: ItemId, outcome: Outcome) {
        if let Some(owner) = self.abandoned.remove(&id) {
            debug!(worker, item = %id, "discarding late completion");
            self.release(owner);
            self.pump();
            return;
        }
        let Some(running) = self.running.remove(&id) else {
            warn!(worker, item = %id, "completion for unknown item");
            return;
        };
        running.timer.abort();
        self.release(running.worker);

        let result = match outcome {
            Outcome::Success { output } => {
                if let Some(slot) = self.slots.get_mut(&worker) {
                    slot.completed += 1;
                }
                Ok(output)
            }
            Outcome::Failure(failure) => {
                debug!(worker, item = %id, error = %failure.message, "item failed");
                self.record_failure(worker, Some(id), failure.message.clone());
                Err(AssignError::Application {
                    message: failure.message,
                    status: failure.status,
                })
            }
        };

        let _ = running
            .reply
            .send(Completion::new(id, result, running.connection));
        self.pump();
    }

    fn on_store_request(&mut self, worker: WorkerId, request: u64, op: StoreOp) {
        let Some(slot) = self.slots.get(&worker) else {
            return;
        };
        trace!(worker, request, scope = op.scope(), "store request");

        let sender = slot.unit.sender().clone();
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let result = store.apply(op).await;
            if let Err(e) = sender.send(PoolMessage::StoreReply { request, result }) {
                debug!(worker, error = %e, "store reply undeliverable");
            }
        });
    }

    fn on_exited(&mut self, worker: WorkerId, exit: UnitExit) {
        // Killed workers were removed already.
        let Some(slot) = self.slots.remove(&worker) else {
            return;
        };
        if let Some(readiness) = slot.readiness {
            readiness.abort();
        }

        let expected = slot.terminate_sent || self.draining.is_some();
        if expected {
            self.finish_worker(worker, "terminated");
        } else {
            warn!(worker, clean = exit.clean, detail = %exit.detail, state = %slot.state, "worker exited unexpectedly");
            self.emit(PoolEvent::Error {
                worker: Some(worker),
                item: None,
                message: format!("worker exited unexpectedly: {}", exit.detail),
            });
            self.finish_worker(worker, &exit.detail);

            if slot.state == WorkerState::Spawning {
                self.on_spawn_failure(
                    slot.attempt,
                    format!("exited before signalling readiness: {}", exit.detail),
                );
            } else {
                self.feed_pool_monitor();
            }
        }

        self.check_drained();
        self.pump();
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ItemTimeout(id) => self.on_timeout(id),
            Internal::ReadinessDeadline(worker) => self.on_readiness_deadline(worker),
            Internal::RetrySpawn { attempt } => {
                self.retries_scheduled = self.retries_scheduled.saturating_sub(1);
                if self.needs_worker() {
                    self.spawn_worker(attempt);
                }
            }
        }
    }

    fn on_timeout(&mut self, id: ItemId) {
        let after = self.config.assign_timeout;

        if let Some(position) = self.pending.iter().position(|p| p.item.id == id) {
            if let Some(pending) = self.pending.remove(position) {
                debug!(item = %id, "item timed out while queued");
                let error = AssignError::Timeout { after };
                let _ = pending
                    .reply
                    .send(Completion::new(id, Err(error), pending.item.connection));
            }
            return;
        }

        let Some(running) = self.running.remove(&id) else {
            return;
        };
        let worker = running.worker;
        warn!(worker, item = %id, timeout_ms = after.as_millis() as u64, "assignment timed out");
        let error = AssignError::Timeout { after };
        let _ = running
            .reply
            .send(Completion::new(id, Err(error), running.connection));

        self.record_failure(worker, Some(id), format!("timed out after {after:?}"));
        if self.config.terminate_on_timeout {
            self.kill_worker(worker, "assignment timed out");
        } else {
            self.abandoned.insert(id, worker);
        }
        self.pump();
    }

    fn on_readiness_deadline(&mut self, worker: WorkerId) {
        let Some(slot) = self.slots.get(&worker) else {
            return;
        };
        if slot.state != WorkerState::Spawning {
            return;
        }
        let attempt = slot.attempt;
        let timeout = self.config.spawn_timeout;

        warn!(worker, timeout_ms = timeout.as_millis() as u64, "worker missed readiness deadline");
        self.kill_worker(worker, "readiness timeout");
        self.on_spawn_failure(attempt, format!("no readiness signal within {timeout:?}"));
        self.pump();
    }

    fn record_failure(&mut self, worker: WorkerId, item: Option<ItemId>, message: String) {
        self.emit(PoolEvent::Error {
            worker: Some(worker),
            item,
            message,
        });

        let breached = match self.slots.get_mut(&worker) {
            Some(slot) => {
                slot.failed += 1;
                slot.monitor.feed()
            }
            None => false,
        };
        if breached {
            self.mark_errored(worker);
        }
        self.feed_pool_monitor();
    }

    fn mark_errored(&mut self, worker: WorkerId) {
        let policy = self.config.errored_policy;
        let Some(slot) = self.slots.get_mut(&worker) else {
            return;
        };
        if !slot.state.accepts_work() {
            return;
        }

        slot.state = WorkerState::Errored;
        warn!(worker, in_flight = slot.in_flight, ?policy, "worker errored, removed from rotation");
        if slot.in_flight == 0 && !slot.terminate_sent {
            let _ = slot.unit.send(PoolMessage::Terminate);
            slot.terminate_sent = true;
        }
        if policy == ErroredPolicy::ReduceCapacity {
            self.retired += 1;
        }
    }

    fn feed_pool_monitor(&mut self) {
        let breached = self
            .pool_monitor
            .as_mut()
            .map(|monitor| monitor.feed())
            .unwrap_or(false);
        if breached && self.status == PoolStatus::Running {
            error!(pending = self.pending.len(), "pool error density breached, disabling");
            self.status = PoolStatus::Disabled;
            self.fail_pending(|| AssignError::Disabled);
        }
    }

    /// Force a worker down and fail whatever it was running
    fn kill_worker(&mut self, worker: WorkerId, reason: &str) {
        let Some(mut slot) = self.slots.remove(&worker) else {
            return;
        };
        if let Some(readiness) = slot.readiness.take() {
            readiness.abort();
        }
        slot.unit.terminate();
        self.finish_worker(worker, reason);
    }

    fn finish_worker(&mut self, worker: WorkerId, reason: &str) {
        let orphaned: Vec<ItemId> = self
            .running
            .iter()
            .filter(|(_, running)| running.worker == worker)
            .map(|(id, _)| *id)
            .collect();
        for id in orphaned {
            if let Some(running) = self.running.remove(&id) {
                running.timer.abort();
                let error = AssignError::WorkerTerminated { worker };
                let _ = running
                    .reply
                    .send(Completion::new(id, Err(error), running.connection));
            }
        }
        self.abandoned.retain(|_, owner| *owner != worker);

        info!(worker, reason, "worker terminated");
        self.emit(PoolEvent::Terminated {
            worker,
            reason: reason.to_string(),
        });
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    fn begin_shutdown(&mut self, reply: Option<oneshot::Sender<Result<(), PoolError>>>) {
        if let Some(draining) = self.draining.as_mut() {
            draining.waiters.extend(reply);
            return;
        }
        if self.status == PoolStatus::Stopped {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }

        info!(
            workers = self.slots.len(),
            in_flight = self.running.len(),
            pending = self.pending.len(),
            "initiating graceful shutdown"
        );
        self.status = PoolStatus::ShuttingDown;
        self.fail_pending(|| AssignError::ShuttingDown);

        for (id, slot) in self.slots.iter_mut() {
            if slot.terminate_sent {
                continue;
            }
            if let Err(e) = slot.unit.send(PoolMessage::Terminate) {
                debug!(worker = id, error = %e, "termination notice undeliverable");
            }
            slot.terminate_sent = true;
        }

        self.draining = Some(Draining {
            deadline: Instant::now() + self.config.shutdown_timeout,
            waiters: reply.into_iter().collect(),
        });
        self.check_drained();
    }

    fn check_drained(&mut self) {
        if !self.slots.is_empty() {
            return;
        }
        let Some(draining) = self.draining.take() else {
            return;
        };
        info!("all workers drained");
        self.status = PoolStatus::Stopped;
        for waiter in draining.waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    fn force_shutdown(&mut self) {
        let Some(draining) = self.draining.take() else {
            return;
        };
        let forced = self.slots.len();
        warn!(forced, in_flight = self.running.len(), "shutdown timeout reached, killing workers");

        let workers: Vec<WorkerId> = self.slots.keys().copied().collect();
        for worker in workers {
            self.kill_worker(worker, "shutdown timeout");
        }
        self.status = PoolStatus::Stopped;
        for waiter in draining.waiters {
            let _ = waiter.send(Err(PoolError::ShutdownTimeout { forced }));
        }
    }

    /// Answer whatever is still queued once the pool has stopped
    fn close_commands(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Assign { item, reply } => {
                    let error = AssignError::ShuttingDown;
                    let _ = reply.send(Completion::new(item.id, Err(error), item.connection));
                }
                Command::Broadcast { reply, .. } => {
                    let _ = reply.send(0);
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Reset { reply } => {
                    let _ = reply.send(());
                }
                Command::Shutdown { reply } => {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn schedule(&self, after: Duration, message: Internal) -> AbortHandle {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(message);
        })
        .abort_handle()
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
