// Integration tests for WorkerPool with thread workers
//
// These tests drive a real pool end to end: worker threads, the readiness
// protocol, store requests relayed through the pool, timeouts and shutdown.
// They run on wall-clock time because thread workers own their runtimes.
//
// Run with: cargo test -p switchyard-dispatch --test pool_test

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use switchyard_dispatch::pool::{
    AssignError, ErroredPolicy, PoolConfig, PoolError, PoolEvent, PoolSnapshot, PoolStatus,
    WorkerPool,
};
use switchyard_dispatch::reliability::{ErrorMonitorConfig, RetryPolicy};
use switchyard_dispatch::store::SharedStore;
use switchyard_dispatch::unit::{
    Handler, HandlerError, ProcessWorkerFactory, WorkerContext, WorkerId, WorkerState,
};
use tokio::sync::broadcast;

/// Handler whose behaviour is picked by the payload's `op` field
#[derive(Clone, Default)]
struct ScriptedHandler {
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    settings: Arc<Mutex<HashMap<WorkerId, Vec<Value>>>>,
}

#[async_trait]
impl Handler for ScriptedHandler {
    async fn handle(&self, payload: Value, ctx: WorkerContext) -> Result<Value, HandlerError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let result = self.run(payload, &ctx).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn on_broadcast(&self, data: Value, ctx: &WorkerContext) {
        // Takes the whole worker down, not just one item.
        if data["crash_worker"].as_u64() == Some(ctx.worker_id()) {
            panic!("scripted worker crash");
        }
        self.settings
            .lock()
            .entry(ctx.worker_id())
            .or_default()
            .push(data);
    }
}

impl ScriptedHandler {
    async fn run(&self, payload: Value, ctx: &WorkerContext) -> Result<Value, HandlerError> {
        match payload["op"].as_str().unwrap_or_default() {
            "echo" => Ok(json!({
                "worker": ctx.worker_id(),
                "value": payload["value"].clone(),
            })),
            "sleep" => {
                let ms = payload["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "worker": ctx.worker_id() }))
            }
            "fail" => {
                let mut error = HandlerError::new("scripted failure");
                if let Some(status) = payload["status"].as_u64() {
                    error = error.with_status(status as u16);
                }
                Err(error)
            }
            "panic" => panic!("scripted panic"),
            "count" => {
                let hits = ctx.increment("test", "hits", 1).await?;
                Ok(json!(hits))
            }
            "settings" => {
                let settings = self
                    .settings
                    .lock()
                    .get(&ctx.worker_id())
                    .cloned()
                    .unwrap_or_default();
                Ok(json!({ "worker": ctx.worker_id(), "settings": settings }))
            }
            other => Err(HandlerError::new(format!("unknown op {other:?}")).with_status(400)),
        }
    }
}

/// Handler whose first worker never finishes initializing
struct SlowFirstStart;

#[async_trait]
impl Handler for SlowFirstStart {
    async fn init(&self, ctx: &WorkerContext) -> Result<(), HandlerError> {
        if ctx.worker_id() == 1 {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(())
    }

    async fn handle(&self, _payload: Value, ctx: WorkerContext) -> Result<Value, HandlerError> {
        Ok(json!({ "worker": ctx.worker_id() }))
    }
}

fn quiet_monitor() -> ErrorMonitorConfig {
    ErrorMonitorConfig::new()
        .with_init_period(Duration::ZERO)
        .with_density_interval(Duration::from_secs(30))
        .with_threshold(100)
}

fn base_config(limit: usize) -> PoolConfig {
    PoolConfig::new(limit)
        .with_worker_monitor(quiet_monitor())
        .with_assign_timeout(Duration::from_secs(5))
        .with_shutdown_timeout(Duration::from_secs(5))
}

fn start(config: PoolConfig, handler: ScriptedHandler) -> (WorkerPool, Arc<SharedStore>) {
    let store = Arc::new(SharedStore::new());
    let pool = WorkerPool::threads(config, handler, Arc::clone(&store)).unwrap();
    (pool, store)
}

/// Poll snapshots until `ready` holds
async fn wait_for<F>(pool: &WorkerPool, ready: F) -> PoolSnapshot
where
    F: Fn(&PoolSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = pool.snapshot().await.unwrap();
        if ready(&snapshot) {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached, last snapshot: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for the first event matching `matches`
async fn next_event<F>(events: &mut broadcast::Receiver<PoolEvent>, matches: F) -> PoolEvent
where
    F: Fn(&PoolEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received")
}

fn worker_of(output: &Value) -> u64 {
    output["worker"].as_u64().unwrap()
}

#[test_log::test(tokio::test)]
async fn test_concurrency_never_exceeds_limit() {
    let handler = ScriptedHandler::default();
    let max_active = Arc::clone(&handler.max_active);
    let (pool, _) = start(base_config(2), handler);

    let items = (0..3).map(|_| pool.submit(json!({"op": "sleep", "ms": 150})));
    let results = futures::future::join_all(items).await;

    for result in &results {
        assert!(result.is_ok(), "unexpected failure: {result:?}");
    }
    assert!(max_active.load(Ordering::SeqCst) <= 2);

    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.workers.len(), 2);
    assert_eq!(snapshot.pending, 0);
    assert_eq!(snapshot.in_flight, 0);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_initial_workers_come_online_and_idle_ties_go_to_lowest_id() {
    let (pool, _) = start(base_config(3).with_initial_size(3), ScriptedHandler::default());

    let snapshot = wait_for(&pool, |s| s.count_in(WorkerState::Online) == 3).await;
    assert_eq!(
        snapshot.workers.iter().map(|w| w.id).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    for _ in 0..3 {
        let output = pool.submit(json!({"op": "echo", "value": 1})).await.unwrap();
        assert_eq!(worker_of(&output), 1);
    }

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_busy_worker_is_skipped() {
    let (pool, _) = start(base_config(2).with_initial_size(2), ScriptedHandler::default());
    wait_for(&pool, |s| s.count_in(WorkerState::Online) == 2).await;

    let slow = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.submit(json!({"op": "sleep", "ms": 300})).await })
    };
    wait_for(&pool, |s| s.in_flight == 1).await;

    let output = pool.submit(json!({"op": "echo", "value": 2})).await.unwrap();
    assert_eq!(worker_of(&output), 2);
    assert_eq!(worker_of(&slow.await.unwrap().unwrap()), 1);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_full_queue_applies_backpressure() {
    let config = base_config(1).with_max_pending(1);
    let (pool, _) = start(config, ScriptedHandler::default());

    let first = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.submit(json!({"op": "sleep", "ms": 300})).await })
    };
    wait_for(&pool, |s| s.in_flight == 1).await;

    let second = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.submit(json!({"op": "echo", "value": 2})).await })
    };
    wait_for(&pool, |s| s.pending == 1).await;

    let err = pool
        .submit(json!({"op": "echo", "value": 3}))
        .await
        .unwrap_err();
    assert_eq!(err, AssignError::Backpressure { pending: 1 });
    assert_eq!(err.status(), 503);
    assert!(err.is_admission());

    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fail_fast_queue_still_spawns_workers() {
    let config = base_config(2).with_max_pending(0);
    let (pool, _) = start(config, ScriptedHandler::default());

    // Nothing is online yet, but a worker can still be started for it.
    let output = pool.submit(json!({"op": "echo", "value": 1})).await.unwrap();
    assert_eq!(worker_of(&output), 1);

    let sleepers: Vec<_> = (0..2)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(json!({"op": "sleep", "ms": 300})).await })
        })
        .collect();
    wait_for(&pool, |s| s.in_flight == 2).await;

    let err = pool
        .submit(json!({"op": "echo", "value": 2}))
        .await
        .unwrap_err();
    assert_eq!(err, AssignError::Backpressure { pending: 0 });

    for sleeper in sleepers {
        assert!(sleeper.await.unwrap().is_ok());
    }
    assert_eq!(pool.snapshot().await.unwrap().workers.len(), 2);

    pool.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_worker_capacity_allows_concurrent_items() {
    let handler = ScriptedHandler::default();
    let max_active = Arc::clone(&handler.max_active);
    let (pool, _) = start(base_config(1).with_capacity(2), handler);

    let items: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(json!({"op": "sleep", "ms": 200})).await })
        })
        .collect();

    let snapshot = wait_for(&pool, |s| s.in_flight == 2 && s.pending == 2).await;
    assert_eq!(snapshot.workers.len(), 1);
    assert_eq!(snapshot.workers[0].in_flight, 2);

    for item in items {
        assert_eq!(worker_of(&item.await.unwrap().unwrap()), 1);
    }
    assert_eq!(max_active.load(Ordering::SeqCst), 2);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_worker_missing_readiness_deadline_is_replaced() {
    let config = base_config(1)
        .with_spawn_timeout(Duration::from_millis(100))
        .with_spawn_retry(RetryPolicy::fixed(Duration::from_millis(10), 3));
    let pool =
        WorkerPool::threads(config, SlowFirstStart, Arc::new(SharedStore::new())).unwrap();
    let mut events = pool.subscribe();

    let output = pool.submit(json!("hi")).await.unwrap();
    assert_eq!(worker_of(&output), 2);

    let terminated =
        next_event(&mut events, |e| matches!(e, PoolEvent::Terminated { .. })).await;
    assert_eq!(
        terminated,
        PoolEvent::Terminated {
            worker: 1,
            reason: "readiness timeout".into()
        }
    );
    let spawn_error = next_event(&mut events, |e| matches!(e, PoolEvent::Error { .. })).await;
    match spawn_error {
        PoolEvent::Error {
            worker: None,
            message,
            ..
        } => assert!(message.starts_with("spawn attempt 1 failed"), "{message}"),
        other => panic!("unexpected event: {other:?}"),
    }

    pool.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_crashed_worker_fails_its_item_and_is_respawned() {
    let (pool, _) = start(base_config(1).with_initial_size(1), ScriptedHandler::default());
    wait_for(&pool, |s| s.count_in(WorkerState::Online) == 1).await;
    let mut events = pool.subscribe();

    let in_flight = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.submit(json!({"op": "sleep", "ms": 2_000})).await })
    };
    wait_for(&pool, |s| s.in_flight == 1).await;

    pool.broadcast(json!({"crash_worker": 1})).await.unwrap();

    assert_eq!(
        in_flight.await.unwrap().unwrap_err(),
        AssignError::WorkerTerminated { worker: 1 }
    );
    let terminated =
        next_event(&mut events, |e| matches!(e, PoolEvent::Terminated { .. })).await;
    assert_eq!(
        terminated,
        PoolEvent::Terminated {
            worker: 1,
            reason: "worker thread panicked".into()
        }
    );

    // The initial-size floor brings a replacement up on its own.
    let online = next_event(&mut events, |e| matches!(e, PoolEvent::Online { .. })).await;
    assert!(matches!(online, PoolEvent::Online { worker: 2, .. }));

    let output = pool.submit(json!({"op": "settings"})).await.unwrap();
    assert_eq!(
        output,
        json!({"worker": 2, "settings": [{"crash_worker": 1}]})
    );

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_application_failures_reach_the_caller() {
    let (pool, _) = start(base_config(1), ScriptedHandler::default());

    let err = pool
        .submit(json!({"op": "fail", "status": 418}))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AssignError::Application {
            message: "scripted failure".into(),
            status: Some(418),
        }
    );
    assert_eq!(err.status(), 418);

    let err = pool.submit(json!({"op": "panic"})).await.unwrap_err();
    match err {
        AssignError::Application { message, status } => {
            assert!(message.contains("scripted panic"), "{message}");
            assert_eq!(status, None);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Single failures are tolerated; the worker keeps serving.
    assert!(pool.submit(json!({"op": "echo", "value": 1})).await.is_ok());
    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.workers.len(), 1);
    assert_eq!(snapshot.workers[0].failed, 2);
    assert_eq!(snapshot.workers[0].completed, 1);

    pool.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_dense_failures_take_worker_out_of_rotation() {
    let monitor = ErrorMonitorConfig::new()
        .with_init_period(Duration::ZERO)
        .with_density_interval(Duration::from_secs(30))
        .with_threshold(1);
    let config = base_config(2)
        .with_initial_size(2)
        .with_worker_monitor(monitor)
        .with_errored_policy(ErroredPolicy::ReduceCapacity);
    let (pool, _) = start(config, ScriptedHandler::default());
    let mut events = pool.subscribe();
    wait_for(&pool, |s| s.count_in(WorkerState::Online) == 2).await;

    for _ in 0..2 {
        assert!(pool.submit(json!({"op": "fail"})).await.is_err());
    }

    let errored = next_event(&mut events, |e| matches!(e, PoolEvent::Errored { .. })).await;
    assert_eq!(
        errored,
        PoolEvent::Errored {
            worker: 1,
            failures: 2
        }
    );
    let terminated =
        next_event(&mut events, |e| matches!(e, PoolEvent::Terminated { .. })).await;
    assert!(matches!(terminated, PoolEvent::Terminated { worker: 1, .. }));

    let output = pool.submit(json!({"op": "echo", "value": 1})).await.unwrap();
    assert_eq!(worker_of(&output), 2);

    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.retired, 1);
    assert!(snapshot.worker(1).is_none());

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_errored_worker_is_replaced() {
    let monitor = ErrorMonitorConfig::new()
        .with_init_period(Duration::ZERO)
        .with_density_interval(Duration::from_secs(30))
        .with_threshold(0);
    let config = base_config(1).with_worker_monitor(monitor);
    let (pool, _) = start(config, ScriptedHandler::default());

    assert!(pool.submit(json!({"op": "fail"})).await.is_err());

    let output = pool.submit(json!({"op": "echo", "value": 1})).await.unwrap();
    assert_eq!(worker_of(&output), 2);
    assert_eq!(pool.snapshot().await.unwrap().retired, 0);

    pool.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_timeout_kills_worker_and_slot_is_reused() {
    let config = base_config(1).with_assign_timeout(Duration::from_millis(100));
    let (pool, _) = start(config, ScriptedHandler::default());
    let mut events = pool.subscribe();

    let err = pool
        .submit(json!({"op": "sleep", "ms": 10_000}))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AssignError::Timeout {
            after: Duration::from_millis(100)
        }
    );
    assert_eq!(err.status(), 408);

    let terminated =
        next_event(&mut events, |e| matches!(e, PoolEvent::Terminated { .. })).await;
    assert_eq!(
        terminated,
        PoolEvent::Terminated {
            worker: 1,
            reason: "assignment timed out".into()
        }
    );

    let output = pool.submit(json!({"op": "echo", "value": 1})).await.unwrap();
    assert_eq!(worker_of(&output), 2);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_timeout_without_termination_keeps_slot_until_late_reply() {
    let config = base_config(1)
        .with_assign_timeout(Duration::from_millis(200))
        .with_terminate_on_timeout(false);
    let (pool, _) = start(config, ScriptedHandler::default());

    let err = pool
        .submit(json!({"op": "sleep", "ms": 300}))
        .await
        .unwrap_err();
    assert!(matches!(err, AssignError::Timeout { .. }));

    // The late reply frees the same worker.
    let output = pool.submit(json!({"op": "echo", "value": 1})).await.unwrap();
    assert_eq!(worker_of(&output), 1);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_store_requests_are_serialized_through_the_pool() {
    let (pool, store) = start(base_config(3), ScriptedHandler::default());

    let items = (0..10).map(|_| pool.submit(json!({"op": "count"})));
    let mut counts: Vec<i64> = futures::future::join_all(items)
        .await
        .into_iter()
        .map(|result| result.unwrap().as_i64().unwrap())
        .collect();
    counts.sort_unstable();

    assert_eq!(counts, (1..=10).collect::<Vec<_>>());
    assert_eq!(store.get("test", "hits").await, Some(json!(10)));

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_is_replayed_to_new_workers() {
    let (pool, _) = start(base_config(2).with_initial_size(1), ScriptedHandler::default());
    wait_for(&pool, |s| s.count_in(WorkerState::Online) == 1).await;

    let delivered = pool.broadcast(json!({"mode": "maintenance"})).await.unwrap();
    assert_eq!(delivered, 1);

    // Keep worker 1 busy so the next item needs a fresh worker.
    let busy = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.submit(json!({"op": "sleep", "ms": 300})).await })
    };
    wait_for(&pool, |s| s.in_flight == 1).await;

    let output = pool.submit(json!({"op": "settings"})).await.unwrap();
    assert_eq!(
        output,
        json!({"worker": 2, "settings": [{"mode": "maintenance"}]})
    );
    assert!(busy.await.unwrap().is_ok());

    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.broadcasts, 1);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pool_breach_disables_until_reset() {
    let pool_monitor = ErrorMonitorConfig::new()
        .with_init_period(Duration::ZERO)
        .with_density_interval(Duration::from_secs(30))
        .with_threshold(1);
    let config = base_config(1).with_pool_monitor(pool_monitor);
    let (pool, _) = start(config, ScriptedHandler::default());
    let mut events = pool.subscribe();

    assert!(pool.submit(json!({"op": "fail"})).await.is_err());
    assert!(pool.submit(json!({"op": "fail"})).await.is_err());

    let breach = next_event(&mut events, |e| matches!(e, PoolEvent::PoolBreach { .. })).await;
    assert_eq!(breach, PoolEvent::PoolBreach { failures: 2 });
    assert_eq!(pool.snapshot().await.unwrap().status, PoolStatus::Disabled);

    let err = pool
        .submit(json!({"op": "echo", "value": 1}))
        .await
        .unwrap_err();
    assert_eq!(err, AssignError::Disabled);
    assert_eq!(err.status(), 503);

    pool.reset().await.unwrap();
    assert_eq!(pool.snapshot().await.unwrap().status, PoolStatus::Running);
    assert!(pool.submit(json!({"op": "echo", "value": 1})).await.is_ok());

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_spawn_failures_exhaust_retries_and_report_fatal() {
    let factory = ProcessWorkerFactory::new("/nonexistent/switchyard-worker");
    let config = base_config(1).with_spawn_retry(RetryPolicy::fixed(Duration::from_millis(10), 2));
    let pool = WorkerPool::processes(config, factory, Arc::new(SharedStore::new())).unwrap();
    let mut events = pool.subscribe();

    let err = pool
        .submit(json!({"op": "echo", "value": 1}))
        .await
        .unwrap_err();
    assert!(matches!(err, AssignError::SpawnFailed(_)), "{err:?}");

    let fatal = next_event(&mut events, |e| matches!(e, PoolEvent::Fatal { .. })).await;
    assert!(matches!(fatal, PoolEvent::Fatal { attempts: 2, .. }));

    // No worker can come up, so new work is refused straight away.
    let err = pool
        .submit(json!({"op": "echo", "value": 2}))
        .await
        .unwrap_err();
    assert!(matches!(err, AssignError::SpawnFailed(_)));

    pool.shutdown().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_process_breaking_framing_is_taken_out_of_rotation() {
    // Comes online, then answers its first assignment with garbage.
    let script = r#"echo '{"type":"online"}'; read line; echo 'not a frame'; exec sleep 3600"#;
    let factory = ProcessWorkerFactory::new("sh").arg("-c").arg(script);
    let pool = WorkerPool::processes(base_config(1), factory, Arc::new(SharedStore::new())).unwrap();
    let mut events = pool.subscribe();

    let err = pool
        .submit(json!({"op": "echo", "value": 1}))
        .await
        .unwrap_err();
    assert_eq!(err, AssignError::WorkerTerminated { worker: 1 });

    let terminated =
        next_event(&mut events, |e| matches!(e, PoolEvent::Terminated { .. })).await;
    match terminated {
        PoolEvent::Terminated { worker: 1, reason } => {
            assert!(reason.starts_with("undecodable frame"), "{reason}")
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(pool.snapshot().await.unwrap().worker(1).is_none());

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_work() {
    let (pool, _) = start(base_config(1), ScriptedHandler::default());

    let in_flight = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.submit(json!({"op": "sleep", "ms": 200})).await })
    };
    wait_for(&pool, |s| s.in_flight == 1).await;

    pool.shutdown().await.unwrap();
    assert!(in_flight.await.unwrap().is_ok());

    let err = pool
        .submit(json!({"op": "echo", "value": 1}))
        .await
        .unwrap_err();
    assert!(
        matches!(err, AssignError::ShuttingDown | AssignError::Closed),
        "{err:?}"
    );
}

#[tokio::test]
async fn test_shutdown_timeout_kills_stuck_workers() {
    let config = base_config(1).with_shutdown_timeout(Duration::from_millis(100));
    let (pool, _) = start(config, ScriptedHandler::default());

    let stuck = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.submit(json!({"op": "sleep", "ms": 10_000})).await })
    };
    wait_for(&pool, |s| s.in_flight == 1).await;

    let err = pool.shutdown().await.unwrap_err();
    assert!(matches!(err, PoolError::ShutdownTimeout { forced: 1 }));
    assert_eq!(
        stuck.await.unwrap().unwrap_err(),
        AssignError::WorkerTerminated { worker: 1 }
    );
}
