// Switchyard dispatch core
//
// Relays opaque work items from a front end to a bounded pool of worker
// execution units (threads or child processes) and returns their results.
//
// Key design decisions:
// - The pool is a single actor task; handles talk to it over channels
// - Workers speak newline-delimited JSON whatever their kind
// - Failure density, not single failures, takes a worker out of rotation
// - Oversized requests are answered on the fast path and never reach a worker
// - Shared state lives in the front end and is reached through the pool

pub mod config;
pub mod fastpath;
pub mod gateway;
pub mod pool;
pub mod reliability;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod unit;
pub mod work;

// Re-exports for convenience
pub use config::{ClusterConfig, ConfigError};
pub use fastpath::{AdmissionLimits, FastPathResponder, RawResponse};
pub use gateway::{Gateway, GatewayError, SerialRequest, SerialResponse};
pub use pool::{
    AssignError, ErroredPolicy, PoolConfig, PoolError, PoolEvent, PoolSnapshot, PoolStatus,
    WorkerPool, WorkerSnapshot,
};
pub use reliability::{ErrorMonitor, ErrorMonitorConfig, RetryPolicy};
pub use store::{SharedStore, StoreOp, StoreResult};
pub use sync::AsyncMutex;
pub use telemetry::{init_logging, LoggingConfig};
pub use unit::{
    serve_stdio, Handler, HandlerError, ProcessWorkerFactory, ThreadWorkerFactory, WorkerContext,
    WorkerId, WorkerKind, WorkerState,
};
pub use work::{Completion, Connection, WorkItem};
