//! Reference worker for switchyard process pools
//!
//! [`ReferenceHandler`] answers [`SerialRequest`](switchyard_dispatch::gateway::SerialRequest)
//! payloads by path. The `switchyard-worker` binary serves it over stdio.

pub mod handler;

pub use handler::{ReferenceHandler, Route, COUNTER_SCOPE, CRASH_EXIT_CODE};
