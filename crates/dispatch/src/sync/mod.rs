//! Synchronization primitives for state shared across in-flight work
//!
//! This module provides:
//! - [`AsyncMutex`] - FIFO lock that serializes asynchronous critical sections

mod mutex;

pub use mutex::AsyncMutex;
