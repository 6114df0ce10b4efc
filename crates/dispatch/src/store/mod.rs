//! Per-scope shared key/value memory
//!
//! This module provides:
//! - [`SharedStore`] - Scoped key/value store with per-scope serialization
//! - [`StoreOp`] / [`StoreResult`] - The serializable request/response pair
//!   workers use to reach the store through the pool

mod ops;
mod shared;

pub use ops::{StoreOp, StoreResult};
pub use shared::{SharedStore, StoreError};
