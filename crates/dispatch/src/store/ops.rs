//! Store operations as they travel over a worker channel

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A store request issued by a worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreOp {
    /// Read a key
    Get { scope: String, key: String },
    /// Write a key
    Set {
        scope: String,
        key: String,
        value: Value,
    },
    /// Remove a key
    Delete { scope: String, key: String },
    /// Add `by` to a numeric key (missing counts as zero)
    Increment { scope: String, key: String, by: i64 },
    /// Remove every key of a scope
    Clear { scope: String },
}

impl StoreOp {
    /// Scope the operation targets
    pub fn scope(&self) -> &str {
        match self {
            Self::Get { scope, .. }
            | Self::Set { scope, .. }
            | Self::Delete { scope, .. }
            | Self::Increment { scope, .. }
            | Self::Clear { scope } => scope,
        }
    }
}

/// Outcome of a [`StoreOp`]
///
/// `Missing` is distinct from `Found { value: null }` on the wire as well
/// as in memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StoreResult {
    /// The key holds a value (for `Increment`, the new value)
    Found { value: Value },
    /// The key is not set
    Missing,
    /// A write completed
    Done,
    /// The operation was rejected
    Failed { message: String },
}

impl StoreResult {
    /// Convert into the in-memory lookup shape
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Found { value } => Some(value),
            _ => None,
        }
    }
}

impl From<Option<Value>> for StoreResult {
    fn from(value: Option<Value>) -> Self {
        match value {
            Some(value) => Self::Found { value },
            None => Self::Missing,
        }
    }
}
