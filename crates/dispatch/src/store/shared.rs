//! Scoped shared memory
//!
//! Every scope (an endpoint, a listening port, ...) owns its own
//! [`AsyncMutex`], so operations on one scope are strictly serialized while
//! unrelated scopes never contend.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use super::ops::{StoreOp, StoreResult};
use crate::sync::AsyncMutex;

/// Store errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// An increment targeted a value that is not an integer
    #[error("value at {scope}/{key} is not an integer")]
    NotAnInteger { scope: String, key: String },
}

#[derive(Debug, Default)]
struct ScopeMemory {
    mutex: AsyncMutex,
    // Only touched from inside a `mutex` section.
    entries: Mutex<HashMap<String, Value>>,
}

/// Cluster-wide key/value memory partitioned by scope
///
/// Constructed explicitly and shared by handle (`Arc<SharedStore>`); the
/// pool answers worker store requests from the instance it was given.
///
/// Reads go through the scope mutex too, so a `get` issued after a `set`
/// on the same scope always observes it, whichever caller issued the `set`.
///
/// # Example
///
/// ```
/// use switchyard_dispatch::store::SharedStore;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let store = SharedStore::new();
/// store.set("port:8080", "motd", json!("hello")).await;
/// assert_eq!(store.get("port:8080", "motd").await, Some(json!("hello")));
/// assert_eq!(store.get("port:9090", "motd").await, None);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct SharedStore {
    scopes: DashMap<String, Arc<ScopeMemory>>,
}

impl SharedStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a key; `None` when the key is not set
    pub async fn get(&self, scope: &str, key: &str) -> Option<Value> {
        self.with_entries(scope, |entries| entries.get(key).cloned())
            .await
    }

    /// Write a key, returning the previous value
    pub async fn set(&self, scope: &str, key: &str, value: Value) -> Option<Value> {
        trace!(scope, key, "store set");
        self.with_entries(scope, |entries| entries.insert(key.to_owned(), value))
            .await
    }

    /// Remove a key, returning the value it held
    pub async fn delete(&self, scope: &str, key: &str) -> Option<Value> {
        trace!(scope, key, "store delete");
        self.with_entries(scope, |entries| entries.remove(key)).await
    }

    /// Atomically replace a key with `f(current)`, returning the new value
    pub async fn update<F>(&self, scope: &str, key: &str, f: F) -> Value
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        self.with_entries(scope, |entries| {
            let next = f(entries.get(key));
            entries.insert(key.to_owned(), next.clone());
            next
        })
        .await
    }

    /// Add `by` to an integer key (a missing key counts as zero)
    pub async fn increment(&self, scope: &str, key: &str, by: i64) -> Result<i64, StoreError> {
        self.with_entries(scope, |entries| {
            let current = match entries.get(key) {
                None => 0,
                Some(value) => value.as_i64().ok_or_else(|| StoreError::NotAnInteger {
                    scope: scope.to_owned(),
                    key: key.to_owned(),
                })?,
            };
            let next = current.saturating_add(by);
            entries.insert(key.to_owned(), Value::from(next));
            Ok(next)
        })
        .await
    }

    /// Remove every key of a scope
    pub async fn clear(&self, scope: &str) {
        self.with_entries(scope, |entries| entries.clear()).await
    }

    /// Number of keys set in a scope
    pub async fn len(&self, scope: &str) -> usize {
        self.with_entries(scope, |entries| entries.len()).await
    }

    /// Whether a scope has ever been touched
    pub fn contains_scope(&self, scope: &str) -> bool {
        self.scopes.contains_key(scope)
    }

    /// Execute a serialized [`StoreOp`]
    pub async fn apply(&self, op: StoreOp) -> StoreResult {
        match op {
            StoreOp::Get { scope, key } => self.get(&scope, &key).await.into(),
            StoreOp::Set { scope, key, value } => {
                self.set(&scope, &key, value).await;
                StoreResult::Done
            }
            StoreOp::Delete { scope, key } => {
                self.delete(&scope, &key).await;
                StoreResult::Done
            }
            StoreOp::Increment { scope, key, by } => match self.increment(&scope, &key, by).await {
                Ok(value) => StoreResult::Found {
                    value: Value::from(value),
                },
                Err(e) => StoreResult::Failed {
                    message: e.to_string(),
                },
            },
            StoreOp::Clear { scope } => {
                self.clear(&scope).await;
                StoreResult::Done
            }
        }
    }

    /// Run `f` on a scope's entries inside that scope's critical section
    async fn with_entries<T, F>(&self, scope: &str, f: F) -> T
    where
        F: FnOnce(&mut HashMap<String, Value>) -> T,
    {
        let memory = self.memory(scope);
        let result = memory
            .mutex
            .lock(|| async { f(&mut memory.entries.lock()) })
            .await;
        result
    }

    fn memory(&self, scope: &str) -> Arc<ScopeMemory> {
        if let Some(memory) = self.scopes.get(scope) {
            return Arc::clone(memory.value());
        }
        let memory = self.scopes.entry(scope.to_owned()).or_default();
        Arc::clone(memory.value())
    }
}
