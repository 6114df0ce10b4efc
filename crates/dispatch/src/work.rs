//! Work items and their completions

use std::fmt;

use serde_json::Value;
use tokio::io::AsyncWrite;

use crate::pool::AssignError;
use crate::unit::ItemId;

/// Raw client connection handed over together with a work item
pub type Connection = Box<dyn AsyncWrite + Send + Unpin>;

/// One unit of work submitted to the pool
///
/// Only `payload` travels to the worker. The connection stays with the pool
/// and comes back in the [`Completion`], so the caller can still write to
/// the client directly whatever the outcome.
pub struct WorkItem {
    pub id: ItemId,
    pub payload: Value,
    pub connection: Option<Connection>,
}

impl WorkItem {
    pub fn new(payload: Value) -> Self {
        Self {
            id: ItemId::new(),
            payload,
            connection: None,
        }
    }

    /// Attach the client connection the result should be written to
    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("connection", &self.connection.is_some())
            .finish()
    }
}

/// Terminal result of one [`WorkItem`]
pub struct Completion {
    pub id: ItemId,
    /// Worker output, or why there is none
    pub result: Result<Value, AssignError>,
    /// The connection the item carried, if any
    pub connection: Option<Connection>,
}

impl Completion {
    pub(crate) fn new(
        id: ItemId,
        result: Result<Value, AssignError>,
        connection: Option<Connection>,
    ) -> Self {
        Self {
            id,
            result,
            connection,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Drop the connection and keep the result
    pub fn into_result(self) -> Result<Value, AssignError> {
        self.result
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("id", &self.id)
            .field("result", &self.result)
            .field("connection", &self.connection.is_some())
            .finish()
    }
}
