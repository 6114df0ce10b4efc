//! Pool ⇄ worker channel protocol
//!
//! Thread units exchange these messages as values over in-memory channels.
//! Process units carry them as newline-delimited JSON over the child's
//! stdin/stdout, one frame per line.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::{StoreOp, StoreResult};

/// Upper bound on one encoded frame
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Correlation identifier of one work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Uuid);

impl ItemId {
    /// Fresh time-ordered id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Messages from the pool to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolMessage {
    /// Execute one work item
    Assign { id: ItemId, payload: Value },
    /// Configuration delivered to every worker
    Broadcast { data: Value },
    /// Answer to a [`WorkerMessage::Store`] request
    StoreReply { request: u64, result: StoreResult },
    /// Stop accepting work, drain, and exit
    Terminate,
}

/// Messages from a worker to the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Initialization finished; sent exactly once, before anything else
    Online,
    /// A work item finished
    Completed { id: ItemId, outcome: Outcome },
    /// Shared store request, answered with [`PoolMessage::StoreReply`]
    Store { request: u64, op: StoreOp },
}

/// Result of one work item as reported by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Success { output: Value },
    Failure(WorkFailure),
}

/// Structured application failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkFailure {
    pub message: String,
    /// Status the worker wants surfaced to the client, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl WorkFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Framing errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode one message as a single-line frame (no trailing newline)
pub fn encode_frame<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(ProtocolError::Encode)
}

/// Decode one frame
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(line).map_err(ProtocolError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_online_frame_is_compact() {
        assert_eq!(
            encode_frame(&WorkerMessage::Online).unwrap(),
            r#"{"type":"online"}"#
        );
    }

    #[test]
    fn test_frames_never_contain_newlines() {
        let message = PoolMessage::Assign {
            id: ItemId::new(),
            payload: json!({"body": "line one\nline two"}),
        };
        let frame = encode_frame(&message).unwrap();

        assert!(!frame.contains('\n'));
        assert_eq!(decode_frame::<PoolMessage>(&frame).unwrap(), message);
    }

    #[test]
    fn test_failure_outcome_wire_format() {
        let id = ItemId::new();
        let message = WorkerMessage::Completed {
            id,
            outcome: Outcome::Failure(WorkFailure::new("boom").with_status(503)),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "completed");
        assert_eq!(json["outcome"]["result"], "failure");
        assert_eq!(json["outcome"]["message"], "boom");
        assert_eq!(json["outcome"]["status"], 503);

        let parsed: WorkerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_decode_rejects_unknown_message() {
        let err = decode_frame::<WorkerMessage>(r#"{"type":"reboot"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }
}
