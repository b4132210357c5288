//! Exhaustive error kinds and their retry policies.
//!
//! Failures travel as values: the coordinator returns per-message errors
//! with the batch (the transaction still commits), and transport/handler
//! failures are reported on the next call via the failure queues.
//! Exceptions-as-control-flow are reserved for truly abnormal conditions
//! (`anyhow` on the plumbing).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinationError {
    /// Broker or downstream unavailable. Retried via re-claim after lease
    /// expiry; buffered in memory meanwhile.
    #[error("transport not ready")]
    TransportNotReady,

    /// Broker rejected the message or the connection dropped. Retried;
    /// increments the attempt counter.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Payload cannot be encoded/decoded under its registered type.
    /// Permanent.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// Message failed pre-handler validation. Permanent.
    #[error("validation failure: {0}")]
    Validation(String),

    /// Attempt counter exceeded the configured ceiling. Permanent; surfaced
    /// externally via the stored failure reason.
    #[error("max attempts exceeded: {attempts} of {ceiling}")]
    MaxAttemptsExceeded { attempts: i32, ceiling: i32 },

    /// Held in a buffer beyond the lease without publish; the row returns
    /// to the claimable pool.
    #[error("lease expired before publish")]
    LeaseExpired,

    /// `(stream_id, version)` collision on the event store. Fails just this
    /// message; other batch entries proceed.
    #[error("optimistic concurrency conflict on stream {stream_id}")]
    OptimisticConcurrency { stream_id: String },

    /// Unclassified. Error text preserved; retried per retry policy.
    #[error("unclassified failure: {0}")]
    Unknown(String),
}

impl CoordinationError {
    /// Stable reason tag stored in `failure_reason` columns.
    pub fn reason(&self) -> &'static str {
        match self {
            CoordinationError::TransportNotReady => "TransportNotReady",
            CoordinationError::Transport(_) => "TransportException",
            CoordinationError::Serialization(_) => "SerializationError",
            CoordinationError::Validation(_) => "ValidationError",
            CoordinationError::MaxAttemptsExceeded { .. } => "MaxAttemptsExceeded",
            CoordinationError::LeaseExpired => "LeaseExpired",
            CoordinationError::OptimisticConcurrency { .. } => "OptimisticConcurrency",
            CoordinationError::Unknown(_) => "Unknown",
        }
    }

    /// Permanent failures are marked `FAILED` and never retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CoordinationError::Serialization(_)
                | CoordinationError::Validation(_)
                | CoordinationError::MaxAttemptsExceeded { .. }
        )
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(e: serde_json::Error) -> Self {
        CoordinationError::Serialization(e.to_string())
    }
}

/// A per-message error captured inside a committed coordinator call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkBatchError {
    pub message_id: Uuid,
    /// Stable tag, see [`CoordinationError::reason`].
    pub reason: String,
    pub detail: String,
}

impl WorkBatchError {
    pub fn new(message_id: Uuid, err: &CoordinationError) -> Self {
        Self {
            message_id,
            reason: err.reason().to_string(),
            detail: err.to_string(),
        }
    }
}
