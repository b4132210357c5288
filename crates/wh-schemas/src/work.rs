//! Work-batch request/response DTOs — the coordinator's wire surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::WorkBatchError;
use crate::instance::ServiceInstance;
use crate::status::{BatchFlags, MessageStatus, WorkItemFlags};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Coordination tunables carried on every request. Defaults match the
/// deployment-wide ones; per-call overrides exist for tests and for
/// operators draining a queue with a short lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationSettings {
    pub partition_count: i32,
    pub lease_seconds: i64,
    pub stale_instance_seconds: i64,
    /// Upper bound on rows claimed per call, per table.
    pub claim_batch_size: i64,
    /// Attempt ceiling before a row is failed permanently.
    pub max_attempts: i32,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            partition_count: 10_000,
            lease_seconds: 300,
            stale_instance_seconds: 600,
            claim_batch_size: 100,
            max_attempts: 5,
        }
    }
}

impl CoordinationSettings {
    /// The stale threshold must exceed the lease, otherwise an instance can
    /// be declared dead while still holding live leases.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.partition_count > 0, "partition_count must be > 0");
        anyhow::ensure!(self.lease_seconds > 0, "lease_seconds must be > 0");
        anyhow::ensure!(
            self.stale_instance_seconds > self.lease_seconds,
            "stale_instance_seconds ({}) must exceed lease_seconds ({})",
            self.stale_instance_seconds,
            self.lease_seconds
        );
        anyhow::ensure!(self.claim_batch_size > 0, "claim_batch_size must be > 0");
        anyhow::ensure!(self.max_attempts > 0, "max_attempts must be > 0");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// New messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOutboxMessage {
    pub message_id: Uuid,
    pub destination: String,
    pub event_type: String,
    pub envelope_type: String,
    pub envelope_json: Value,
    pub metadata_json: Value,
    pub scope_json: Option<Value>,
    pub stream_id: Option<String>,
    pub is_event: bool,
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInboxMessage {
    pub message_id: Uuid,
    pub handler_name: String,
    pub event_type: String,
    pub envelope_type: String,
    pub envelope_json: Value,
    pub metadata_json: Value,
    pub scope_json: Option<Value>,
    pub stream_id: Option<String>,
    pub is_event: bool,
}

// ---------------------------------------------------------------------------
// Acknowledgements
// ---------------------------------------------------------------------------

/// Stages that completed since the row was claimed; OR-ed onto the
/// persisted status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub message_id: Uuid,
    pub status: MessageStatus,
}

/// Stages that completed before the failure, plus what went wrong.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub message_id: Uuid,
    pub completed: MessageStatus,
    pub error: String,
    /// Stable tag, see `CoordinationError::reason`.
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceptorCompletion {
    pub message_id: Uuid,
    pub receptor_name: String,
    pub succeeded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveCompletion {
    pub stream_id: String,
    pub perspective_name: String,
    /// Last event folded into the projection.
    pub last_event_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveFailure {
    pub stream_id: String,
    pub perspective_name: String,
    /// The event at which `apply` threw.
    pub failed_event_id: Option<Uuid>,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Everything one coordinator call carries. Heartbeat, ingestion,
/// acknowledgement, lease renewal and claiming happen atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkBatchRequest {
    pub instance: ServiceInstance,

    pub new_outbox: Vec<NewOutboxMessage>,
    pub new_inbox: Vec<NewInboxMessage>,

    /// Ids the caller still holds and wants extended.
    pub renew_outbox: Vec<Uuid>,
    pub renew_inbox: Vec<Uuid>,

    pub outbox_completions: Vec<CompletionReport>,
    pub inbox_completions: Vec<CompletionReport>,
    pub outbox_failures: Vec<FailureReport>,
    pub inbox_failures: Vec<FailureReport>,
    pub receptor_completions: Vec<ReceptorCompletion>,
    pub perspective_completions: Vec<PerspectiveCompletion>,
    pub perspective_failures: Vec<PerspectiveFailure>,

    pub settings: CoordinationSettings,
    pub flags: BatchFlags,
}

impl WorkBatchRequest {
    pub fn heartbeat(instance: ServiceInstance) -> Self {
        Self {
            instance,
            new_outbox: Vec::new(),
            new_inbox: Vec::new(),
            renew_outbox: Vec::new(),
            renew_inbox: Vec::new(),
            outbox_completions: Vec::new(),
            inbox_completions: Vec::new(),
            outbox_failures: Vec::new(),
            inbox_failures: Vec::new(),
            receptor_completions: Vec::new(),
            perspective_completions: Vec::new(),
            perspective_failures: Vec::new(),
            settings: CoordinationSettings::default(),
            flags: BatchFlags::empty(),
        }
    }

    /// Whether this call carries anything beyond the heartbeat itself.
    pub fn is_empty(&self) -> bool {
        self.new_outbox.is_empty()
            && self.new_inbox.is_empty()
            && self.renew_outbox.is_empty()
            && self.renew_inbox.is_empty()
            && self.outbox_completions.is_empty()
            && self.inbox_completions.is_empty()
            && self.outbox_failures.is_empty()
            && self.inbox_failures.is_empty()
            && self.receptor_completions.is_empty()
            && self.perspective_completions.is_empty()
            && self.perspective_failures.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxWork {
    pub message_id: Uuid,
    pub destination: String,
    pub event_type: String,
    pub envelope_type: String,
    pub envelope_json: Value,
    pub stream_id: Option<String>,
    pub partition_number: Option<i32>,
    pub is_event: bool,
    pub status: MessageStatus,
    pub flags: WorkItemFlags,
    pub attempts: i32,
    /// Milliseconds; ordering key within a stream.
    pub sequence_order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxWork {
    pub message_id: Uuid,
    pub handler_name: String,
    pub event_type: String,
    pub envelope_type: String,
    pub envelope_json: Value,
    pub stream_id: Option<String>,
    pub partition_number: Option<i32>,
    pub is_event: bool,
    pub status: MessageStatus,
    pub flags: WorkItemFlags,
    pub attempts: i32,
    pub sequence_order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveWork {
    pub stream_id: String,
    pub perspective_name: String,
    /// `None` means the projection has never caught up; replay from the
    /// beginning of the stream.
    pub last_event_id: Option<Uuid>,
}

/// The coordinator's answer: three ordered work lists plus per-message
/// errors captured while the transaction still committed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkBatch {
    pub outbox: Vec<OutboxWork>,
    pub inbox: Vec<InboxWork>,
    pub perspectives: Vec<PerspectiveWork>,
    pub errors: Vec<WorkBatchError>,
    /// Active instances after stale cleanup; drives the ownership formula.
    pub active_instances: i64,
}

impl WorkBatch {
    pub fn is_empty(&self) -> bool {
        self.outbox.is_empty() && self.inbox.is_empty() && self.perspectives.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Event store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub stream_id: String,
    pub version: i64,
    pub event_type: String,
    pub event_data: Value,
    pub metadata: Value,
    pub scope: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        CoordinationSettings::default().validate().unwrap();
    }

    #[test]
    fn stale_threshold_must_exceed_lease() {
        let s = CoordinationSettings {
            lease_seconds: 600,
            stale_instance_seconds: 600,
            ..Default::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn heartbeat_request_is_empty() {
        let req = WorkBatchRequest::heartbeat(ServiceInstance::new("svc", "host", 1));
        assert!(req.is_empty());
    }
}
