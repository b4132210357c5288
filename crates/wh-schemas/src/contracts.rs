//! Async contracts implemented by the Postgres and in-memory backends.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::work::{
    PerspectiveCompletion, PerspectiveFailure, StoredEvent, WorkBatch, WorkBatchRequest,
};

/// The single writer to all coordination tables.
///
/// `process_work_batch` is atomic: all of heart-beating, stale cleanup,
/// ingestion, event append, acknowledgement, lease renewal and claiming
/// commit together or not at all. Cancellation mid-call aborts the
/// transaction; leases granted in the aborted call are not persisted.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn process_work_batch(
        &self,
        request: WorkBatchRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<WorkBatch>;

    /// Out-of-band checkpoint update; touches only the checkpoint row.
    async fn report_perspective_completion(
        &self,
        completion: &PerspectiveCompletion,
    ) -> anyhow::Result<()>;

    /// Out-of-band failure record; touches only the checkpoint row.
    async fn report_perspective_failure(
        &self,
        failure: &PerspectiveFailure,
    ) -> anyhow::Result<()>;
}

/// Applied to the database (skip coordinator calls and buffer in memory
/// when not ready) and to transports (back off the publisher).
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self) -> bool;
}

/// Read-only event access for perspective replay. Implementations never
/// expose writes; only the coordinator appends.
#[async_trait]
pub trait EventStoreReader: Send + Sync {
    /// Events of `stream_id` strictly after `after` (exclusive), oldest
    /// first, at most `limit`. `after = None` replays from version 0.
    async fn events_after(
        &self,
        stream_id: &str,
        after: Option<Uuid>,
        limit: i64,
    ) -> anyhow::Result<Vec<StoredEvent>>;
}

/// Runtime descriptor for a registered envelope type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub envelope_type: String,
    /// Schema identifier or version tag the application associates with the
    /// type; opaque to the engine.
    pub schema: Option<String>,
}

/// `envelope_type` string → runtime descriptor, consulted once per payload
/// deserialization. Populated by explicit registration (build-time codegen
/// or user calls) — never by runtime type scanning.
pub trait EventTypeProvider: Send + Sync {
    fn resolve(&self, envelope_type: &str) -> Option<TypeDescriptor>;
}

/// Persists request/reply correlation for the dispatcher's `local_invoke`
/// path; backed by the `request_response` table.
#[async_trait]
pub trait RequestResponseRecorder: Send + Sync {
    async fn record_request(&self, correlation_id: Uuid, request_message_id: Uuid)
        -> anyhow::Result<()>;
    async fn record_response(
        &self,
        correlation_id: Uuid,
        response: &serde_json::Value,
    ) -> anyhow::Result<()>;
}
