//! The strategy contract shared by Immediate, Scoped and Interval.

use async_trait::async_trait;
use wh_schemas::{
    BatchFlags, CompletionReport, FailureReport, NewInboxMessage, NewOutboxMessage,
    PerspectiveCompletion, PerspectiveFailure, ReceptorCompletion, WorkBatch,
};

/// Queue operations buffer into the current unit of work; `flush` drives
/// the coordinator. Which queue call (if any) triggers a flush is the
/// strategy's business.
#[async_trait]
pub trait FlushStrategy: Send + Sync {
    async fn queue_outbox(&self, message: NewOutboxMessage) -> anyhow::Result<()>;
    async fn queue_inbox(&self, message: NewInboxMessage) -> anyhow::Result<()>;

    async fn queue_outbox_completion(&self, completion: CompletionReport) -> anyhow::Result<()>;
    async fn queue_inbox_completion(&self, completion: CompletionReport) -> anyhow::Result<()>;
    async fn queue_outbox_failure(&self, failure: FailureReport) -> anyhow::Result<()>;
    async fn queue_inbox_failure(&self, failure: FailureReport) -> anyhow::Result<()>;
    async fn queue_receptor_completion(&self, completion: ReceptorCompletion)
        -> anyhow::Result<()>;
    async fn queue_perspective_completion(
        &self,
        completion: PerspectiveCompletion,
    ) -> anyhow::Result<()>;
    async fn queue_perspective_failure(&self, failure: PerspectiveFailure) -> anyhow::Result<()>;

    /// Drive the coordinator with everything buffered. Buffers are cleared
    /// only after the coordinator returns; a failed call restores them.
    async fn flush(&self, flags: BatchFlags) -> anyhow::Result<WorkBatch>;

    /// Items currently buffered (all queues combined).
    fn pending_len(&self) -> usize;
}
