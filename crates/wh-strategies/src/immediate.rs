//! Immediate strategy: every queue call drains into a flush.
//!
//! Lowest latency, highest coordinator load; for request-response paths.

use std::sync::Arc;

use async_trait::async_trait;
use wh_schemas::{
    BatchFlags, CompletionReport, FailureReport, NewInboxMessage, NewOutboxMessage,
    PerspectiveCompletion, PerspectiveFailure, ReceptorCompletion, WorkBatch,
};

use crate::core::StrategyCore;
use crate::strategy::FlushStrategy;

pub struct ImmediateStrategy {
    core: Arc<StrategyCore>,
}

impl ImmediateStrategy {
    pub fn new(core: Arc<StrategyCore>) -> Self {
        Self { core }
    }

    async fn drain(&self) -> anyhow::Result<()> {
        let batch = self.core.flush(BatchFlags::empty()).await?;
        self.core.deliver(batch);
        Ok(())
    }
}

#[async_trait]
impl FlushStrategy for ImmediateStrategy {
    async fn queue_outbox(&self, message: NewOutboxMessage) -> anyhow::Result<()> {
        self.core.queue_outbox(message);
        self.drain().await
    }

    async fn queue_inbox(&self, message: NewInboxMessage) -> anyhow::Result<()> {
        self.core.queue_inbox(message);
        self.drain().await
    }

    async fn queue_outbox_completion(&self, completion: CompletionReport) -> anyhow::Result<()> {
        self.core.queue_outbox_completion(completion);
        self.drain().await
    }

    async fn queue_inbox_completion(&self, completion: CompletionReport) -> anyhow::Result<()> {
        self.core.queue_inbox_completion(completion);
        self.drain().await
    }

    async fn queue_outbox_failure(&self, failure: FailureReport) -> anyhow::Result<()> {
        self.core.queue_outbox_failure(failure);
        self.drain().await
    }

    async fn queue_inbox_failure(&self, failure: FailureReport) -> anyhow::Result<()> {
        self.core.queue_inbox_failure(failure);
        self.drain().await
    }

    async fn queue_receptor_completion(
        &self,
        completion: ReceptorCompletion,
    ) -> anyhow::Result<()> {
        self.core.queue_receptor_completion(completion);
        self.drain().await
    }

    async fn queue_perspective_completion(
        &self,
        completion: PerspectiveCompletion,
    ) -> anyhow::Result<()> {
        self.core.queue_perspective_completion(completion);
        self.drain().await
    }

    async fn queue_perspective_failure(&self, failure: PerspectiveFailure) -> anyhow::Result<()> {
        self.core.queue_perspective_failure(failure);
        self.drain().await
    }

    async fn flush(&self, flags: BatchFlags) -> anyhow::Result<WorkBatch> {
        self.core.flush(flags).await
    }

    fn pending_len(&self) -> usize {
        self.core.pending_len()
    }
}
