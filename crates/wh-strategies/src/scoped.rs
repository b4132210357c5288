//! Scoped strategy: accumulate within an explicit scope (typically one
//! inbound request) and flush on scope close — reached by success or
//! failure alike. A manual flush mid-scope resets the buffers.

use std::sync::Arc;

use async_trait::async_trait;
use wh_schemas::{
    BatchFlags, CompletionReport, FailureReport, NewInboxMessage, NewOutboxMessage,
    PerspectiveCompletion, PerspectiveFailure, ReceptorCompletion, WorkBatch,
};

use crate::core::StrategyCore;
use crate::strategy::FlushStrategy;

pub struct ScopedStrategy {
    core: Arc<StrategyCore>,
}

impl ScopedStrategy {
    pub fn new(core: Arc<StrategyCore>) -> Self {
        Self { core }
    }

    /// Open a scope. Everything queued until `close` stays buffered.
    pub fn begin_scope(&self) -> FlushScope<'_> {
        FlushScope {
            strategy: self,
            closed: false,
        }
    }
}

/// Guard for one unit of work. `close` flushes; dropping without closing
/// abandons the buffered unit — it is discarded, never flushed — and logs
/// a warning, since that usually means a request path forgot its close
/// call.
pub struct FlushScope<'a> {
    strategy: &'a ScopedStrategy,
    closed: bool,
}

impl FlushScope<'_> {
    pub async fn close(mut self) -> anyhow::Result<WorkBatch> {
        self.closed = true;
        self.strategy.core.flush(BatchFlags::empty()).await
    }

    pub async fn close_with_flags(mut self, flags: BatchFlags) -> anyhow::Result<WorkBatch> {
        self.closed = true;
        self.strategy.core.flush(flags).await
    }
}

impl Drop for FlushScope<'_> {
    fn drop(&mut self) {
        if !self.closed {
            let discarded = self.strategy.core.discard_pending();
            tracing::warn!(
                discarded,
                "flush scope dropped without close; unit abandoned"
            );
        }
    }
}

#[async_trait]
impl FlushStrategy for ScopedStrategy {
    async fn queue_outbox(&self, message: NewOutboxMessage) -> anyhow::Result<()> {
        self.core.queue_outbox(message);
        Ok(())
    }

    async fn queue_inbox(&self, message: NewInboxMessage) -> anyhow::Result<()> {
        self.core.queue_inbox(message);
        Ok(())
    }

    async fn queue_outbox_completion(&self, completion: CompletionReport) -> anyhow::Result<()> {
        self.core.queue_outbox_completion(completion);
        Ok(())
    }

    async fn queue_inbox_completion(&self, completion: CompletionReport) -> anyhow::Result<()> {
        self.core.queue_inbox_completion(completion);
        Ok(())
    }

    async fn queue_outbox_failure(&self, failure: FailureReport) -> anyhow::Result<()> {
        self.core.queue_outbox_failure(failure);
        Ok(())
    }

    async fn queue_inbox_failure(&self, failure: FailureReport) -> anyhow::Result<()> {
        self.core.queue_inbox_failure(failure);
        Ok(())
    }

    async fn queue_receptor_completion(
        &self,
        completion: ReceptorCompletion,
    ) -> anyhow::Result<()> {
        self.core.queue_receptor_completion(completion);
        Ok(())
    }

    async fn queue_perspective_completion(
        &self,
        completion: PerspectiveCompletion,
    ) -> anyhow::Result<()> {
        self.core.queue_perspective_completion(completion);
        Ok(())
    }

    async fn queue_perspective_failure(&self, failure: PerspectiveFailure) -> anyhow::Result<()> {
        self.core.queue_perspective_failure(failure);
        Ok(())
    }

    async fn flush(&self, flags: BatchFlags) -> anyhow::Result<WorkBatch> {
        self.core.flush(flags).await
    }

    fn pending_len(&self) -> usize {
        self.core.pending_len()
    }
}
