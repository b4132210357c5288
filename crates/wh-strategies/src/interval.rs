//! Interval strategy: accumulate and flush on a fixed wall-clock cadence
//! (default 100 ms), plus on explicit demand. Highest throughput, highest
//! latency.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use wh_schemas::{
    BatchFlags, CompletionReport, FailureReport, NewInboxMessage, NewOutboxMessage,
    PerspectiveCompletion, PerspectiveFailure, ReceptorCompletion, WorkBatch,
};

use crate::core::StrategyCore;
use crate::strategy::FlushStrategy;

pub struct IntervalStrategy {
    core: Arc<StrategyCore>,
    ticker: JoinHandle<()>,
}

impl IntervalStrategy {
    /// Spawn the background ticker. It flushes every `interval` until the
    /// core's cancellation token fires; a not-ready database leaves the
    /// unit buffered for the next tick.
    pub fn spawn(core: Arc<StrategyCore>, interval: Duration) -> Self {
        let ticker_core = Arc::clone(&core);
        let cancel = core.cancel_token().clone();
        let ticker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if ticker_core.pending_len() == 0 {
                    continue;
                }
                match ticker_core.flush(BatchFlags::empty()).await {
                    Ok(batch) => ticker_core.deliver(batch),
                    Err(err) => {
                        tracing::warn!(error = %err, "interval flush failed; unit restored");
                    }
                }
            }
        });

        Self { core, ticker }
    }

    pub fn abort(&self) {
        self.ticker.abort();
    }
}

impl Drop for IntervalStrategy {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

#[async_trait]
impl FlushStrategy for IntervalStrategy {
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
