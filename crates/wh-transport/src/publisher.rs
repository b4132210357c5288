//! Publisher loop: claimed outbox work → transport.
//!
//! Work arrives over an unbounded in-process channel. The loop backs off
//! while the transport is not ready; anything that outlives its lease in
//! the buffer is simply re-claimed on a later batch, so back-pressure never
//! loses messages. Per-stream publication order is preserved by running
//! the batch through the ordered stream processor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use wh_lifecycle::{LifecycleContext, LifecycleInvoker, LifecycleStage, MessageSource};
use wh_schemas::{MessageStatus, OutboxWork, WorkBatch};
use wh_strategies::FlushStrategy;
use wh_streams::{ProcessingFailure, StreamProcessor};

use crate::transport::{MessageHeaders, Transport};

pub struct PublisherLoop {
    transport: Arc<dyn Transport>,
    strategy: Arc<dyn FlushStrategy>,
    processor: StreamProcessor,
    invoker: Option<LifecycleInvoker>,
    cancel: CancellationToken,
    backoff: Duration,
}

impl PublisherLoop {
    pub fn new(
        transport: Arc<dyn Transport>,
        strategy: Arc<dyn FlushStrategy>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            strategy,
            processor: StreamProcessor::new(true),
            invoker: None,
            cancel,
            backoff: Duration::from_millis(250),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Fire `PreOutbox`/`PostOutbox` stages around each publication.
    pub fn with_lifecycle(mut self, invoker: LifecycleInvoker) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn spawn(self, batches: mpsc::UnboundedReceiver<WorkBatch>) -> JoinHandle<()> {
        tokio::spawn(self.run(batches))
    }

    async fn run(self, mut batches: mpsc::UnboundedReceiver<WorkBatch>) {
        loop {
            let batch = tokio::select! {
                _ = self.cancel.cancelled() => break,
                batch = batches.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            self.publish_batch(batch).await;
        }
    }

    /// Publish one batch's outbox work and queue the acknowledgements.
    pub async fn publish_batch(&self, batch: WorkBatch) {
        if batch.outbox.is_empty() {
            return;
        }

        while !self.transport.is_ready().await {
            if self.cancel.is_cancelled() {
                return;
            }
            tracing::debug!("transport not ready; publisher backing off");
            tokio::time::sleep(self.backoff).await;
        }

        let transport = Arc::clone(&self.transport);
        let invoker = self.invoker.clone();
        let report = self
            .processor
            .process(
                batch.outbox,
                move |item: OutboxWork| {
                    let transport = Arc::clone(&transport);
                    let invoker = invoker.clone();
                    async move {
                        // Stage already completed on a previous attempt.
                        if item.status.contains(MessageStatus::PUBLISHED) {
                            return Ok(item.status);
                        }

                        let ctx = invoker.as_ref().map(|_| {
                            let mut ctx = LifecycleContext::new(
                                LifecycleStage::PreOutboxAsync,
                                &item.envelope_type,
                            )
                            .with_message(item.message_id, MessageSource::Outbox)
                            .with_attempt(item.attempts);
                            if let Some(stream) = &item.stream_id {
                                ctx = ctx.with_stream(stream.clone());
                            }
                            ctx
                        });

                        if let (Some(invoker), Some(ctx)) = (&invoker, &ctx) {
                            invoker.invoke_async(ctx);
                            if let Err(err) = invoker
                                .invoke_inline(&ctx.at_stage(LifecycleStage::PreOutboxInline))
                                .await
                            {
                                return Err(ProcessingFailure {
                                    completed: item.status,
                                    error: format!("{err:#}"),
                                    reason: "Unknown".to_string(),
                                });
                            }
                        }

                        let headers = MessageHeaders {
                            event_type: item.event_type.clone(),
                            envelope_type: item.envelope_type.clone(),
                            stream_id: item.stream_id.clone(),
                            is_event: item.is_event,
                        };
                        let published = match transport
                            .publish(&item.envelope_json, &item.destination, &headers)
                            .await
                        {
                            Ok(()) => item.status | MessageStatus::PUBLISHED,
                            Err(err) => {
                                return Err(ProcessingFailure {
                                    completed: item.status,
                                    error: err.to_string(),
                                    reason: err.reason().to_string(),
                                })
                            }
                        };

                        if let (Some(invoker), Some(ctx)) = (&invoker, &ctx) {
                            invoker.invoke_async(&ctx.at_stage(LifecycleStage::PostOutboxAsync));
                            if let Err(err) = invoker
                                .invoke_inline(&ctx.at_stage(LifecycleStage::PostOutboxInline))
                                .await
                            {
                                // Publication already happened; report it so
                                // the retry skips the publish stage.
                                return Err(ProcessingFailure {
                                    completed: published,
                                    error: format!("{err:#}"),
                                    reason: "Unknown".to_string(),
                                });
                            }
                        }

                        Ok(published)
                    }
                },
                &self.cancel,
            )
            .await;

        for completion in report.completions() {
            if let Err(err) = self.strategy.queue_outbox_completion(completion).await {
                tracing::warn!(error = %err, "failed to queue outbox completion");
            }
        }
        for failure in report.failures() {
            if let Err(err) = self.strategy.queue_outbox_failure(failure).await {
                tracing::warn!(error = %err, "failed to queue outbox failure");
            }
        }
    }
}
