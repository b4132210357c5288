//! Claimed inbox work → receptor fan-out.
//!
//! Designed to slot into the ordered stream processor: the handler returns
//! the status mask that completed, or the pre-failure mask plus error so
//! the stream stops in order.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use wh_lifecycle::{LifecycleContext, LifecycleInvoker, LifecycleStage, MessageSource};
use wh_schemas::{EventTypeProvider, InboxWork, MessageEnvelope, MessageStatus, ReceptorCompletion};
use wh_strategies::FlushStrategy;
use wh_streams::ProcessingFailure;

use crate::receptors::{ReceptorContext, ReceptorRegistry};

pub struct InboxProcessor {
    receptors: Arc<ReceptorRegistry>,
    invoker: LifecycleInvoker,
    strategy: Arc<dyn FlushStrategy>,
    types: Option<Arc<dyn EventTypeProvider>>,
}

impl InboxProcessor {
    pub fn new(
        receptors: Arc<ReceptorRegistry>,
        invoker: LifecycleInvoker,
        strategy: Arc<dyn FlushStrategy>,
    ) -> Self {
        Self {
            receptors,
            invoker,
            strategy,
            types: None,
        }
    }

    /// Reject payloads whose envelope type is not registered. Without a
    /// provider every type passes.
    pub fn with_type_provider(mut self, types: Arc<dyn EventTypeProvider>) -> Self {
        self.types = Some(types);
        self
    }

    /// Handler closure for `StreamProcessor::process`.
    pub fn handler(
        self: &Arc<Self>,
    ) -> impl Fn(InboxWork) -> BoxFuture<'static, Result<MessageStatus, ProcessingFailure>>
           + Send
           + Sync
           + Clone {
        let this = Arc::clone(self);
        move |item| {
            let this = Arc::clone(&this);
            async move { this.process_item(item).await }.boxed()
        }
    }

    /// Run every registered receptor for one inbox item, recording per-
    /// receptor completions. The first receptor failure stops the item.
    pub async fn process_item(
        &self,
        item: InboxWork,
    ) -> Result<MessageStatus, ProcessingFailure> {
        if let Some(types) = &self.types {
            if types.resolve(&item.envelope_type).is_none() {
                return Err(ProcessingFailure {
                    completed: item.status,
                    error: format!("unregistered envelope type {}", item.envelope_type),
                    reason: "ValidationError".to_string(),
                });
            }
        }

        let envelope: MessageEnvelope = match serde_json::from_value(item.envelope_json.clone()) {
            Ok(envelope) => envelope,
            Err(err) => {
                return Err(ProcessingFailure {
                    completed: item.status,
                    error: format!("envelope decode failed: {err}"),
                    reason: "SerializationError".to_string(),
                });
            }
        };

        let mut ctx = LifecycleContext::new(LifecycleStage::PreInboxAsync, &item.envelope_type)
            .with_message(item.message_id, MessageSource::Inbox)
            .with_attempt(item.attempts);
        if let Some(stream) = &item.stream_id {
            ctx = ctx.with_stream(stream.clone());
        }

        self.invoker.invoke_async(&ctx);
        if let Err(err) = self
            .invoker
            .invoke_inline(&ctx.at_stage(LifecycleStage::PreInboxInline))
            .await
        {
            return Err(ProcessingFailure {
                completed: item.status,
                error: format!("{err:#}"),
                reason: "Unknown".to_string(),
            });
        }

        for named in self.receptors.receptors_for(&item.envelope_type) {
            let receptor_ctx = ReceptorContext {
                message_id: envelope.message_id,
                correlation_id: envelope.correlation_id,
                envelope_type: item.envelope_type.clone(),
                attempt: item.attempts,
            };

            match (named.receptor)(receptor_ctx, envelope.payload.clone()).await {
                Ok(_) => {
                    let completion = ReceptorCompletion {
                        message_id: item.message_id,
                        receptor_name: named.name.clone(),
                        succeeded: true,
                        error: None,
                    };
                    if let Err(err) = self.strategy.queue_receptor_completion(completion).await {
                        tracing::warn!(error = %err, "failed to queue receptor completion");
                    }
                }
                Err(err) => {
                    let completion = ReceptorCompletion {
                        message_id: item.message_id,
                        receptor_name: named.name.clone(),
                        succeeded: false,
                        error: Some(err.to_string()),
                    };
                    if let Err(queue_err) =
                        self.strategy.queue_receptor_completion(completion).await
                    {
                        tracing::warn!(error = %queue_err, "failed to queue receptor failure");
                    }
                    return Err(ProcessingFailure {
                        completed: item.status,
                        error: format!("receptor {} failed: {err:#}", named.name),
                        reason: "Unknown".to_string(),
                    });
                }
            }
        }

        self.invoker
            .invoke_async(&ctx.at_stage(LifecycleStage::PostInboxAsync));
        if let Err(err) = self
            .invoker
            .invoke_inline(&ctx.at_stage(LifecycleStage::PostInboxInline))
            .await
        {
            return Err(ProcessingFailure {
                completed: item.status,
                error: format!("{err:#}"),
                reason: "Unknown".to_string(),
            });
        }

        Ok(item.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;
    use wh_lifecycle::LifecycleRegistry;
    use wh_schemas::{
        BatchFlags, CompletionReport, FailureReport, NewInboxMessage, NewOutboxMessage,
        PerspectiveCompletion, PerspectiveFailure, WorkBatch, WorkItemFlags,
    };

    #[derive(Default)]
    struct RecordingStrategy {
        receptor_completions: Mutex<Vec<ReceptorCompletion>>,
    }

    #[async_trait]
    impl FlushStrategy for RecordingStrategy {
        async fn queue_outbox(&self, _m: NewOutboxMessage) -> anyhow::Result<()> {
            Ok(())
        }
        async fn queue_inbox(&self, _m: NewInboxMessage) -> anyhow::Result<()> {
            Ok(())
        }
        async fn queue_outbox_completion(&self, _c: CompletionReport) -> anyhow::Result<()> {
            Ok(())
        }
        async fn queue_inbox_completion(&self, _c: CompletionReport) -> anyhow::Result<()> {
            Ok(())
        }
        async fn queue_outbox_failure(&self, _f: FailureReport) -> anyhow::Result<()> {
            Ok(())
        }
        async fn queue_inbox_failure(&self, _f: FailureReport) -> anyhow::Result<()> {
            Ok(())
        }
        async fn queue_receptor_completion(&self, c: ReceptorCompletion) -> anyhow::Result<()> {
            self.receptor_completions.lock().unwrap().push(c);
            Ok(())
        }
        async fn queue_perspective_completion(
            &self,
            _c: PerspectiveCompletion,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn queue_perspective_failure(&self, _f: PerspectiveFailure) -> anyhow::Result<()> {
            Ok(())
        }
        async fn flush(&self, _flags: BatchFlags) -> anyhow::Result<WorkBatch> {
            Ok(WorkBatch::default())
        }
        fn pending_len(&self) -> usize {
            0
        }
    }

    fn inbox_item(envelope_type: &str) -> InboxWork {
        let envelope = MessageEnvelope::new(json!({"n": 1}));
        InboxWork {
            message_id: envelope.message_id,
            handler_name: "orders".into(),
            event_type: envelope_type.into(),
            envelope_type: envelope_type.into(),
            envelope_json: serde_json::to_value(&envelope).unwrap(),
            stream_id: Some("s".into()),
            partition_number: Some(0),
            is_event: true,
            status: MessageStatus::STORED | MessageStatus::EVENT_STORED,
            flags: WorkItemFlags::NEWLY_STORED,
            attempts: 0,
            sequence_order: envelope.sequence_order(),
        }
    }

    fn processor() -> (Arc<InboxProcessor>, Arc<RecordingStrategy>, Arc<ReceptorRegistry>) {
        let strategy = Arc::new(RecordingStrategy::default());
        let receptors = Arc::new(ReceptorRegistry::new());
        let processor = Arc::new(InboxProcessor::new(
            Arc::clone(&receptors),
            LifecycleInvoker::new(Arc::new(LifecycleRegistry::new())),
            Arc::clone(&strategy) as Arc<dyn FlushStrategy>,
        ));
        (processor, strategy, receptors)
    }

    #[tokio::test]
    async fn all_receptors_run_and_report() {
        let (processor, strategy, receptors) = processor();
        let runs = Arc::new(AtomicUsize::new(0));

        for name in ["audit", "apply"] {
            let runs = Arc::clone(&runs);
            receptors.register(
                "OrderPlaced",
                name,
                Arc::new(move |_, _: Value| {
                    let runs = Arc::clone(&runs);
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    }
                    .boxed()
                }),
            );
        }

        let status = processor.process_item(inbox_item("OrderPlaced")).await.unwrap();
        assert_eq!(status, MessageStatus::STORED | MessageStatus::EVENT_STORED);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let completions = strategy.receptor_completions.lock().unwrap();
        assert_eq!(completions.len(), 2);
        assert!(completions.iter().all(|c| c.succeeded));
    }

    #[tokio::test]
    async fn receptor_failure_carries_pre_failure_status() {
        let (processor, strategy, receptors) = processor();
        receptors.register(
            "OrderPlaced",
            "boom",
            Arc::new(|_, _| async { anyhow::bail!("no stock") }.boxed()),
        );

        let failure = processor
            .process_item(inbox_item("OrderPlaced"))
            .await
            .unwrap_err();

        assert_eq!(
            failure.completed,
            MessageStatus::STORED | MessageStatus::EVENT_STORED
        );
        assert!(failure.error.contains("no stock"));

        let completions = strategy.receptor_completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert!(!completions[0].succeeded);
    }

    #[tokio::test]
    async fn undecodable_envelope_is_a_serialization_failure() {
        let (processor, _, _) = processor();
        let mut item = inbox_item("OrderPlaced");
        item.envelope_json = json!("not an envelope");

        let failure = processor.process_item(item).await.unwrap_err();
        assert_eq!(failure.reason, "SerializationError");
    }

    #[tokio::test]
    async fn unregistered_envelope_type_is_a_validation_failure() {
        let (processor, _, receptors) = processor();
        receptors.register(
            "OrderPlaced",
            "apply",
            Arc::new(|_, _: Value| async { Ok(None) }.boxed()),
        );

        let types = Arc::new(crate::types::StaticTypeProvider::new());
        types.register("OrderPlaced", None);
        let processor = Arc::try_unwrap(processor)
            .unwrap_or_else(|_| panic!("processor uniquely owned"))
            .with_type_provider(types);

        // A registered type passes.
        assert!(processor.process_item(inbox_item("OrderPlaced")).await.is_ok());

        // An unregistered one fails permanently before any receptor runs.
        let failure = processor
            .process_item(inbox_item("StockChanged"))
            .await
            .unwrap_err();
        assert_eq!(failure.reason, "ValidationError");
    }
}
