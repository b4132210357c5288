//! Consumer loop: transport deliveries → inbox queue calls.
//!
//! Redelivery is expected and harmless; the coordinator's dedup rejects
//! replayed message ids permanently.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use wh_schemas::NewInboxMessage;
use wh_strategies::FlushStrategy;

use crate::transport::{Transport, TransportDelivery};

pub struct ConsumerLoop {
    transport: Arc<dyn Transport>,
    strategy: Arc<dyn FlushStrategy>,
    cancel: CancellationToken,
}

impl ConsumerLoop {
    pub fn new(
        transport: Arc<dyn Transport>,
        strategy: Arc<dyn FlushStrategy>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            strategy,
            cancel,
        }
    }

    /// Subscribe to one destination and pump deliveries into the inbox
    /// under `handler_name` until cancelled.
    pub async fn spawn(&self, destination: &str, handler_name: &str) -> Result<JoinHandle<()>> {
        let mut deliveries = self.transport.subscribe(destination).await?;
        let strategy = Arc::clone(&self.strategy);
        let cancel = self.cancel.clone();
        let handler_name = handler_name.to_string();

        Ok(tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = cancel.cancelled() => break,
                    delivery = deliveries.recv() => match delivery {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };
                ingest(&strategy, &handler_name, delivery).await;
            }
        }))
    }
}

async fn ingest(
    strategy: &Arc<dyn FlushStrategy>,
    handler_name: &str,
    delivery: TransportDelivery,
) {
    // The envelope's own id is the dedup key; a delivery we cannot identify
    // cannot be deduplicated and is dropped. The broker will redeliver.
    let Some(message_id) = delivery
        .envelope_json
        .get("message_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
    else {
        tracing::warn!(
            destination = %delivery.destination,
            "delivery without a parseable message_id dropped"
        );
        return;
    };

    let message = NewInboxMessage {
        message_id,
        handler_name: handler_name.to_string(),
        event_type: delivery.headers.event_type,
        envelope_type: delivery.headers.envelope_type,
        envelope_json: delivery.envelope_json,
        metadata_json: serde_json::Value::Null,
        scope_json: None,
        stream_id: delivery.headers.stream_id,
        is_event: delivery.headers.is_event,
    };

    if let Err(err) = strategy.queue_inbox(message).await {
        tracing::warn!(error = %err, %message_id, "failed to queue inbound delivery");
    }
}
