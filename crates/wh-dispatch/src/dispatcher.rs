//! `send` / `local_invoke` / `publish` over a flush strategy.

use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use wh_schemas::{CoordinationError, MessageEnvelope, NewOutboxMessage, RequestResponseRecorder};
use wh_strategies::FlushStrategy;

use crate::receptors::{ReceptorContext, ReceptorRegistry};

/// What the application hands to `send`/`publish`: routing plus payload;
/// the dispatcher wraps it in an envelope.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub envelope_type: String,
    pub event_type: String,
    pub destination: String,
    pub stream_id: Option<String>,
    pub is_event: bool,
    pub payload: Value,
    pub scope: Option<Value>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl OutboundMessage {
    pub fn command(
        envelope_type: impl Into<String>,
        destination: impl Into<String>,
        payload: Value,
    ) -> Self {
        let envelope_type = envelope_type.into();
        Self {
            event_type: envelope_type.clone(),
            envelope_type,
            destination: destination.into(),
            stream_id: None,
            is_event: false,
            payload,
            scope: None,
            scheduled_for: None,
        }
    }

    pub fn event(
        envelope_type: impl Into<String>,
        destination: impl Into<String>,
        stream_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        let envelope_type = envelope_type.into();
        Self {
            event_type: envelope_type.clone(),
            envelope_type,
            destination: destination.into(),
            stream_id: Some(stream_id.into()),
            is_event: true,
            payload,
            scope: None,
            scheduled_for: None,
        }
    }
}

/// Acceptance into the buffer — not a broker acknowledgement.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub message_id: Uuid,
    pub correlation_id: Uuid,
    pub accepted_at: DateTime<Utc>,
}

pub struct Dispatcher {
    strategy: Arc<dyn FlushStrategy>,
    receptors: Arc<ReceptorRegistry>,
    service_name: String,
    hop_tracing: bool,
    request_response: Option<Arc<dyn RequestResponseRecorder>>,
}

impl Dispatcher {
    pub fn new(
        strategy: Arc<dyn FlushStrategy>,
        receptors: Arc<ReceptorRegistry>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            strategy,
            receptors,
            service_name: service_name.into(),
            hop_tracing: true,
            request_response: None,
        }
    }

    /// Disable hop recording. `local_invoke` then takes its fast path: no
    /// envelope, no trail, the payload goes straight to the receptor.
    pub fn without_hop_tracing(mut self) -> Self {
        self.hop_tracing = false;
        self
    }

    pub fn with_request_response(mut self, recorder: Arc<dyn RequestResponseRecorder>) -> Self {
        self.request_response = Some(recorder);
        self
    }

    fn envelope_for(&self, message: &OutboundMessage, caller: Option<String>) -> MessageEnvelope {
        let mut envelope = MessageEnvelope::new(message.payload.clone());
        if self.hop_tracing {
            envelope.record_hop(
                &self.service_name,
                Some(&message.destination),
                "Send",
                caller,
            );
        }
        envelope
    }

    fn queue_payload(&self, message: OutboundMessage, envelope: MessageEnvelope) -> Result<(DeliveryReceipt, NewOutboxMessage)> {
        let receipt = DeliveryReceipt {
            message_id: envelope.message_id,
            correlation_id: envelope.correlation_id,
            accepted_at: Utc::now(),
        };
        let new_message = NewOutboxMessage {
            message_id: envelope.message_id,
            destination: message.destination,
            event_type: message.event_type,
            envelope_type: message.envelope_type,
            envelope_json: serde_json::to_value(&envelope)
                .map_err(CoordinationError::from)?,
            metadata_json: Value::Null,
            scope_json: message.scope,
            stream_id: message.stream_id,
            is_event: message.is_event,
            scheduled_for: message.scheduled_for,
        };
        Ok((receipt, new_message))
    }

    /// Fire-and-forget with receipt: accept into the buffer, return
    /// immediately. The broker acknowledgement happens asynchronously via
    /// the publisher loop.
    #[track_caller]
    pub fn send(
        &self,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<DeliveryReceipt>> + '_ {
        let location = std::panic::Location::caller();
        let caller = self.hop_tracing.then(|| location.to_string());
        async move {
            let envelope = self.envelope_for(&message, caller);
            let (receipt, new_message) = self.queue_payload(message, envelope)?;
            self.strategy.queue_outbox(new_message).await?;
            Ok(receipt)
        }
    }

    pub async fn send_many(&self, messages: Vec<OutboundMessage>) -> Result<Vec<DeliveryReceipt>> {
        let mut receipts = Vec::with_capacity(messages.len());
        for message in messages {
            let envelope = self.envelope_for(&message, None);
            let (receipt, new_message) = self.queue_payload(message, envelope)?;
            self.strategy.queue_outbox(new_message).await?;
            receipts.push(receipt);
        }
        Ok(receipts)
    }

    /// In-process request/reply: invoke the first registered receptor and
    /// return its value (or propagate its error directly).
    ///
    /// With hop tracing off this is the fast path: no envelope or trail is
    /// allocated, the payload goes straight through.
    pub async fn local_invoke(&self, envelope_type: &str, payload: Value) -> Result<Option<Value>> {
        let receptors = self.receptors.receptors_for(envelope_type);
        let Some(first) = receptors.first() else {
            bail!("no receptor registered for {envelope_type}");
        };

        if !self.hop_tracing {
            let ctx = ReceptorContext {
                message_id: Uuid::nil(),
                correlation_id: Uuid::nil(),
                envelope_type: envelope_type.to_string(),
                attempt: 0,
            };
            return (first.receptor)(ctx, payload).await;
        }

        let mut envelope = MessageEnvelope::new(payload);
        envelope.record_hop(&self.service_name, None, "LocalInvoke", None);
        let ctx = ReceptorContext {
            message_id: envelope.message_id,
            correlation_id: envelope.correlation_id,
            envelope_type: envelope_type.to_string(),
            attempt: 0,
        };

        if let Some(recorder) = &self.request_response {
            recorder
                .record_request(envelope.correlation_id, envelope.message_id)
                .await?;
        }

        let response = (first.receptor)(ctx, envelope.payload).await?;

        if let (Some(recorder), Some(value)) = (&self.request_response, response.as_ref()) {
            recorder.record_response(envelope.correlation_id, value).await?;
        }

        Ok(response)
    }

    pub async fn local_invoke_many(
        &self,
        calls: Vec<(String, Value)>,
    ) -> Result<Vec<Option<Value>>> {
        let mut results = Vec::with_capacity(calls.len());
        for (envelope_type, payload) in calls {
            results.push(self.local_invoke(&envelope_type, payload).await?);
        }
        Ok(results)
    }

    /// In-process fan-out to every registered receptor, plus an outbox
    /// append so remote subscribers see the event too. Local receptor
    /// errors are logged, not surfaced — publication is fire-and-forget.
    pub async fn publish(&self, message: OutboundMessage) -> Result<DeliveryReceipt> {
        let envelope = self.envelope_for(&message, None);

        for named in self.receptors.receptors_for(&message.envelope_type) {
            let ctx = ReceptorContext {
                message_id: envelope.message_id,
                correlation_id: envelope.correlation_id,
                envelope_type: message.envelope_type.clone(),
                attempt: 0,
            };
            if let Err(err) = (named.receptor)(ctx, envelope.payload.clone()).await {
                tracing::warn!(
                    receptor = %named.name,
                    envelope_type = %message.envelope_type,
                    error = %err,
                    "local receptor failed during publish fan-out"
                );
            }
        }

        let (receipt, new_message) = self.queue_payload(message, envelope)?;
        self.strategy.queue_outbox(new_message).await?;
        Ok(receipt)
    }
}
