//! Deterministic in-memory transport.
//!
//! Design decisions (kept intentionally simple/deterministic):
//! - No randomness, no timestamps; publication order is call order.
//! - `set_ready(false)` makes `publish` fail with `TransportNotReady`.
//! - `fail_next(n)` makes the next `n` publishes fail with a transport
//!   error, for retry-path tests.
//! - `inject` simulates a broker delivery (including redelivery) straight
//!   to the destination's subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use wh_schemas::CoordinationError;

use crate::transport::{MessageHeaders, Transport, TransportDelivery};

#[derive(Default)]
struct Inner {
    published: Vec<TransportDelivery>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<TransportDelivery>>>,
}

#[derive(Default)]
pub struct InMemoryTransport {
    inner: Mutex<Inner>,
    not_ready: AtomicBool,
    fail_next: AtomicUsize,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.not_ready.store(!ready, Ordering::SeqCst);
    }

    /// Fail the next `n` publish calls with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Everything published so far, in publication order.
    pub fn published(&self) -> Vec<TransportDelivery> {
        self.lock().published.clone()
    }

    /// Simulate an inbound broker delivery.
    pub fn inject(&self, destination: &str, headers: MessageHeaders, envelope_json: Value) {
        let delivery = TransportDelivery {
            destination: destination.to_string(),
            headers,
            envelope_json,
        };
        self.fan_out(&delivery);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fan_out(&self, delivery: &TransportDelivery) {
        let mut inner = self.lock();
        if let Some(sinks) = inner.subscribers.get_mut(&delivery.destination) {
            sinks.retain(|sink| sink.send(delivery.clone()).is_ok());
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(
        &self,
        envelope_json: &Value,
        destination: &str,
        headers: &MessageHeaders,
    ) -> Result<(), CoordinationError> {
        if self.not_ready.load(Ordering::SeqCst) {
            return Err(CoordinationError::TransportNotReady);
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CoordinationError::Transport(
                "injected publish failure".to_string(),
            ));
        }

        let delivery = TransportDelivery {
            destination: destination.to_string(),
            headers: headers.clone(),
            envelope_json: envelope_json.clone(),
        };
        self.lock().published.push(delivery.clone());
        self.fan_out(&delivery);
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<TransportDelivery>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .subscribers
            .entry(destination.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn is_ready(&self) -> bool {
        !self.not_ready.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers() -> MessageHeaders {
        MessageHeaders {
            event_type: "OrderPlaced".into(),
            envelope_type: "OrderPlaced".into(),
            stream_id: Some("order-1".into()),
            is_event: true,
        }
    }

    #[tokio::test]
    async fn publish_records_and_fans_out() {
        let transport = InMemoryTransport::new();
        let mut rx = transport.subscribe("orders.events").await.unwrap();

        transport
            .publish(&json!({"message_id": "m"}), "orders.events", &headers())
            .await
            .unwrap();

        assert_eq!(transport.published().len(), 1);
        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.destination, "orders.events");
        assert_eq!(delivery.headers.stream_id.as_deref(), Some("order-1"));
    }

    #[tokio::test]
    async fn not_ready_fails_with_the_right_kind() {
        let transport = InMemoryTransport::new();
        transport.set_ready(false);
        assert!(!transport.is_ready().await);

        let err = transport
            .publish(&json!({}), "d", &headers())
            .await
            .unwrap_err();
        assert_eq!(err, CoordinationError::TransportNotReady);
    }

    #[tokio::test]
    async fn fail_next_injects_exactly_n_failures() {
        let transport = InMemoryTransport::new();
        transport.fail_next(2);

        assert!(transport.publish(&json!({}), "d", &headers()).await.is_err());
        assert!(transport.publish(&json!({}), "d", &headers()).await.is_err());
        assert!(transport.publish(&json!({}), "d", &headers()).await.is_ok());
    }

    #[tokio::test]
    async fn inject_reaches_only_matching_subscribers() {
        let transport = InMemoryTransport::new();
        let mut orders = transport.subscribe("orders").await.unwrap();
        let mut billing = transport.subscribe("billing").await.unwrap();

        transport.inject("orders", headers(), json!({"k": 1}));

        assert!(orders.try_recv().is_ok());
        assert!(billing.try_recv().is_err());
    }
}
