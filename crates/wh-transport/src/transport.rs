//! The transport contract.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use wh_schemas::CoordinationError;

/// Routing metadata carried alongside the opaque envelope — the fields a
/// broker puts in message headers rather than the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeaders {
    pub event_type: String,
    pub envelope_type: String,
    pub stream_id: Option<String>,
    pub is_event: bool,
}

/// One delivery handed to a subscriber. Brokers may redeliver arbitrarily;
/// the inbox dedup absorbs it.
#[derive(Debug, Clone)]
pub struct TransportDelivery {
    pub destination: String,
    pub headers: MessageHeaders,
    pub envelope_json: Value,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// At-least-once publication of one envelope to a destination.
    async fn publish(
        &self,
        envelope_json: &Value,
        destination: &str,
        headers: &MessageHeaders,
    ) -> Result<(), CoordinationError>;

    /// Stream of deliveries for a destination.
    async fn subscribe(
        &self,
        destination: &str,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<TransportDelivery>>;

    /// Readiness gate consulted by the publisher back-off.
    async fn is_ready(&self) -> bool;
}
