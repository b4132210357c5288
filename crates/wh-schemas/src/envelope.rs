//! The message envelope and its observability trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One record in an envelope's trail: every service, destination and
/// lifecycle stage the message has traversed, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hop {
    pub service_name: String,
    pub destination: Option<String>,
    pub stage: String,
    pub recorded_at: DateTime<Utc>,
    /// `file:line` of the dispatch call-site, when hop tracing is on.
    pub caller: Option<String>,
}

/// Identity, opaque payload, and the append-only hop trail. Serialized once
/// at the dispatch boundary; the coordinator treats the JSON as opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: Uuid,
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    pub payload: Value,
    #[serde(default)]
    pub hops: Vec<Hop>,
}

impl MessageEnvelope {
    /// A fresh envelope at the root of a new correlation chain.
    pub fn new(payload: Value) -> Self {
        let message_id = Uuid::now_v7();
        Self {
            message_id,
            correlation_id: message_id,
            causation_id: None,
            payload,
            hops: Vec::new(),
        }
    }

    /// An envelope caused by `parent`: shares its correlation id, records
    /// the parent's message id as causation.
    pub fn caused_by(payload: Value, parent: &MessageEnvelope) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            correlation_id: parent.correlation_id,
            causation_id: Some(parent.message_id),
            payload,
            hops: Vec::new(),
        }
    }

    /// Append one hop. The trail is append-only; nothing ever rewrites it.
    pub fn record_hop(
        &mut self,
        service_name: &str,
        destination: Option<&str>,
        stage: &str,
        caller: Option<String>,
    ) {
        self.hops.push(Hop {
            service_name: service_name.to_string(),
            destination: destination.map(str::to_string),
            stage: stage.to_string(),
            recorded_at: Utc::now(),
            caller,
        });
    }

    /// Milliseconds since the epoch extracted from the UUIDv7 message id.
    /// Doubles as the `sequence_order` used for per-stream ordering.
    pub fn sequence_order(&self) -> i64 {
        sequence_order_of(&self.message_id)
    }
}

/// `sequence_order` for any time-ordered (v7) id: the 48-bit millisecond
/// timestamp in its upper bytes. Non-v7 ids yield whatever those bytes hold;
/// callers that mix versions get arbitrary but stable ordering.
pub fn sequence_order_of(id: &Uuid) -> i64 {
    let b = id.as_bytes();
    (i64::from(b[0]) << 40)
        | (i64::from(b[1]) << 32)
        | (i64::from(b[2]) << 24)
        | (i64::from(b[3]) << 16)
        | (i64::from(b[4]) << 8)
        | i64::from(b[5])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_envelope_correlates_to_itself() {
        let env = MessageEnvelope::new(json!({"k": 1}));
        assert_eq!(env.correlation_id, env.message_id);
        assert!(env.causation_id.is_none());
        assert!(env.hops.is_empty());
    }

    #[test]
    fn caused_by_preserves_correlation_chain() {
        let root = MessageEnvelope::new(json!({}));
        let child = MessageEnvelope::caused_by(json!({}), &root);
        assert_eq!(child.correlation_id, root.correlation_id);
        assert_eq!(child.causation_id, Some(root.message_id));
        assert_ne!(child.message_id, root.message_id);
    }

    #[test]
    fn sequence_order_is_monotonic_for_v7_ids() {
        let a = MessageEnvelope::new(json!({}));
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = MessageEnvelope::new(json!({}));
        assert!(a.sequence_order() < b.sequence_order());
    }

    #[test]
    fn hops_survive_a_serde_round_trip() {
        let mut env = MessageEnvelope::new(json!({"x": true}));
        env.record_hop("billing", Some("orders.events"), "PreOutboxInline", None);
        let s = serde_json::to_string(&env).unwrap();
        let back: MessageEnvelope = serde_json::from_str(&s).unwrap();
        assert_eq!(back.hops.len(), 1);
        assert_eq!(back.hops[0].service_name, "billing");
        assert_eq!(back.hops[0].destination.as_deref(), Some("orders.events"));
    }
}
