//! Builders for scenario tests.

use serde_json::json;
use uuid::Uuid;

use wh_schemas::{
    CoordinationSettings, MessageEnvelope, NewInboxMessage, NewOutboxMessage, ServiceInstance,
    WorkBatchRequest,
};

/// Settings scaled for tests: ten partitions, short leases.
pub fn test_settings() -> CoordinationSettings {
    CoordinationSettings {
        partition_count: 10,
        lease_seconds: 5,
        stale_instance_seconds: 11,
        claim_batch_size: 100,
        max_attempts: 5,
    }
}

pub fn instance(service_name: &str) -> ServiceInstance {
    ServiceInstance::new(service_name, "test-host", 1)
}

/// A heartbeat-shaped request carrying the test settings.
pub fn request(instance: &ServiceInstance) -> WorkBatchRequest {
    let mut req = WorkBatchRequest::heartbeat(instance.clone());
    req.settings = test_settings();
    req
}

pub fn event_outbox(stream: &str, destination: &str) -> NewOutboxMessage {
    let envelope = MessageEnvelope::new(json!({"stream": stream}));
    NewOutboxMessage {
        message_id: envelope.message_id,
        destination: destination.to_string(),
        event_type: "TestEvent".to_string(),
        envelope_type: "TestEvent".to_string(),
        envelope_json: serde_json::to_value(&envelope).unwrap_or(json!({})),
        metadata_json: json!({}),
        scope_json: None,
        stream_id: Some(stream.to_string()),
        is_event: true,
        scheduled_for: None,
    }
}

pub fn command_outbox(destination: &str) -> NewOutboxMessage {
    let envelope = MessageEnvelope::new(json!({}));
    NewOutboxMessage {
        message_id: envelope.message_id,
        destination: destination.to_string(),
        event_type: "TestCommand".to_string(),
        envelope_type: "TestCommand".to_string(),
        envelope_json: serde_json::to_value(&envelope).unwrap_or(json!({})),
        metadata_json: json!({}),
        scope_json: None,
        stream_id: None,
        is_event: false,
        scheduled_for: None,
    }
}

pub fn event_inbox(stream: &str, handler: &str) -> NewInboxMessage {
    let envelope = MessageEnvelope::new(json!({"stream": stream}));
    NewInboxMessage {
        message_id: envelope.message_id,
        handler_name: handler.to_string(),
        event_type: "TestEvent".to_string(),
        envelope_type: "TestEvent".to_string(),
        envelope_json: serde_json::to_value(&envelope).unwrap_or(json!({})),
        metadata_json: json!({}),
        scope_json: None,
        stream_id: Some(stream.to_string()),
        is_event: true,
    }
}

/// An inbox message with a fixed id, for dedup scenarios.
pub fn event_inbox_with_id(message_id: Uuid, stream: &str, handler: &str) -> NewInboxMessage {
    let mut message = event_inbox(stream, handler);
    message.message_id = message_id;
    if let Some(obj) = message.envelope_json.as_object_mut() {
        obj.insert("message_id".to_string(), json!(message_id.to_string()));
    }
    message
}
