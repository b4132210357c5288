//! Scenario: per-stream ordering and the failure cascade.
//!
//! # Invariants under test
//! - Claimed work for one stream arrives in `sequence_order`.
//! - After a failure at sequence `k`, nothing later in the stream is held
//!   by any instance, and the next poll re-offers only the failed message;
//!   the tail stays withheld until the head succeeds.
//! - Other streams are unaffected throughout.

use tokio_util::sync::CancellationToken;
use wh_schemas::{CompletionReport, Coordinator, FailureReport, MessageStatus};
use wh_testkit::fixtures;
use wh_testkit::MemoryCoordinator;

#[tokio::test]
async fn failure_withholds_the_tail_until_the_head_succeeds() -> anyhow::Result<()> {
    let coordinator = MemoryCoordinator::new();
    let cancel = CancellationToken::new();
    let instance = fixtures::instance("orders");

    // Three events for stream S, plus one bystander stream.
    let mut req = fixtures::request(&instance);
    let t0 = fixtures::event_inbox("S", "orders");
    let t1 = fixtures::event_inbox("S", "orders");
    let t2 = fixtures::event_inbox("S", "orders");
    let other = fixtures::event_inbox("other-stream", "orders");
    let (id0, id1, id2) = (t0.message_id, t1.message_id, t2.message_id);
    let other_id = other.message_id;
    req.new_inbox.extend([t0, t1, t2, other]);

    let batch = coordinator.process_work_batch(req, &cancel).await?;

    // All of S claimed, in order.
    let s_items: Vec<_> = batch
        .inbox
        .iter()
        .filter(|w| w.stream_id.as_deref() == Some("S"))
        .collect();
    assert_eq!(
        s_items.iter().map(|w| w.message_id).collect::<Vec<_>>(),
        vec![id0, id1, id2]
    );
    assert!(s_items.windows(2).all(|w| w[0].sequence_order <= w[1].sequence_order));

    // t0 succeeded, t1 failed mid-stream.
    let mut req = fixtures::request(&instance);
    req.inbox_completions.push(CompletionReport {
        message_id: id0,
        status: MessageStatus::STORED | MessageStatus::EVENT_STORED,
    });
    req.inbox_failures.push(FailureReport {
        message_id: id1,
        completed: MessageStatus::STORED | MessageStatus::EVENT_STORED,
        error: "receptor threw".to_string(),
        reason: "Unknown".to_string(),
    });
    let batch = coordinator.process_work_batch(req, &cancel).await?;

    // Invariant: the cascade released the tail — nothing after the failed
    // sequence is held by any instance.
    let tail = coordinator.inbox_row(id2).expect("tail row still present");
    assert!(tail.instance_id.is_none(), "cascade must release the tail");
    assert!(tail.lease_expiry.is_none());

    // The same poll re-offers only t1; t2 is withheld behind the failure.
    let reoffered: Vec<_> = batch
        .inbox
        .iter()
        .filter(|w| w.stream_id.as_deref() == Some("S"))
        .map(|w| w.message_id)
        .collect();
    assert_eq!(reoffered, vec![id1], "only the failed head retries");

    let failed = coordinator.inbox_row(id1).expect("failed row kept");
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.error.as_deref(), Some("receptor threw"));

    // Once t1 succeeds, t2 becomes claimable — in order.
    let mut req = fixtures::request(&instance);
    req.inbox_completions.push(CompletionReport {
        message_id: id1,
        status: MessageStatus::STORED | MessageStatus::EVENT_STORED,
    });
    let batch = coordinator.process_work_batch(req, &cancel).await?;
    let reoffered: Vec<_> = batch
        .inbox
        .iter()
        .filter(|w| w.stream_id.as_deref() == Some("S"))
        .map(|w| w.message_id)
        .collect();
    assert_eq!(reoffered, vec![id2]);

    // The bystander stream was claimable the whole time.
    assert!(coordinator.inbox_row(other_id).is_some());
    Ok(())
}

#[tokio::test]
async fn permanent_reasons_mark_failed_and_stop_retries() -> anyhow::Result<()> {
    let coordinator = MemoryCoordinator::new();
    let cancel = CancellationToken::new();
    let instance = fixtures::instance("orders");

    let message = fixtures::event_inbox("P", "orders");
    let id = message.message_id;
    let mut req = fixtures::request(&instance);
    req.new_inbox.push(message);
    coordinator.process_work_batch(req, &cancel).await?;

    let mut req = fixtures::request(&instance);
    req.inbox_failures.push(FailureReport {
        message_id: id,
        completed: MessageStatus::STORED,
        error: "payload does not decode".to_string(),
        reason: "SerializationError".to_string(),
    });
    let batch = coordinator.process_work_batch(req, &cancel).await?;

    let row = coordinator.inbox_row(id).expect("failed row kept");
    assert!(row.status.contains(MessageStatus::FAILED));
    assert_eq!(row.failure_reason.as_deref(), Some("SerializationError"));
    assert!(
        !batch.inbox.iter().any(|w| w.message_id == id),
        "permanently failed rows leave the claimable pool"
    );
    Ok(())
}

#[tokio::test]
async fn attempt_ceiling_escalates_to_max_attempts_exceeded() -> anyhow::Result<()> {
    let coordinator = MemoryCoordinator::new();
    let cancel = CancellationToken::new();
    let instance = fixtures::instance("orders");

    let message = fixtures::event_inbox("M", "orders");
    let id = message.message_id;
    let mut req = fixtures::request(&instance);
    req.new_inbox.push(message);
    coordinator.process_work_batch(req, &cancel).await?;

    // Transient failures up to the ceiling (test settings: 5 attempts).
    for attempt in 1..=5 {
        let mut req = fixtures::request(&instance);
        req.inbox_failures.push(FailureReport {
            message_id: id,
            completed: MessageStatus::STORED | MessageStatus::EVENT_STORED,
            error: format!("broker refused ({attempt})"),
            reason: "TransportException".to_string(),
        });
        coordinator.process_work_batch(req, &cancel).await?;
    }

    let row = coordinator.inbox_row(id).expect("row kept for operators");
    assert_eq!(row.attempts, 5);
    assert!(row.status.contains(MessageStatus::FAILED));
    assert_eq!(row.failure_reason.as_deref(), Some("MaxAttemptsExceeded"));
    Ok(())
}
