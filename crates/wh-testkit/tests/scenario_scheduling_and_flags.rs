//! Scenario: scheduled delivery and batch flags.
//!
//! # Invariants under test
//! - A message scheduled into the future is withheld from claiming until
//!   its time arrives.
//! - `SKIP_CLAIM` stores and acknowledges without handing out work.
//! - `DEBUG_MODE` retains terminal rows with their status preserved.

use chrono::Duration;
use tokio_util::sync::CancellationToken;
use wh_schemas::{BatchFlags, CompletionReport, Coordinator, MessageStatus};
use wh_testkit::fixtures;
use wh_testkit::MemoryCoordinator;

#[tokio::test]
async fn scheduled_messages_wait_for_their_time() -> anyhow::Result<()> {
    let coordinator = MemoryCoordinator::new();
    let cancel = CancellationToken::new();
    let instance = fixtures::instance("orders");

    let mut message = fixtures::command_outbox("orders.commands");
    message.scheduled_for = Some(chrono::Utc::now() + Duration::seconds(3600));
    let id = message.message_id;

    let mut req = fixtures::request(&instance);
    req.new_outbox.push(message);
    let batch = coordinator.process_work_batch(req, &cancel).await?;
    assert!(
        !batch.outbox.iter().any(|w| w.message_id == id),
        "future-scheduled work is withheld"
    );

    // Once the clock passes the schedule, the same instance claims it.
    coordinator.advance(3601);
    let batch = coordinator
        .process_work_batch(fixtures::request(&instance), &cancel)
        .await?;
    assert!(batch.outbox.iter().any(|w| w.message_id == id));
    Ok(())
}

#[tokio::test]
async fn skip_claim_stores_without_handing_out_work() -> anyhow::Result<()> {
    let coordinator = MemoryCoordinator::new();
    let cancel = CancellationToken::new();
    let instance = fixtures::instance("orders");

    let message = fixtures::event_outbox("S", "orders.events");
    let id = message.message_id;

    let mut req = fixtures::request(&instance);
    req.flags = BatchFlags::SKIP_CLAIM;
    req.new_outbox.push(message);
    let batch = coordinator.process_work_batch(req, &cancel).await?;

    assert!(batch.is_empty(), "skip-claim returns no work");
    let row = coordinator.outbox_row(id).expect("stored anyway");
    assert!(row.instance_id.is_none());
    assert_eq!(coordinator.stream_events("S").len(), 1, "event still appended");

    // A normal call afterwards claims it.
    let batch = coordinator
        .process_work_batch(fixtures::request(&instance), &cancel)
        .await?;
    assert!(batch.outbox.iter().any(|w| w.message_id == id));
    Ok(())
}

#[tokio::test]
async fn debug_mode_retains_terminal_rows_with_status() -> anyhow::Result<()> {
    let coordinator = MemoryCoordinator::new();
    let cancel = CancellationToken::new();
    let instance = fixtures::instance("orders");

    let message = fixtures::event_outbox("D", "orders.events");
    let id = message.message_id;
    let mut req = fixtures::request(&instance);
    req.new_outbox.push(message);
    coordinator.process_work_batch(req, &cancel).await?;

    let mut req = fixtures::request(&instance);
    req.flags = BatchFlags::DEBUG_MODE;
    req.outbox_completions.push(CompletionReport {
        message_id: id,
        status: MessageStatus::PUBLISHED,
    });
    coordinator.process_work_batch(req, &cancel).await?;

    let row = coordinator.outbox_row(id).expect("debug mode keeps the row");
    assert!(row.status.contains(MessageStatus::STORED));
    assert!(row.status.contains(MessageStatus::EVENT_STORED));
    assert!(row.status.contains(MessageStatus::PUBLISHED));

    // Outside debug mode the same completion would have deleted it; a
    // fresh claim pass must not re-offer the published row either way.
    let batch = coordinator
        .process_work_batch(fixtures::request(&instance), &cancel)
        .await?;
    assert!(!batch.outbox.iter().any(|w| w.message_id == id));
    Ok(())
}
