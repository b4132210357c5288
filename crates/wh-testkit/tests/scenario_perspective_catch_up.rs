//! Scenario: a new perspective catches up on an existing stream.
//!
//! A projection registered after three events were appended receives a
//! work item with no checkpoint, folds the history, and the reported
//! completion lands in the checkpoint table so the work is not offered
//! again.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use wh_lifecycle::{LifecycleInvoker, LifecycleRegistry};
use wh_perspectives::{
    MemoryStateStore, Perspective, PerspectiveOutcome, PerspectiveRunner, PerspectiveStateStore,
};
use wh_schemas::{Coordinator, EventStoreReader, StoredEvent};
use wh_testkit::fixtures;
use wh_testkit::MemoryCoordinator;

struct EventCount;

impl Perspective for EventCount {
    fn name(&self) -> &str {
        "event_count"
    }

    fn apply(&self, state: Value, _event: &StoredEvent) -> anyhow::Result<Value> {
        let n = state.get("count").and_then(Value::as_i64).unwrap_or(0);
        Ok(json!({"count": n + 1}))
    }
}

#[tokio::test]
async fn new_perspective_replays_history_and_checkpoints() -> anyhow::Result<()> {
    let coordinator = Arc::new(MemoryCoordinator::new());
    let cancel = CancellationToken::new();
    let instance = fixtures::instance("orders");

    // Three historical events on stream S.
    for _ in 0..3 {
        let mut req = fixtures::request(&instance);
        req.new_outbox.push(fixtures::event_outbox("S", "orders.events"));
        coordinator.process_work_batch(req, &cancel).await?;
    }
    let last_event = coordinator.stream_events("S").last().unwrap().event_id;

    // Register the projection afterwards: one checkpoint per existing
    // stream, cursor unset.
    assert_eq!(coordinator.register_perspective("event_count"), 1);

    // The next poll hands out the catch-up work with no checkpoint.
    let batch = coordinator
        .process_work_batch(fixtures::request(&instance), &cancel)
        .await?;
    let work = batch
        .perspectives
        .iter()
        .find(|w| w.perspective_name == "event_count")
        .expect("catch-up work offered");
    assert_eq!(work.stream_id, "S");
    assert_eq!(work.last_event_id, None);

    // Run the projection and report the checkpoint out-of-band.
    let store = Arc::new(MemoryStateStore::new());
    let mut runner = PerspectiveRunner::new(
        Arc::clone(&coordinator) as Arc<dyn EventStoreReader>,
        Arc::clone(&store) as Arc<dyn PerspectiveStateStore>,
        LifecycleInvoker::new(Arc::new(LifecycleRegistry::new())),
    );
    runner.register(Arc::new(EventCount));

    match runner.run(work, &cancel).await? {
        PerspectiveOutcome::Completed(completion) => {
            assert_eq!(completion.last_event_id, last_event);
            coordinator.report_perspective_completion(&completion).await?;
        }
        other => panic!("expected completion, got {other:?}"),
    }

    // The fold saw all three events.
    let state = store.load("event_count", "S").await?.unwrap();
    assert_eq!(state, json!({"count": 3}));

    // Checkpoint persisted; caught-up work is not offered again.
    let checkpoint = coordinator.checkpoint("S", "event_count").unwrap();
    assert_eq!(checkpoint.last_event_id, Some(last_event));
    let batch = coordinator
        .process_work_batch(fixtures::request(&instance), &cancel)
        .await?;
    assert!(batch.perspectives.is_empty());

    // A fourth event re-opens exactly one work item past the checkpoint.
    let mut req = fixtures::request(&instance);
    req.new_outbox.push(fixtures::event_outbox("S", "orders.events"));
    let batch = coordinator.process_work_batch(req, &cancel).await?;
    let work = batch
        .perspectives
        .iter()
        .find(|w| w.perspective_name == "event_count")
        .expect("incremental work offered");
    assert_eq!(work.last_event_id, Some(last_event));
    Ok(())
}

#[tokio::test]
async fn failed_projection_is_parked_until_reactivated() -> anyhow::Result<()> {
    let coordinator = Arc::new(MemoryCoordinator::new());
    let cancel = CancellationToken::new();
    let instance = fixtures::instance("orders");

    let mut req = fixtures::request(&instance);
    req.new_outbox.push(fixtures::event_outbox("S", "orders.events"));
    coordinator.process_work_batch(req, &cancel).await?;
    coordinator.register_perspective("event_count");

    let failed_event = coordinator.stream_events("S")[0].event_id;
    coordinator
        .report_perspective_failure(&wh_schemas::PerspectiveFailure {
            stream_id: "S".to_string(),
            perspective_name: "event_count".to_string(),
            failed_event_id: Some(failed_event),
            error: "apply threw".to_string(),
        })
        .await?;

    let checkpoint = coordinator.checkpoint("S", "event_count").unwrap();
    assert_eq!(checkpoint.status, "failed");
    assert!(checkpoint.error.as_deref().unwrap_or("").contains("apply threw"));

    // Parked checkpoints are withheld from the work lists.
    let batch = coordinator
        .process_work_batch(fixtures::request(&instance), &cancel)
        .await?;
    assert!(batch.perspectives.is_empty());
    Ok(())
}
