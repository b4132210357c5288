//! Scenario: the full pipeline over the in-memory backend.
//!
//! dispatcher → immediate strategy → coordinator → publisher loop →
//! transport → consumer loop → coordinator (dedup + claim) → ordered
//! stream processor → receptor → acknowledgement.
//!
//! Also exercises broker redelivery: the second delivery of the same
//! envelope is absorbed by dedup and never reaches the receptor again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use wh_dispatch::{Dispatcher, InboxProcessor, OutboundMessage, ReceptorRegistry};
use wh_lifecycle::{LifecycleInvoker, LifecycleRegistry};
use wh_schemas::WorkBatch;
use wh_strategies::{FlushStrategy, ImmediateStrategy, StrategyCore};
use wh_streams::StreamProcessor;
use wh_testkit::fixtures;
use wh_testkit::MemoryCoordinator;
use wh_transport::{InMemoryTransport, ConsumerLoop, PublisherLoop};

#[tokio::test]
async fn outbound_event_round_trips_to_a_local_receptor() -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let invoker = LifecycleInvoker::new(Arc::new(LifecycleRegistry::new()));
    let (batch_tx, mut batch_rx) = tokio::sync::mpsc::unbounded_channel::<WorkBatch>();

    let core = Arc::new(
        StrategyCore::new(
            Arc::clone(&coordinator) as _,
            invoker.clone(),
            fixtures::instance("orders"),
            fixtures::test_settings(),
            cancel.clone(),
        )
        .with_batch_sink(batch_tx),
    );
    let strategy: Arc<dyn FlushStrategy> = Arc::new(ImmediateStrategy::new(core));

    let transport = Arc::new(InMemoryTransport::new());
    let receptors = Arc::new(ReceptorRegistry::new());
    let dispatcher = Dispatcher::new(Arc::clone(&strategy), Arc::clone(&receptors), "orders");
    let publisher = PublisherLoop::new(
        Arc::clone(&transport) as _,
        Arc::clone(&strategy),
        cancel.clone(),
    )
    .with_lifecycle(invoker.clone());
    let inbox_processor = Arc::new(InboxProcessor::new(
        Arc::clone(&receptors),
        invoker.clone(),
        Arc::clone(&strategy),
    ));
    let stream_processor = StreamProcessor::new(true);

    // Receptor records every payload it sees.
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let receptor_runs = Arc::new(AtomicUsize::new(0));
    {
        let seen = Arc::clone(&seen);
        let runs = Arc::clone(&receptor_runs);
        receptors.register(
            "TestEvent",
            "record",
            Arc::new(move |_, payload: Value| {
                let seen = Arc::clone(&seen);
                let runs = Arc::clone(&runs);
                async move {
                    seen.lock().unwrap().push(payload);
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
                .boxed()
            }),
        );
    }

    // Consumer subscribed before anything is published.
    let consumer = ConsumerLoop::new(
        Arc::clone(&transport) as _,
        Arc::clone(&strategy),
        cancel.clone(),
    );
    let consumer_task = consumer.spawn("orders.events", "orders").await?;

    // The application sends one event.
    let receipt = dispatcher
        .send(OutboundMessage::event(
            "TestEvent",
            "orders.events",
            "order-77",
            json!({"total": 41}),
        ))
        .await?;

    // Drive claimed batches until the round trip completes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while receptor_runs.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
        let batch =
            match tokio::time::timeout(Duration::from_millis(100), batch_rx.recv()).await {
                Ok(Some(batch)) => batch,
                _ => continue,
            };

        if !batch.outbox.is_empty() {
            let outbox_only = WorkBatch {
                outbox: batch.outbox.clone(),
                ..WorkBatch::default()
            };
            publisher.publish_batch(outbox_only).await;
        }
        if !batch.inbox.is_empty() {
            let report = stream_processor
                .process(batch.inbox.clone(), inbox_processor.handler(), &cancel)
                .await;
            for completion in report.completions() {
                strategy.queue_inbox_completion(completion).await?;
            }
            for failure in report.failures() {
                strategy.queue_inbox_failure(failure).await?;
            }
        }
    }

    assert_eq!(receptor_runs.load(Ordering::SeqCst), 1, "receptor ran once");
    assert_eq!(seen.lock().unwrap()[0], json!({"total": 41}));

    // The published delivery carried the envelope; the event landed in the
    // log exactly once; dedup remembers the id.
    assert_eq!(transport.published().len(), 1);
    assert_eq!(coordinator.stream_events("order-77").len(), 1);
    assert!(coordinator.dedup_contains(receipt.message_id));

    // Broker redelivery of the same envelope: absorbed, no second run.
    let delivery = transport.published()[0].clone();
    transport.inject("orders.events", delivery.headers, delivery.envelope_json);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        receptor_runs.load(Ordering::SeqCst),
        1,
        "redelivery must not reach the receptor"
    );
    assert_eq!(coordinator.stream_events("order-77").len(), 1);

    cancel.cancel();
    let _ = consumer_task.await;
    Ok(())
}
