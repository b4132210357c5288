//! Replays events into projections and produces checkpoint reports.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use wh_lifecycle::{LifecycleContext, LifecycleInvoker, LifecycleStage};
use wh_schemas::{
    EventStoreReader, PerspectiveCompletion, PerspectiveFailure, PerspectiveWork,
};

use crate::perspective::Perspective;
use crate::store::PerspectiveStateStore;

#[derive(Debug)]
pub enum PerspectiveOutcome {
    Completed(PerspectiveCompletion),
    Failed(PerspectiveFailure),
    /// Unknown projection or nothing new to apply.
    NoOp,
}

pub struct PerspectiveRunner {
    reader: Arc<dyn EventStoreReader>,
    store: Arc<dyn PerspectiveStateStore>,
    invoker: LifecycleInvoker,
    perspectives: HashMap<String, Arc<dyn Perspective>>,
    /// Events read per page while catching up.
    page_size: i64,
}

impl PerspectiveRunner {
    pub fn new(
        reader: Arc<dyn EventStoreReader>,
        store: Arc<dyn PerspectiveStateStore>,
        invoker: LifecycleInvoker,
    ) -> Self {
        Self {
            reader,
            store,
            invoker,
            perspectives: HashMap::new(),
            page_size: 256,
        }
    }

    pub fn register(&mut self, perspective: Arc<dyn Perspective>) {
        self.perspectives
            .insert(perspective.name().to_string(), perspective);
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size;
        self
    }

    /// Catch one projection up on one stream. Reads events after the
    /// checkpoint (exclusive), folds them, persists the state, and returns
    /// the report the caller queues back to the coordinator.
    pub async fn run(
        &self,
        work: &PerspectiveWork,
        cancel: &CancellationToken,
    ) -> Result<PerspectiveOutcome> {
        let Some(perspective) = self.perspectives.get(&work.perspective_name) else {
            tracing::warn!(
                perspective = %work.perspective_name,
                "perspective work for an unregistered projection"
            );
            return Ok(PerspectiveOutcome::NoOp);
        };

        let ctx = LifecycleContext::new(
            LifecycleStage::PrePerspectiveAsync,
            &work.perspective_name,
        )
        .with_stream(work.stream_id.clone())
        .with_perspective(work.perspective_name.clone());

        self.invoker.invoke_async(&ctx);
        if let Err(err) = self
            .invoker
            .invoke_inline(&ctx.at_stage(LifecycleStage::PrePerspectiveInline))
            .await
        {
            return Ok(PerspectiveOutcome::Failed(PerspectiveFailure {
                stream_id: work.stream_id.clone(),
                perspective_name: work.perspective_name.clone(),
                failed_event_id: None,
                error: format!("inline lifecycle handler refused: {err:#}"),
            }));
        }

        let state_id = perspective.state_id(&work.stream_id);
        let mut state = self
            .store
            .load(perspective.name(), &state_id)
            .await?
            .unwrap_or(serde_json::Value::Null);

        let mut cursor: Option<Uuid> = work.last_event_id;
        let mut applied_any = false;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let events = self
                .reader
                .events_after(&work.stream_id, cursor, self.page_size)
                .await?;
            if events.is_empty() {
                break;
            }

            for event in &events {
                match perspective.apply(state.clone(), event) {
                    Ok(next) => {
                        state = next;
                        cursor = Some(event.event_id);
                        applied_any = true;
                    }
                    Err(err) => {
                        // Persist what folded cleanly before the bad event,
                        // then report exactly where apply threw.
                        if applied_any {
                            let scope = perspective.scope(&state);
                            self.store
                                .save(perspective.name(), &state_id, &state, scope.as_ref())
                                .await?;
                        }
                        return Ok(PerspectiveOutcome::Failed(PerspectiveFailure {
                            stream_id: work.stream_id.clone(),
                            perspective_name: work.perspective_name.clone(),
                            failed_event_id: Some(event.event_id),
                            error: format!("{err:#}"),
                        }));
                    }
                }
            }
        }

        let outcome = match (applied_any, cursor) {
            (true, Some(last_event_id)) => {
                let scope = perspective.scope(&state);
                self.store
                    .save(perspective.name(), &state_id, &state, scope.as_ref())
                    .await?;
                PerspectiveOutcome::Completed(PerspectiveCompletion {
                    stream_id: work.stream_id.clone(),
                    perspective_name: work.perspective_name.clone(),
                    last_event_id,
                })
            }
            _ => PerspectiveOutcome::NoOp,
        };

        let post = ctx.at_stage(LifecycleStage::PostPerspectiveAsync);
        self.invoker.invoke_async(&post);
        self.invoker
            .invoke_inline(&post.at_stage(LifecycleStage::PostPerspectiveInline))
            .await?;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use wh_lifecycle::LifecycleRegistry;
    use wh_schemas::StoredEvent;

    use crate::store::MemoryStateStore;

    struct FixedEvents {
        events: Vec<StoredEvent>,
    }

    #[async_trait]
    impl EventStoreReader for FixedEvents {
        async fn events_after(
            &self,
            stream_id: &str,
            after: Option<Uuid>,
            limit: i64,
        ) -> Result<Vec<StoredEvent>> {
            let mut out: Vec<StoredEvent> = self
                .events
                .iter()
                .filter(|e| e.stream_id == stream_id)
                .filter(|e| after.map_or(true, |a| e.event_id > a))
                .cloned()
                .collect();
            out.sort_by_key(|e| e.version);
            out.truncate(limit as usize);
            Ok(out)
        }
    }

    fn event(stream: &str, version: i64, amount: i64) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::now_v7(),
            stream_id: stream.to_string(),
            version,
            event_type: "AmountAdded".into(),
            event_data: json!({"amount": amount}),
            metadata: Value::Null,
            scope: None,
            created_at: chrono::Utc::now(),
        }
    }

    struct Totals;

    impl Perspective for Totals {
        fn name(&self) -> &str {
            "totals"
        }

        fn apply(&self, state: Value, event: &StoredEvent) -> Result<Value> {
            let amount = event
                .event_data
                .get("amount")
                .and_then(Value::as_i64)
                .ok_or_else(|| anyhow::anyhow!("amount missing"))?;
            let current = state.get("total").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!({"total": current + amount}))
        }
    }

    fn runner_with(events: Vec<StoredEvent>) -> (PerspectiveRunner, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let mut runner = PerspectiveRunner::new(
            Arc::new(FixedEvents { events }),
            Arc::clone(&store) as Arc<dyn PerspectiveStateStore>,
            LifecycleInvoker::new(Arc::new(LifecycleRegistry::new())),
        );
        runner.register(Arc::new(Totals));
        (runner, store)
    }

    #[tokio::test]
    async fn catches_up_from_scratch_and_reports_last_event() {
        let events = vec![event("s", 0, 10), event("s", 1, 5), event("s", 2, 7)];
        let last = events[2].event_id;
        let (runner, store) = runner_with(events);

        let work = PerspectiveWork {
            stream_id: "s".into(),
            perspective_name: "totals".into(),
            last_event_id: None,
        };
        let outcome = runner.run(&work, &CancellationToken::new()).await.unwrap();

        match outcome {
            PerspectiveOutcome::Completed(c) => assert_eq!(c.last_event_id, last),
            other => panic!("expected completion, got {other:?}"),
        }
        let state = store.snapshot();
        assert_eq!(state[&("totals".to_string(), "s".to_string())], json!({"total": 22}));
    }

    #[tokio::test]
    async fn resumes_after_checkpoint_exclusive() {
        let events = vec![event("s", 0, 10), event("s", 1, 5)];
        let checkpoint = events[0].event_id;
        let (runner, store) = runner_with(events);

        let work = PerspectiveWork {
            stream_id: "s".into(),
            perspective_name: "totals".into(),
            last_event_id: Some(checkpoint),
        };
        runner.run(&work, &CancellationToken::new()).await.unwrap();

        // Only the second event folded: checkpoint is exclusive.
        let state = store.snapshot();
        assert_eq!(state[&("totals".to_string(), "s".to_string())], json!({"total": 5}));
    }

    #[tokio::test]
    async fn apply_error_reports_the_failing_event() {
        let good = event("s", 0, 3);
        let mut bad = event("s", 1, 0);
        bad.event_data = json!({});
        let bad_id = bad.event_id;
        let (runner, store) = runner_with(vec![good, bad]);

        let work = PerspectiveWork {
            stream_id: "s".into(),
            perspective_name: "totals".into(),
            last_event_id: None,
        };
        let outcome = runner.run(&work, &CancellationToken::new()).await.unwrap();

        match outcome {
            PerspectiveOutcome::Failed(f) => {
                assert_eq!(f.failed_event_id, Some(bad_id));
                assert!(f.error.contains("amount missing"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // The clean prefix was still persisted.
        let state = store.snapshot();
        assert_eq!(state[&("totals".to_string(), "s".to_string())], json!({"total": 3}));
    }

    #[tokio::test]
    async fn unknown_perspective_is_a_noop() {
        let (runner, _) = runner_with(vec![]);
        let work = PerspectiveWork {
            stream_id: "s".into(),
            perspective_name: "nope".into(),
            last_event_id: None,
        };
        assert!(matches!(
            runner.run(&work, &CancellationToken::new()).await.unwrap(),
            PerspectiveOutcome::NoOp
        ));
    }
}
