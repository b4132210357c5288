//! Shared flush discipline.
//!
//! Every strategy runs the same pipeline around the coordinator call:
//! snapshot the unit, fire `PreDistribute` stages (async detached, inline
//! awaited), call the coordinator, clear buffers only once it returns, then
//! fire `PostDistribute` stages. A failed call restores the unit in order.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use wh_lifecycle::{LifecycleContext, LifecycleInvoker, LifecycleStage, MessageSource};
use wh_schemas::{
    BatchFlags, CompletionReport, Coordinator, CoordinationSettings, FailureReport,
    NewInboxMessage, NewOutboxMessage, PerspectiveCompletion, PerspectiveFailure, ReadinessProbe,
    ReceptorCompletion, ServiceInstance, WorkBatch,
};

use crate::unit::UnitOfWork;

pub struct StrategyCore {
    coordinator: Arc<dyn Coordinator>,
    invoker: LifecycleInvoker,
    instance: ServiceInstance,
    settings: CoordinationSettings,
    buffers: Mutex<UnitOfWork>,
    cancel: CancellationToken,
    db_probe: Option<Arc<dyn ReadinessProbe>>,
    batch_sink: Option<mpsc::UnboundedSender<WorkBatch>>,
}

impl StrategyCore {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        invoker: LifecycleInvoker,
        instance: ServiceInstance,
        settings: CoordinationSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            invoker,
            instance,
            settings,
            buffers: Mutex::new(UnitOfWork::default()),
            cancel,
            db_probe: None,
            batch_sink: None,
        }
    }

    /// Skip coordinator calls (and keep buffering) while the database is
    /// not ready.
    pub fn with_db_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.db_probe = Some(probe);
        self
    }

    /// Where internally-triggered flushes (Immediate per-call, Interval
    /// ticks) deliver claimed work.
    pub fn with_batch_sink(mut self, sink: mpsc::UnboundedSender<WorkBatch>) -> Self {
        self.batch_sink = Some(sink);
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    // -- queueing ----------------------------------------------------------

    fn lock(&self) -> std::sync::MutexGuard<'_, UnitOfWork> {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn queue_outbox(&self, message: NewOutboxMessage) {
        let ctx = LifecycleContext::new(LifecycleStage::ImmediateAsync, &message.envelope_type)
            .with_message(message.message_id, MessageSource::Outbox);
        self.invoker.invoke_async(&ctx);
        self.lock().new_outbox.push(message);
    }

    pub fn queue_inbox(&self, message: NewInboxMessage) {
        let ctx = LifecycleContext::new(LifecycleStage::ImmediateAsync, &message.envelope_type)
            .with_message(message.message_id, MessageSource::Inbox);
        self.invoker.invoke_async(&ctx);
        self.lock().new_inbox.push(message);
    }

    pub fn queue_outbox_completion(&self, completion: CompletionReport) {
        self.lock().outbox_completions.push(completion);
    }

    pub fn queue_inbox_completion(&self, completion: CompletionReport) {
        self.lock().inbox_completions.push(completion);
    }

    pub fn queue_outbox_failure(&self, failure: FailureReport) {
        self.lock().outbox_failures.push(failure);
    }

    pub fn queue_inbox_failure(&self, failure: FailureReport) {
        self.lock().inbox_failures.push(failure);
    }

    pub fn queue_receptor_completion(&self, completion: ReceptorCompletion) {
        self.lock().receptor_completions.push(completion);
    }

    pub fn queue_perspective_completion(&self, completion: PerspectiveCompletion) {
        self.lock().perspective_completions.push(completion);
    }

    pub fn queue_perspective_failure(&self, failure: PerspectiveFailure) {
        self.lock().perspective_failures.push(failure);
    }

    pub fn queue_renew_outbox(&self, ids: impl IntoIterator<Item = uuid::Uuid>) {
        self.lock().renew_outbox.extend(ids);
    }

    pub fn queue_renew_inbox(&self, ids: impl IntoIterator<Item = uuid::Uuid>) {
        self.lock().renew_inbox.extend(ids);
    }

    pub fn pending_len(&self) -> usize {
        self.lock().len()
    }

    /// Throw away everything buffered. Returns how many items were
    /// discarded. Used by scope teardown when a unit is abandoned.
    pub fn discard_pending(&self) -> usize {
        std::mem::take(&mut *self.lock()).len()
    }

    // -- flushing ----------------------------------------------------------

    /// One lifecycle context per queued message; the collection is a copy,
    /// so async handlers race freely with further queueing.
    fn distribution_contexts(unit: &UnitOfWork) -> Vec<LifecycleContext> {
        let mut contexts = Vec::with_capacity(unit.new_outbox.len() + unit.new_inbox.len());
        for m in &unit.new_outbox {
            let mut ctx =
                LifecycleContext::new(LifecycleStage::PreDistributeAsync, &m.envelope_type)
                    .with_message(m.message_id, MessageSource::Outbox);
            if let Some(stream) = &m.stream_id {
                ctx = ctx.with_stream(stream.clone());
            }
            contexts.push(ctx);
        }
        for m in &unit.new_inbox {
            let mut ctx =
                LifecycleContext::new(LifecycleStage::PreDistributeAsync, &m.envelope_type)
                    .with_message(m.message_id, MessageSource::Inbox);
            if let Some(stream) = &m.stream_id {
                ctx = ctx.with_stream(stream.clone());
            }
            contexts.push(ctx);
        }
        contexts
    }

    fn restore(&self, unit: UnitOfWork) {
        self.lock().restore_front(unit);
    }

    pub async fn flush(&self, flags: BatchFlags) -> Result<WorkBatch> {
        if let Some(probe) = &self.db_probe {
            if !probe.is_ready().await {
                tracing::debug!("database not ready; unit stays buffered");
                return Ok(WorkBatch::default());
            }
        }

        let unit = std::mem::take(&mut *self.lock());
        let contexts = Self::distribution_contexts(&unit);

        for ctx in &contexts {
            self.invoker.invoke_async(&ctx.at_stage(LifecycleStage::PreDistributeAsync));
        }
        for ctx in &contexts {
            if let Err(err) = self
                .invoker
                .invoke_inline(&ctx.at_stage(LifecycleStage::PreDistributeInline))
                .await
            {
                self.restore(unit);
                return Err(err);
            }
        }
        for ctx in &contexts {
            self.invoker.invoke_async(&ctx.at_stage(LifecycleStage::DistributeAsync));
        }

        let request =
            unit.clone()
                .into_request(self.instance.clone(), self.settings.clone(), flags);

        match self.coordinator.process_work_batch(request, &self.cancel).await {
            Ok(batch) => {
                for ctx in &contexts {
                    self.invoker
                        .invoke_async(&ctx.at_stage(LifecycleStage::PostDistributeAsync));
                }
                for ctx in &contexts {
                    self.invoker
                        .invoke_inline(&ctx.at_stage(LifecycleStage::PostDistributeInline))
                        .await?;
                }
                Ok(batch)
            }
            Err(err) => {
                self.restore(unit);
                Err(err)
            }
        }
    }

    /// Hand claimed work to the configured sink. Dropping a batch is safe
    /// (leases expire and the work is re-claimed) but wasteful, so the
    /// unconfigured case is logged.
    pub fn deliver(&self, batch: WorkBatch) {
        if batch.is_empty() {
            return;
        }
        match &self.batch_sink {
            Some(sink) => {
                if sink.send(batch).is_err() {
                    tracing::warn!("batch sink closed; claimed work will be re-claimed on lease expiry");
                }
            }
            None => {
                tracing::warn!(
                    outbox = batch.outbox.len(),
                    inbox = batch.inbox.len(),
                    "no batch sink configured; claimed work will be re-claimed on lease expiry"
                );
            }
        }
    }
}
