//! Fires registered handlers at a stage.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::registry::LifecycleRegistry;
use crate::stage::LifecycleContext;

#[derive(Clone)]
pub struct LifecycleInvoker {
    registry: Arc<LifecycleRegistry>,
}

impl LifecycleInvoker {
    pub fn new(registry: Arc<LifecycleRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<LifecycleRegistry> {
        &self.registry
    }

    /// Await every inline handler in registration order. The first failure
    /// propagates and constitutes a lifecycle failure of the current unit.
    pub async fn invoke_inline(&self, ctx: &LifecycleContext) -> Result<()> {
        debug_assert!(ctx.stage.is_inline());
        for handler in self.registry.handlers(&ctx.message_type, ctx.stage) {
            handler(ctx.clone()).await.with_context(|| {
                format!(
                    "inline lifecycle handler failed at {} for {}",
                    ctx.stage, ctx.message_type
                )
            })?;
        }
        Ok(())
    }

    /// Fire-and-forget: handlers run on a detached task over a snapshot of
    /// the registration list. Errors are logged and never surfaced.
    pub fn invoke_async(&self, ctx: &LifecycleContext) {
        let handlers = self.registry.handlers(&ctx.message_type, ctx.stage);
        if handlers.is_empty() {
            return;
        }
        let ctx = ctx.clone();
        tokio::spawn(async move {
            for handler in handlers {
                if let Err(err) = handler(ctx.clone()).await {
                    tracing::warn!(
                        stage = %ctx.stage,
                        message_type = %ctx.message_type,
                        error = %err,
                        "async lifecycle handler failed"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LifecycleHandler;
    use crate::stage::LifecycleStage;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: Arc<AtomicUsize>) -> LifecycleHandler {
        Arc::new(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn inline_failure_propagates_and_stops_later_handlers() {
        let registry = Arc::new(LifecycleRegistry::new());
        let invoker = LifecycleInvoker::new(Arc::clone(&registry));
        let ran_after = Arc::new(AtomicUsize::new(0));

        registry.register(
            "T",
            LifecycleStage::PreOutboxInline,
            Arc::new(|_| async { anyhow::bail!("handler refused") }.boxed()),
        );
        registry.register(
            "T",
            LifecycleStage::PreOutboxInline,
            counting(Arc::clone(&ran_after)),
        );

        let ctx = LifecycleContext::new(LifecycleStage::PreOutboxInline, "T");
        let err = invoker.invoke_inline(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("PreOutboxInline"));
        assert_eq!(ran_after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn async_failure_is_swallowed() {
        let registry = Arc::new(LifecycleRegistry::new());
        let invoker = LifecycleInvoker::new(Arc::clone(&registry));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = std::sync::Mutex::new(Some(tx));

        registry.register(
            "T",
            LifecycleStage::ImmediateAsync,
            Arc::new(move |_| {
                let tx = tx.lock().unwrap().take();
                async move {
                    if let Some(tx) = tx {
                        let _ = tx.send(());
                    }
                    anyhow::bail!("async handlers may fail freely")
                }
                .boxed()
            }),
        );

        let ctx = LifecycleContext::new(LifecycleStage::ImmediateAsync, "T");
        invoker.invoke_async(&ctx);

        // The handler ran (and failed) without surfacing anything.
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn all_inline_handlers_run_on_success() {
        let registry = Arc::new(LifecycleRegistry::new());
        let invoker = LifecycleInvoker::new(Arc::clone(&registry));
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            registry.register("T", LifecycleStage::PostInboxInline, counting(Arc::clone(&count)));
        }

        let ctx = LifecycleContext::new(LifecycleStage::PostInboxInline, "T");
        invoker.invoke_inline(&ctx).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
