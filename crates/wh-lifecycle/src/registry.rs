//! The `(message_type, stage)` → handlers table.
//!
//! Populated by explicit registration only — build-time generated code or
//! user calls. Registration is dynamic so tests can attach synchronization
//! handlers at runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;

use crate::stage::{LifecycleContext, LifecycleStage};

pub type LifecycleHandler =
    Arc<dyn Fn(LifecycleContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

struct Registration {
    id: RegistrationId,
    handler: LifecycleHandler,
}

#[derive(Default)]
pub struct LifecycleRegistry {
    next_id: AtomicU64,
    inner: RwLock<HashMap<(String, LifecycleStage), Vec<Registration>>>,
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `(message_type, stage)`. Handlers fire in
    /// registration order. Returns an id for `unregister`.
    pub fn register(
        &self,
        message_type: impl Into<String>,
        stage: LifecycleStage,
        handler: LifecycleHandler,
    ) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .entry((message_type.into(), stage))
            .or_default()
            .push(Registration { id, handler });
        id
    }

    /// Remove one registration. Returns whether anything was removed.
    pub fn unregister(&self, id: RegistrationId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        inner.retain(|_, regs| {
            let before = regs.len();
            regs.retain(|r| r.id != id);
            removed |= regs.len() != before;
            !regs.is_empty()
        });
        removed
    }

    /// Snapshot of the handlers for `(message_type, stage)`, in registration
    /// order. A snapshot, not a borrow: callers may register or unregister
    /// concurrently while handlers run.
    pub fn handlers(&self, message_type: &str, stage: LifecycleStage) -> Vec<LifecycleHandler> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .get(&(message_type.to_string(), stage))
            .map(|regs| regs.iter().map(|r| Arc::clone(&r.handler)).collect())
            .unwrap_or_default()
    }

    /// Whether any handler is registered for the pair at all; lets hot
    /// paths skip context construction entirely.
    pub fn has_handlers(&self, message_type: &str, stage: LifecycleStage) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .get(&(message_type.to_string(), stage))
            .is_some_and(|regs| !regs.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn noop() -> LifecycleHandler {
        Arc::new(|_| async { Ok(()) }.boxed())
    }

    #[tokio::test]
    async fn handlers_returned_in_registration_order() {
        let reg = LifecycleRegistry::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            reg.register(
                "OrderPlaced",
                LifecycleStage::PreOutboxInline,
                Arc::new(move |_| {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().unwrap().push(tag);
                        Ok(())
                    }
                    .boxed()
                }),
            );
        }

        let handlers = reg.handlers("OrderPlaced", LifecycleStage::PreOutboxInline);
        assert_eq!(handlers.len(), 3);

        let ctx = LifecycleContext::new(LifecycleStage::PreOutboxInline, "OrderPlaced");
        for h in &handlers {
            h(ctx.clone()).await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn unregister_removes_only_that_handler() {
        let reg = LifecycleRegistry::new();
        let a = reg.register("T", LifecycleStage::PreInboxInline, noop());
        let _b = reg.register("T", LifecycleStage::PreInboxInline, noop());

        assert!(reg.unregister(a));
        assert!(!reg.unregister(a));
        assert_eq!(reg.handlers("T", LifecycleStage::PreInboxInline).len(), 1);
    }

    #[test]
    fn stages_are_isolated() {
        let reg = LifecycleRegistry::new();
        reg.register("T", LifecycleStage::PreInboxInline, noop());
        assert!(reg.handlers("T", LifecycleStage::PostInboxInline).is_empty());
        assert!(reg.handlers("U", LifecycleStage::PreInboxInline).is_empty());
        assert!(reg.has_handlers("T", LifecycleStage::PreInboxInline));
        assert!(!reg.has_handlers("T", LifecycleStage::PostInboxInline));
    }
}
