//! Explicit receptor registration.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

/// Context handed to a receptor invocation.
#[derive(Debug, Clone)]
pub struct ReceptorContext {
    pub message_id: Uuid,
    pub correlation_id: Uuid,
    pub envelope_type: String,
    pub attempt: i32,
}

/// An application handler. Returns `Some(value)` for request/reply paths,
/// `None` for fire-and-forget.
pub type Receptor =
    Arc<dyn Fn(ReceptorContext, Value) -> BoxFuture<'static, anyhow::Result<Option<Value>>> + Send + Sync>;

#[derive(Clone)]
pub struct NamedReceptor {
    pub name: String,
    pub receptor: Receptor,
}

/// `envelope_type` → receptors, in registration order.
#[derive(Default)]
pub struct ReceptorRegistry {
    inner: RwLock<HashMap<String, Vec<NamedReceptor>>>,
}

impl ReceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        envelope_type: impl Into<String>,
        name: impl Into<String>,
        receptor: Receptor,
    ) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.entry(envelope_type.into()).or_default().push(NamedReceptor {
            name: name.into(),
            receptor,
        });
    }

    pub fn unregister(&self, envelope_type: &str, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(receptors) = inner.get_mut(envelope_type) else {
            return false;
        };
        let before = receptors.len();
        receptors.retain(|r| r.name != name);
        let removed = receptors.len() != before;
        if receptors.is_empty() {
            inner.remove(envelope_type);
        }
        removed
    }

    /// Snapshot, registration order preserved.
    pub fn receptors_for(&self, envelope_type: &str) -> Vec<NamedReceptor> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(envelope_type).cloned().unwrap_or_default()
    }

    pub fn has_receptors(&self, envelope_type: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(envelope_type).is_some_and(|r| !r.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn echo() -> Receptor {
        Arc::new(|_, payload| async move { Ok(Some(payload)) }.boxed())
    }

    #[test]
    fn registration_order_is_preserved() {
        let reg = ReceptorRegistry::new();
        reg.register("T", "first", echo());
        reg.register("T", "second", echo());

        let receptors = reg.receptors_for("T");
        assert_eq!(receptors.len(), 2);
        assert_eq!(receptors[0].name, "first");
        assert_eq!(receptors[1].name, "second");
    }

    #[test]
    fn unregister_by_name() {
        let reg = ReceptorRegistry::new();
        reg.register("T", "a", echo());
        reg.register("T", "b", echo());

        assert!(reg.unregister("T", "a"));
        assert!(!reg.unregister("T", "a"));
        assert_eq!(reg.receptors_for("T").len(), 1);
        assert!(reg.has_receptors("T"));

        assert!(reg.unregister("T", "b"));
        assert!(!reg.has_receptors("T"));
    }
}
