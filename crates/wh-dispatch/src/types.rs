//! Explicit envelope-type registration.
//!
//! The runtime table generated code (or the application at startup) fills
//! in; consulted once per payload deserialization.

use std::collections::HashMap;
use std::sync::RwLock;

use wh_schemas::{EventTypeProvider, TypeDescriptor};

#[derive(Default)]
pub struct StaticTypeProvider {
    inner: RwLock<HashMap<String, TypeDescriptor>>,
}

impl StaticTypeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, envelope_type: impl Into<String>, schema: Option<String>) {
        let envelope_type = envelope_type.into();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.insert(
            envelope_type.clone(),
            TypeDescriptor {
                envelope_type,
                schema,
            },
        );
    }
}

impl EventTypeProvider for StaticTypeProvider {
    fn resolve(&self, envelope_type: &str) -> Option<TypeDescriptor> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(envelope_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_returns_registered_descriptors_only() {
        let provider = StaticTypeProvider::new();
        provider.register("OrderPlaced", Some("orders/v2".to_string()));

        let descriptor = provider.resolve("OrderPlaced").unwrap();
        assert_eq!(descriptor.envelope_type, "OrderPlaced");
        assert_eq!(descriptor.schema.as_deref(), Some("orders/v2"));

        assert!(provider.resolve("Unknown").is_none());
    }
}
