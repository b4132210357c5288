//! Where folded projection state lives.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait PerspectiveStateStore: Send + Sync {
    async fn load(&self, perspective: &str, id: &str) -> anyhow::Result<Option<Value>>;

    async fn save(
        &self,
        perspective: &str,
        id: &str,
        data: &Value,
        scope: Option<&Value>,
    ) -> anyhow::Result<()>;
}

/// In-memory store for tests and single-process setups.
#[derive(Default)]
pub struct MemoryStateStore {
    rows: Mutex<HashMap<(String, String), Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<(String, String), Value> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PerspectiveStateStore for MemoryStateStore {
    async fn load(&self, perspective: &str, id: &str) -> anyhow::Result<Option<Value>> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rows.get(&(perspective.to_string(), id.to_string())).cloned())
    }

    async fn save(
        &self,
        perspective: &str,
        id: &str,
        data: &Value,
        _scope: Option<&Value>,
    ) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.insert((perspective.to_string(), id.to_string()), data.clone());
        Ok(())
    }
}
