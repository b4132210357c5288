//! The projection contract.

use serde_json::Value;
use wh_schemas::StoredEvent;

/// A read-model projection. `apply` must be a pure, deterministic fold —
/// no I/O, no clocks — so replaying the same events always rebuilds the
/// same state.
pub trait Perspective: Send + Sync {
    /// Stable name; identifies the checkpoint rows and the state table.
    fn name(&self) -> &str;

    /// Fold one event into the state. `state` is `Value::Null` on the
    /// first event of a stream the projection has never seen.
    fn apply(&self, state: Value, event: &StoredEvent) -> anyhow::Result<Value>;

    /// Row id for a stream's projection state. Defaults to the stream id;
    /// override to merge streams into shared rows.
    fn state_id(&self, stream_id: &str) -> String {
        stream_id.to_string()
    }

    /// Visibility scope stored with the row (`AllowedPrincipals` et al).
    fn scope(&self, _state: &Value) -> Option<Value> {
        None
    }
}
