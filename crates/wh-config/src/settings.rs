//! Typed settings extracted from canonical config JSON.
//!
//! Pointer-based extraction with defaults, so a partial config file is
//! valid; `validate()` enforces the cross-field rules.

use anyhow::{ensure, Context, Result};
use serde_json::Value;
use wh_schemas::CoordinationSettings;

/// Infrastructure table naming. Rendered into the coordinator's SQL once at
/// construction; the embedded migrations cover the default names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub prefix: String,
    pub perspective_prefix: String,
    pub schema: Option<String>,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            prefix: "wh_".to_string(),
            perspective_prefix: "wh_per_".to_string(),
            schema: None,
        }
    }
}

impl TableNames {
    /// Fully qualified infrastructure table name, e.g. `msg.wh_outbox`.
    pub fn table(&self, bare: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}{bare}", self.prefix),
            None => format!("{}{bare}", self.prefix),
        }
    }

    /// Fully qualified perspective state table name, e.g. `wh_per_orders`.
    pub fn perspective_table(&self, perspective: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}{perspective}", self.perspective_prefix),
            None => format!("{}{perspective}", self.perspective_prefix),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WirehubSettings {
    pub service_name: String,
    pub tables: TableNames,
    pub coordination: CoordinationSettings,
    /// Interval strategy cadence.
    pub flush_interval_ms: u64,
    /// Retain terminal rows with status preserved.
    pub debug_mode: bool,
    /// Record hops on dispatch. Off enables the zero-allocation
    /// local-invoke fast path.
    pub hop_tracing: bool,
}

impl WirehubSettings {
    /// Build from merged config JSON (produced by `load_config_layers`).
    ///
    /// Required fields:
    /// - service.name
    ///
    /// Everything else falls back to engine defaults.
    pub fn from_config_json(cfg: &Value) -> Result<Self> {
        let service_name = cfg
            .pointer("/service/name")
            .and_then(Value::as_str)
            .context("config missing service.name")?
            .to_string();

        let tables = TableNames {
            prefix: ptr_str(cfg, "/service/tables/prefix").unwrap_or_else(|| "wh_".into()),
            perspective_prefix: ptr_str(cfg, "/service/tables/perspective_prefix")
                .unwrap_or_else(|| "wh_per_".into()),
            schema: ptr_str(cfg, "/service/tables/schema"),
        };

        let defaults = CoordinationSettings::default();
        let coordination = CoordinationSettings {
            partition_count: ptr_i64(cfg, "/coordination/partition_count")
                .map(|v| v as i32)
                .unwrap_or(defaults.partition_count),
            lease_seconds: ptr_i64(cfg, "/coordination/lease_seconds")
                .unwrap_or(defaults.lease_seconds),
            stale_instance_seconds: ptr_i64(cfg, "/coordination/stale_instance_seconds")
                .unwrap_or(defaults.stale_instance_seconds),
            claim_batch_size: ptr_i64(cfg, "/coordination/claim_batch_size")
                .unwrap_or(defaults.claim_batch_size),
            max_attempts: ptr_i64(cfg, "/coordination/max_attempts")
                .map(|v| v as i32)
                .unwrap_or(defaults.max_attempts),
        };

        let settings = Self {
            service_name,
            tables,
            coordination,
            flush_interval_ms: ptr_i64(cfg, "/strategies/flush_interval_ms").unwrap_or(100) as u64,
            debug_mode: cfg
                .pointer("/coordination/debug_mode")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            hop_tracing: cfg
                .pointer("/dispatch/hop_tracing")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Apply `WIREHUB_*` environment overrides on top of file config.
    /// Unset variables leave the loaded values alone; the result is
    /// re-validated.
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env_i64("WIREHUB_PARTITION_COUNT")? {
            self.coordination.partition_count = v as i32;
        }
        if let Some(v) = env_i64("WIREHUB_LEASE_SECONDS")? {
            self.coordination.lease_seconds = v;
        }
        if let Some(v) = env_i64("WIREHUB_STALE_INSTANCE_SECONDS")? {
            self.coordination.stale_instance_seconds = v;
        }
        if let Some(v) = env_i64("WIREHUB_FLUSH_INTERVAL_MS")? {
            self.flush_interval_ms = v as u64;
        }
        if let Ok(v) = std::env::var("WIREHUB_DEBUG_MODE") {
            self.debug_mode = matches!(v.as_str(), "1" | "true" | "TRUE");
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.service_name.is_empty(), "service.name must not be empty");
        ensure!(!self.tables.prefix.is_empty(), "tables.prefix must not be empty");
        ensure!(self.flush_interval_ms > 0, "strategies.flush_interval_ms must be > 0");
        self.coordination.validate()
    }
}

fn env_i64(name: &str) -> Result<Option<i64>> {
    match std::env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => raw
            .parse::<i64>()
            .map(Some)
            .with_context(|| format!("{name} must be an integer, got {raw:?}")),
    }
}

fn ptr_str(v: &Value, ptr: &str) -> Option<String> {
    v.pointer(ptr).and_then(Value::as_str).map(str::to_string)
}

fn ptr_i64(v: &Value, ptr: &str) -> Option<i64> {
    v.pointer(ptr).and_then(Value::as_i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = json!({"service": {"name": "orders"}});
        let s = WirehubSettings::from_config_json(&cfg).unwrap();
        assert_eq!(s.tables.prefix, "wh_");
        assert_eq!(s.tables.perspective_prefix, "wh_per_");
        assert_eq!(s.coordination.partition_count, 10_000);
        assert_eq!(s.coordination.lease_seconds, 300);
        assert_eq!(s.coordination.stale_instance_seconds, 600);
        assert_eq!(s.flush_interval_ms, 100);
        assert!(s.hop_tracing);
        assert!(!s.debug_mode);
    }

    #[test]
    fn missing_service_name_is_rejected() {
        assert!(WirehubSettings::from_config_json(&json!({})).is_err());
    }

    #[test]
    fn lease_longer_than_stale_threshold_is_rejected() {
        let cfg = json!({
            "service": {"name": "orders"},
            "coordination": {"lease_seconds": 900, "stale_instance_seconds": 600}
        });
        assert!(WirehubSettings::from_config_json(&cfg).is_err());
    }

    #[test]
    fn schema_qualifies_table_names() {
        let t = TableNames {
            prefix: "wh_".into(),
            perspective_prefix: "wh_per_".into(),
            schema: Some("msg".into()),
        };
        assert_eq!(t.table("outbox"), "msg.wh_outbox");
        assert_eq!(t.perspective_table("order_totals"), "msg.wh_per_order_totals");
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let cfg = json!({"service": {"name": "orders"}});
        std::env::set_var("WIREHUB_LEASE_SECONDS", "120");
        std::env::set_var("WIREHUB_DEBUG_MODE", "true");

        let s = WirehubSettings::from_config_json(&cfg)
            .and_then(WirehubSettings::apply_env_overrides)
            .unwrap();

        std::env::remove_var("WIREHUB_LEASE_SECONDS");
        std::env::remove_var("WIREHUB_DEBUG_MODE");

        assert_eq!(s.coordination.lease_seconds, 120);
        assert!(s.debug_mode);
    }

    #[test]
    fn default_tables_are_unqualified() {
        let t = TableNames::default();
        assert_eq!(t.table("event_store"), "wh_event_store");
        assert_eq!(t.perspective_table("order_totals"), "wh_per_order_totals");
    }
}
