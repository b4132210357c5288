//! Layered configuration.
//!
//! YAML layers merge in order (later layers win), render to a canonical
//! compact JSON form with sorted keys, and hash — so two instances can
//! prove they run the same configuration by comparing one string.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;

pub mod settings;

pub use settings::{TableNames, WirehubSettings};

/// A fully merged configuration: the merged tree, its canonical rendering,
/// and the SHA-256 of that rendering.
#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub json: Value,
    pub canonical: String,
    pub hash: String,
}

/// Read and merge YAML layers in order. Later layers override earlier
/// ones: objects merge key-by-key, arrays and scalars are replaced
/// wholesale.
pub fn load_config_layers(paths: &[&str]) -> Result<ConfigBundle> {
    let mut merged = Value::Object(Map::new());

    for path in paths {
        let raw = fs::read_to_string(path).with_context(|| format!("read config: {path}"))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&raw).with_context(|| format!("parse yaml: {path}"))?;
        let layer = serde_json::to_value(layer)
            .with_context(|| format!("yaml layer {path} does not map to json"))?;
        merged = apply_layer(merged, layer);
    }

    let mut canonical = String::new();
    write_canonical(&merged, &mut canonical)?;
    let hash = hex::encode(Sha256::digest(canonical.as_bytes()));

    Ok(ConfigBundle {
        json: merged,
        canonical,
        hash,
    })
}

/// Dev convenience: load `.env.local` if present before reading env vars.
/// Silent when the file does not exist — production injects env directly.
pub fn load_dotenv() {
    let _ = dotenvy::from_filename(".env.local");
}

fn apply_layer(base: Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base_map), Value::Object(patch_map)) => {
            for (key, incoming) in patch_map {
                let merged = match base_map.remove(&key) {
                    Some(existing) => apply_layer(existing, incoming),
                    None => incoming,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, replacement) => replacement,
    }
}

/// Render compact JSON with object keys in sorted order, so the hash does
/// not depend on map iteration order.
fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, child)) in ordered.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).context("render config key")?);
                out.push(':');
                write_canonical(child, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => {
            out.push_str(&serde_json::to_string(scalar).context("render config value")?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn later_layers_override_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(&dir, "base.yaml", "coordination:\n  lease_seconds: 300\n");
        let over = write_yaml(&dir, "over.yaml", "coordination:\n  lease_seconds: 30\n");

        let cfg = load_config_layers(&[&base, &over]).unwrap();
        assert_eq!(
            cfg.json.pointer("/coordination/lease_seconds"),
            Some(&Value::from(30))
        );
    }

    #[test]
    fn objects_merge_key_by_key_not_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(
            &dir,
            "base.yaml",
            "service:\n  name: orders\n  tables:\n    prefix: wh_\n",
        );
        let over = write_yaml(&dir, "over.yaml", "service:\n  tables:\n    schema: msg\n");

        let cfg = load_config_layers(&[&base, &over]).unwrap();
        assert_eq!(
            cfg.json.pointer("/service/name").and_then(Value::as_str),
            Some("orders")
        );
        assert_eq!(
            cfg.json.pointer("/service/tables/prefix").and_then(Value::as_str),
            Some("wh_")
        );
        assert_eq!(
            cfg.json.pointer("/service/tables/schema").and_then(Value::as_str),
            Some("msg")
        );
    }

    #[test]
    fn arrays_are_replaced_not_appended() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(&dir, "base.yaml", "destinations: [a, b]\n");
        let over = write_yaml(&dir, "over.yaml", "destinations: [c]\n");

        let cfg = load_config_layers(&[&base, &over]).unwrap();
        assert_eq!(cfg.json["destinations"], serde_json::json!(["c"]));
    }

    #[test]
    fn canonical_form_sorts_keys_and_stays_compact() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(&dir, "a.yaml", "zeta: 1\nalpha:\n  nested: true\n");

        let cfg = load_config_layers(&[&path]).unwrap();
        assert_eq!(cfg.canonical, r#"{"alpha":{"nested":true},"zeta":1}"#);
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_yaml(&dir, "a.yaml", "x: 1\ny: 2\n");
        let b = write_yaml(&dir, "b.yaml", "y: 2\nx: 1\n");

        let ca = load_config_layers(&[&a]).unwrap();
        let cb = load_config_layers(&[&b]).unwrap();
        assert_eq!(ca.hash, cb.hash);
    }
}
