//! Explicit service-instance identity.
//!
//! Every coordinator call carries the caller's identity; there is no ambient
//! singleton. Construct once at startup and pass it down.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub instance_id: Uuid,
    pub service_name: String,
    pub host_name: String,
    pub process_id: i32,
    pub metadata: Value,
}

impl ServiceInstance {
    pub fn new(
        service_name: impl Into<String>,
        host_name: impl Into<String>,
        process_id: i32,
    ) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            service_name: service_name.into(),
            host_name: host_name.into(),
            process_id,
            metadata: Value::Null,
        }
    }

    /// Identity for the current process. Host name comes from `HOSTNAME`
    /// when set (the common container case), else `"unknown-host"`.
    pub fn detect(service_name: impl Into<String>) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
        Self::new(service_name, host, std::process::id() as i32)
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_fills_process_id() {
        let inst = ServiceInstance::detect("orders");
        assert_eq!(inst.service_name, "orders");
        assert!(inst.process_id > 0);
    }

    #[test]
    fn instance_ids_are_unique() {
        assert_ne!(
            ServiceInstance::new("a", "h", 1).instance_id,
            ServiceInstance::new("a", "h", 1).instance_id
        );
    }
}
