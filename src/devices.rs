//! Per-device configuration store.
//!
//! Read-mostly KV keyed by uid. Holds the provisioning record plus the
//! pending binary configuration blob that the handler pushes on the
//! device's next contact. Writes are serialized per uid by the DashMap
//! shard locks.

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;

use crate::protocols::InitiationConfig;

#[derive(Debug, Default, Clone)]
pub struct DeviceEntry {
    /// Raw provisioning record as received from the command path.
    pub config: Option<Value>,
    /// Binary blob awaiting the next connection of this device.
    pub pending_config: Option<Bytes>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, DeviceEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_config(&self, uid: &str) -> Option<Bytes> {
        self.devices
            .get(uid)
            .and_then(|entry| entry.pending_config.clone())
    }

    pub fn set_pending_config(&self, uid: &str, blob: Bytes) {
        self.devices.entry(uid.to_string()).or_default().pending_config = Some(blob);
    }

    pub fn clear_pending_config(&self, uid: &str) {
        if let Some(mut entry) = self.devices.get_mut(uid) {
            entry.pending_config = None;
        }
    }

    pub fn set_config(&self, uid: &str, config: Value) {
        self.devices.entry(uid.to_string()).or_default().config = Some(config);
    }

    pub fn config(&self, uid: &str) -> Option<Value> {
        self.devices.get(uid).and_then(|entry| entry.config.clone())
    }
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut node = value;
    for key in path {
        node = node.get(key)?;
    }
    node.as_str()
}

/// Builds the initiation record from a raw provisioning command value,
/// filling gateway defaults for everything the caller left out.
pub fn initiation_config(raw: &Value, default_host: &str, default_port: u16) -> InitiationConfig {
    let port = raw
        .get("port")
        .and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .map(|v| v as u16)
        .unwrap_or(default_port);
    InitiationConfig {
        identifier: str_at(raw, &["identifier"]).unwrap_or_default().to_string(),
        host: str_at(raw, &["host"]).unwrap_or(default_host).to_string(),
        port,
        device_login: str_at(raw, &["device", "login"]).unwrap_or_default().to_string(),
        device_password: str_at(raw, &["device", "password"])
            .unwrap_or_default()
            .to_string(),
        gprs_apn: str_at(raw, &["gprs", "apn"]).unwrap_or_default().to_string(),
        gprs_username: str_at(raw, &["gprs", "username"]).unwrap_or_default().to_string(),
        gprs_password: str_at(raw, &["gprs", "password"]).unwrap_or_default().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_config_lifecycle() {
        let registry = DeviceRegistry::new();
        let uid = "012896001609129";
        assert!(registry.pending_config(uid).is_none());
        registry.set_pending_config(uid, Bytes::from_static(b"\x01\x02"));
        assert_eq!(
            registry.pending_config(uid).unwrap(),
            Bytes::from_static(b"\x01\x02")
        );
        registry.clear_pending_config(uid);
        assert!(registry.pending_config(uid).is_none());
    }

    #[test]
    fn test_initiation_config_defaults() {
        let config = initiation_config(&json!({}), "10.1.2.3", 21100);
        assert_eq!(config.identifier, "");
        assert_eq!(config.host, "10.1.2.3");
        assert_eq!(config.port, 21100);
        assert_eq!(config.gprs_apn, "");
    }

    #[test]
    fn test_initiation_config_overrides() {
        let raw = json!({
            "identifier": "012896001609129",
            "host": "91.77.12.1",
            "port": "20200",
            "device": {"login": "admin", "password": "secret"},
            "gprs": {"apn": "internet", "username": "u", "password": "p"},
        });
        let config = initiation_config(&raw, "10.1.2.3", 21100);
        assert_eq!(config.identifier, "012896001609129");
        assert_eq!(config.host, "91.77.12.1");
        assert_eq!(config.port, 20200);
        assert_eq!(config.device_login, "admin");
        assert_eq!(config.gprs_apn, "internet");
    }
}
