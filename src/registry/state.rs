//! In-memory registration state and the merge semantics applied to it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde_json::{json, Map, Value};

/// Keys an entry's owner may send us but that we never echo back or let
/// a re-registration overwrite blindly, since they carry secrets or
/// identity that should only ever flow in one direction.
const SECURITY_CONTEXT_KEYS: &[&str] = &["authKey", "adminAuthKey", "instance_id", "name"];

fn is_security_context_key(key: &str) -> bool {
    SECURITY_CONTEXT_KEYS.contains(&key)
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis()
}

/// Directory of registered services, keyed by kind then by name.
#[derive(Default)]
pub struct RegistryState {
    workers: RwLock<HashMap<String, Value>>,
    czars: RwLock<HashMap<String, Value>>,
    controllers: RwLock<HashMap<String, Value>>,
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a worker's self-reported payload under `kind` (e.g.
    /// `"qserv-worker"` or `"replication-worker"`), stamping the sender's
    /// address and the current time, and dropping security-context keys.
    /// Worker entries nest payload fields under `kind` so a worker can be
    /// registered under more than one role at once.
    pub fn register_worker(&self, name: &str, kind: &str, payload: &Value, sender_ip: IpAddr) {
        let mut workers = self.workers.write();
        let entry = workers
            .entry(name.to_string())
            .or_insert_with(|| json!({}));
        let entry_map = entry.as_object_mut().expect("worker entry is always an object");

        let mut kind_obj = Map::new();
        kind_obj.insert("host-addr".to_string(), json!(sender_ip.to_string()));
        kind_obj.insert("update-time-ms".to_string(), json!(now_ms()));
        if let Some(src) = payload.as_object() {
            for (key, val) in src {
                if !is_security_context_key(key) {
                    kind_obj.insert(key.clone(), val.clone());
                }
            }
        }
        entry_map.insert(kind.to_string(), Value::Object(kind_obj));
    }

    /// Merge a czar's self-reported payload. Czar entries are flat, not
    /// nested by kind, since a czar only ever registers one role.
    pub fn register_czar(&self, name: &str, payload: &Value, sender_ip: IpAddr) {
        Self::register_flat(&self.czars, name, payload, sender_ip);
    }

    pub fn register_controller(&self, name: &str, payload: &Value, sender_ip: IpAddr) {
        Self::register_flat(&self.controllers, name, payload, sender_ip);
    }

    fn register_flat(
        table: &RwLock<HashMap<String, Value>>,
        name: &str,
        payload: &Value,
        sender_ip: IpAddr,
    ) {
        let mut entry = Map::new();
        entry.insert("host-addr".to_string(), json!(sender_ip.to_string()));
        entry.insert("update-time-ms".to_string(), json!(now_ms()));
        if let Some(src) = payload.as_object() {
            for (key, val) in src {
                if !is_security_context_key(key) {
                    entry.insert(key.clone(), val.clone());
                }
            }
        }
        table.write().insert(name.to_string(), Value::Object(entry));
    }

    pub fn remove_worker(&self, name: &str) -> bool {
        self.workers.write().remove(name).is_some()
    }

    pub fn remove_czar(&self, name: &str) -> bool {
        self.czars.write().remove(name).is_some()
    }

    pub fn remove_controller(&self, name: &str) -> bool {
        self.controllers.write().remove(name).is_some()
    }

    /// Names of every currently registered worker, for fan-out callers
    /// like the `/query` control-plane endpoint.
    pub fn worker_names(&self) -> Vec<String> {
        self.workers.read().keys().cloned().collect()
    }

    /// Snapshot of the full directory, shaped the way `/services` reports
    /// it: one object with `workers`, `czars`, and `controllers` keys.
    pub fn services_snapshot(&self) -> Value {
        json!({
            "workers": Value::Object(self.workers.read().clone().into_iter().collect()),
            "czars": Value::Object(self.czars.read().clone().into_iter().collect()),
            "controllers": Value::Object(self.controllers.read().clone().into_iter().collect()),
        })
    }

    pub fn worker(&self, name: &str) -> Option<Value> {
        self.workers.read().get(name).cloned()
    }
}

/// Whether an entry's `update-time-ms` is older than `threshold`. This is
/// never invoked automatically by `RegistryState` itself — a caller
/// (health monitor, scheduler) decides what staleness means for its
/// purposes and polls with this.
pub fn is_stale(entry: &Value, threshold: Duration) -> bool {
    let updated_ms = entry
        .get("update-time-ms")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u128;
    let age_ms = now_ms().saturating_sub(updated_ms);
    age_ms > threshold.as_millis()
}
