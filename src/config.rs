//! Nested key-value configuration surface.
//!
//! Mirrors the `common.*` / `registry.*` / `controller.*` / `worker.*` /
//! `xrootd.*` namespaces from the design document. Each namespace is a
//! plain struct with a `Default` impl supplying the documented defaults;
//! the whole tree deserializes from a single TOML document.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub common: CommonConfig,
    pub registry: RegistryConfig,
    pub controller: ControllerConfig,
    pub worker: WorkerConfig,
    pub czar: CzarConfig,
    pub xrootd: XrootdConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            common: CommonConfig::default(),
            registry: RegistryConfig::default(),
            controller: ControllerConfig::default(),
            worker: WorkerConfig::default(),
            czar: CzarConfig::default(),
            xrootd: XrootdConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    pub request_buf_size_bytes: usize,
    pub request_retry_interval_sec: u64,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            request_buf_size_bytes: 1024 * 1024,
            request_retry_interval_sec: 1,
        }
    }
}

/// A config value that is sensitive or instance-scoped and must be
/// stripped before being echoed back to a peer (see registry merge rules).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityContext {
    pub auth_key: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub host: String,
    pub port: u16,
    pub max_listen_conn: u32,
    pub threads: usize,
    pub heartbeat_ival_sec: u64,
    /// Shared secret every mutating registry route requires in its
    /// `X-Auth-Key` header. Empty disables enforcement (local/dev only).
    pub auth_key: String,
    /// Instance id every mutating registry route requires in its
    /// `X-Instance-Id` header, pinning peers to this cluster instance.
    pub instance_id: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 25081,
            max_listen_conn: 512,
            threads: 4,
            heartbeat_ival_sec: 10,
            auth_key: String::new(),
            instance_id: String::new(),
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ival_sec)
    }

    pub fn security_context(&self) -> SecurityContext {
        SecurityContext {
            auth_key: self.auth_key.clone(),
            instance_id: self.instance_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerPriorities {
    pub ingest: i32,
    pub catalog_management: i32,
    pub health_monitor: i32,
    pub worker_evict: i32,
}

impl Default for ControllerPriorities {
    fn default() -> Self {
        Self {
            ingest: 1,
            catalog_management: 2,
            health_monitor: 3,
            worker_evict: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub num_threads: usize,
    pub request_timeout_sec: u64,
    pub job_timeout_sec: u64,
    pub job_heartbeat_sec: u64,
    pub http_server_threads: usize,
    pub http_server_port: u16,
    pub priorities: ControllerPriorities,
    pub auto_register_workers: bool,
    pub auto_register_czars: bool,
    pub max_repl_level: u32,
    /// Ceiling on adaptive-polling doubling, per §4.4.
    pub max_poll_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            num_threads: 2,
            request_timeout_sec: 300,
            job_timeout_sec: 3600,
            job_heartbeat_sec: 60,
            http_server_threads: 4,
            http_server_port: 25080,
            priorities: ControllerPriorities::default(),
            auto_register_workers: true,
            auto_register_czars: true,
            max_repl_level: 3,
            max_poll_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub num_proc_threads: usize,
    pub num_fs_threads: usize,
    pub fs_buf_size_bytes: usize,
    pub svc_port: u16,
    pub fs_port: u16,
    pub data_tmp_dir: String,
    pub ingest_num_retries: u32,
    pub ingest_max_retries: u32,
    pub loader_max_warnings: u32,
    pub create_databases_on_scan: bool,
    /// Examiner tick interval in seconds; 0 disables the examiner loop.
    pub examine_interval_sec: u64,
    /// Boot-count threshold before a query is moved to the snail lane,
    /// and again before an upstream cancellation signal is surfaced.
    pub max_tasks_booted: u32,
    /// Minimum completed-task evidence before a chunk/table average is
    /// trusted for boot decisions.
    pub required_tasks_completed: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_proc_threads: 8,
            num_fs_threads: 4,
            fs_buf_size_bytes: 4 * 1024 * 1024,
            svc_port: 25000,
            fs_port: 25002,
            data_tmp_dir: "/tmp/qserv".to_string(),
            ingest_num_retries: 1,
            ingest_max_retries: 3,
            loader_max_warnings: 64,
            create_databases_on_scan: false,
            examine_interval_sec: 120,
            max_tasks_booted: 3,
            required_tasks_completed: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CzarConfig {
    pub name: String,
    pub management_host: String,
    pub management_port: u16,
    pub registry_host: String,
    pub registry_port: u16,
    pub heartbeat_ival_sec: u64,
}

impl Default for CzarConfig {
    fn default() -> Self {
        Self {
            name: "czar1".to_string(),
            management_host: "0.0.0.0".to_string(),
            management_port: 25070,
            registry_host: "127.0.0.1".to_string(),
            registry_port: 25081,
            heartbeat_ival_sec: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XrootdConfig {
    pub auto_notify: bool,
    pub request_timeout_sec: u64,
    pub allow_reconnect: bool,
    pub reconnect_timeout_sec: u64,
}

impl Default for XrootdConfig {
    fn default() -> Self {
        Self {
            auto_notify: true,
            request_timeout_sec: 30,
            allow_reconnect: true,
            reconnect_timeout_sec: 5,
        }
    }
}
