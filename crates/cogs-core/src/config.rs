//! Configuration types for cogs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Listener configuration
    pub api: ApiConfig,
    /// Telemetry configuration
    pub monitor: MonitorConfig,
    /// Owner resolution configuration
    pub identity: IdentityConfig,
    /// Admission control configuration
    pub broker: BrokerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::CogsError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::CogsError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::CogsError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Unix domain socket path (empty disables the listener)
    pub uds_path: String,
    /// TCP listen address (empty disables the listener)
    pub tcp_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            uds_path: "/var/run/cogs.sock".to_string(),
            tcp_address: ":9110".to_string(),
        }
    }
}

impl ApiConfig {
    /// TCP address with a Go-style `:port` expanded to all interfaces
    pub fn tcp_bind_address(&self) -> Option<String> {
        let address = self.tcp_address.trim();
        if address.is_empty() {
            None
        } else if address.starts_with(':') {
            Some(format!("0.0.0.0{}", address))
        } else {
            Some(address.to_string())
        }
    }

    /// Unix socket path, if enabled
    pub fn uds_bind_path(&self) -> Option<PathBuf> {
        let path = self.uds_path.trim();
        (!path.is_empty()).then(|| PathBuf::from(path))
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Path to the nvidia-smi executable
    pub smi_path: PathBuf,
    /// Logical group per device number (e.g. `"0" = "training"`)
    pub groups: HashMap<String, String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            smi_path: PathBuf::from("nvidia-smi"),
            groups: HashMap::new(),
        }
    }
}

impl MonitorConfig {
    /// Group configured for a device number
    pub fn group_for(&self, number: u32) -> Option<&str> {
        self.groups.get(&number.to_string()).map(String::as_str)
    }
}

/// Owner resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Docker Engine API socket
    pub docker_socket: PathBuf,
    /// Root of the proc filesystem
    pub proc_root: PathBuf,
    /// Seconds a resolved container owner stays cached
    pub cache_ttl_secs: u64,
    /// Milliseconds allowed for one container runtime request
    pub runtime_timeout_ms: u64,
    /// Container label keys holding the owner, highest priority first
    pub owner_labels: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            proc_root: PathBuf::from("/proc"),
            cache_ttl_secs: 300,
            runtime_timeout_ms: 5000,
            owner_labels: vec![
                "ccc-user.email".to_string(),
                "user.email".to_string(),
                "email".to_string(),
                "maintainer".to_string(),
            ],
        }
    }
}

/// Admission control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Interval at which blocked claims re-check availability, in milliseconds
    pub poll_interval_ms: u64,
    /// Seconds a claim may stay without any process before it is released (0 = never)
    pub claim_grace_secs: u64,
    /// Wait timeout used when a request gives none; negative waits forever
    pub default_wait_secs: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            claim_grace_secs: 120,
            default_wait_secs: -1.0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
