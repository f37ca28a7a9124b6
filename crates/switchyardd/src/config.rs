//! switchyard.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use switchyard_health::ProbeConfig;
use switchyard_pipeline::ServiceConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchyardConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_port() -> u16 {
    7070
}

fn default_data_dir() -> String {
    "/var/lib/switchyard".to_string()
}

/// One `[[service]]` block. Durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    pub name: String,
    /// Image repository; pushed images are tagged with the source revision.
    pub image_repository: String,
    #[serde(default = "default_instance_count")]
    pub instance_count: u32,
    /// Port the service instances listen on.
    #[serde(default = "default_service_port")]
    pub port: u16,
    /// Public entry-point address, probed during post-check.
    pub entry_point: Option<String>,
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    #[serde(default = "default_probe_interval")]
    pub probe_interval: u64,
    #[serde(default = "default_probe_deadline")]
    pub probe_deadline: u64,
    #[serde(default = "default_consecutive_passes")]
    pub required_consecutive_passes: u32,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_approval_deadline")]
    pub approval_deadline: u64,
    #[serde(default = "default_termination_wait")]
    pub termination_wait: u64,
}

fn default_instance_count() -> u32 {
    2
}

fn default_service_port() -> u16 {
    8080
}

fn default_probe_path() -> String {
    "/healthz".to_string()
}

fn default_probe_interval() -> u64 {
    5
}

fn default_probe_deadline() -> u64 {
    120
}

fn default_consecutive_passes() -> u32 {
    3
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_approval_deadline() -> u64 {
    3600
}

fn default_termination_wait() -> u64 {
    60
}

impl SwitchyardConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SwitchyardConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

impl ServiceSection {
    /// Entry point, defaulting to loopback on the service port.
    pub fn entry_point(&self) -> String {
        self.entry_point
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.port))
    }

    pub fn to_service_config(&self) -> ServiceConfig {
        ServiceConfig {
            name: self.name.clone(),
            instance_count: self.instance_count,
            port: self.port,
            entry_point: self.entry_point(),
            probe: ProbeConfig {
                path: self.probe_path.clone(),
                interval: Duration::from_secs(self.probe_interval),
                timeout: Duration::from_secs(self.probe_deadline),
                required_consecutive_passes: self.required_consecutive_passes,
                failure_threshold: self.failure_threshold,
                probe_timeout: Duration::from_secs(self.probe_interval),
            },
            approval_deadline: Duration::from_secs(self.approval_deadline),
            termination_wait: Duration::from_secs(self.termination_wait),
        }
    }
}
