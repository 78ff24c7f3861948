//! Configuration types for gpusched

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::gpu::AdmissionThresholds;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Scheduler loop configuration
    pub scheduler: SchedulerConfig,
    /// Process runtime configuration
    pub runtime: RuntimeConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::SchedError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::SchedError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::SchedError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
    /// Lines of stdout included in job details
    pub recent_output_lines: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9090,
            recent_output_lines: 50,
        }
    }
}

/// Scheduler loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between ticks
    pub poll_interval_secs: u64,
    /// Minimum free memory (MiB) for a device to accept work
    pub min_free_memory_mb: u64,
    /// Maximum utilization (%) for a device to accept work
    pub max_utilization_percent: u32,
    /// Upper bound on a single device query
    pub query_timeout_secs: u64,
    /// Seconds after SIGTERM before a cancelled job is killed
    pub kill_grace_secs: u64,
    /// Send SIGTERM to running jobs when the daemon stops
    pub terminate_on_shutdown: bool,
    /// Memory ceiling applied when a request does not set one
    pub default_memory_limit_gb: Option<u32>,
    /// Device selection for count-based requests
    pub placement: PlacementKind,
    /// How devices are queried
    pub device_backend: DeviceBackend,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            min_free_memory_mb: 1000,
            max_utilization_percent: 10,
            query_timeout_secs: 10,
            kill_grace_secs: 30,
            terminate_on_shutdown: true,
            default_memory_limit_gb: Some(5),
            placement: PlacementKind::BestFit,
            device_backend: DeviceBackend::Auto,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn thresholds(&self) -> AdmissionThresholds {
        AdmissionThresholds {
            min_free_memory_mb: self.min_free_memory_mb,
            max_utilization_percent: self.max_utilization_percent,
        }
    }
}

/// Device selection strategy for count-based requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementKind {
    /// Most free memory first, ties by lowest id
    BestFit,
    /// Lowest id first
    FirstFit,
}

/// Device query backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceBackend {
    /// NVML, falling back to nvidia-smi
    Auto,
    /// NVIDIA Management Library
    Nvml,
    /// nvidia-smi CSV query
    NvidiaSmi,
}

/// Process runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root of the per-job output directories
    pub output_dir: PathBuf,
    /// How the memory ceiling is enforced
    pub memory_limiter: MemoryLimiterKind,
    /// Variable that restricts the devices a job can see
    pub visible_devices_env: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Self {
            output_dir: home.join("gpu-scheduler").join("output"),
            memory_limiter: MemoryLimiterKind::Auto,
            visible_devices_env: "CUDA_VISIBLE_DEVICES".to_string(),
        }
    }
}

/// Memory ceiling mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryLimiterKind {
    /// systemd-run when available, otherwise ulimit
    Auto,
    /// `systemd-run --user --scope -p MemoryMax=`
    SystemdRun,
    /// `ulimit -v` in a wrapping shell
    Ulimit,
    /// No ceiling
    None,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}
