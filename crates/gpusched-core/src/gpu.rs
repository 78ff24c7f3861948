//! GPU device model and device query output parsing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::job::JobId;

/// Stable device index as reported by the driver
pub type DeviceId = u32;

/// Represents a GPU device as seen by the last poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Device index
    pub id: DeviceId,
    /// Device name
    pub name: String,
    /// Total memory in MiB
    pub total_memory_mb: u64,
    /// Free memory in MiB
    pub free_memory_mb: u64,
    /// Current utilization percentage (0-100)
    pub utilization_percent: u32,
    /// Temperature in Celsius, if reported
    pub temperature_c: Option<u32>,
    /// Power draw in watts, if reported
    pub power_draw_w: Option<f64>,
    /// Power limit in watts, if reported
    pub power_limit_w: Option<f64>,
}

impl Device {
    /// Create a device with only the fields the scheduler cares about
    pub fn new(id: DeviceId, total_memory_mb: u64, free_memory_mb: u64, utilization_percent: u32) -> Self {
        Self {
            id,
            name: format!("GPU {}", id),
            total_memory_mb,
            free_memory_mb,
            utilization_percent,
            temperature_c: None,
            power_draw_w: None,
            power_limit_w: None,
        }
    }

    /// Whether the polled numbers pass the admission thresholds.
    ///
    /// This says nothing about ownership; a device held by a running job
    /// is never available regardless of what the driver reports.
    pub fn meets(&self, thresholds: &AdmissionThresholds) -> bool {
        self.free_memory_mb >= thresholds.min_free_memory_mb
            && self.utilization_percent <= thresholds.max_utilization_percent
    }
}

/// Minimum free memory / maximum utilization for a device to accept new work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionThresholds {
    pub min_free_memory_mb: u64,
    pub max_utilization_percent: u32,
}

impl Default for AdmissionThresholds {
    fn default() -> Self {
        Self {
            min_free_memory_mb: 1000,
            max_utilization_percent: 10,
        }
    }
}

/// Result of the most recently completed device poll
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Devices indexed by id
    pub devices: BTreeMap<DeviceId, Device>,
    /// When the devices were last successfully polled
    pub updated_at: Option<DateTime<Utc>>,
    /// Set when the last poll failed and `devices` is stale
    pub degraded: bool,
    /// Error from the last failed poll
    pub error: Option<String>,
}

impl DeviceSnapshot {
    /// Snapshot from a successful poll
    pub fn fresh(devices: Vec<Device>) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.id, d)).collect(),
            updated_at: Some(Utc::now()),
            degraded: false,
            error: None,
        }
    }

    /// Number of known devices
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Whether a device id is known
    pub fn contains(&self, id: DeviceId) -> bool {
        self.devices.contains_key(&id)
    }
}

/// Device with its derived availability, as consumed by the allocator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuStatus {
    /// Device information
    #[serde(flatten)]
    pub device: Device,
    /// Passes thresholds and is not held by a running job
    pub available: bool,
    /// Running job that holds this device
    pub assigned_job_id: Option<JobId>,
}

/// Query arguments for nvidia-smi matching [`parse_nvidia_smi_csv`]
pub const NVIDIA_SMI_QUERY: &str = "--query-gpu=index,name,memory.total,memory.used,utilization.gpu,temperature.gpu,power.draw,power.limit";

/// Parse `nvidia-smi --format=csv,noheader,nounits` output
///
/// Lines that do not have the expected shape are skipped.
pub fn parse_nvidia_smi_csv(output: &str) -> Vec<Device> {
    let mut devices = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split(',').map(|p| p.trim()).collect();
        if parts.len() < 8 {
            warn!(line = %line, "Unexpected nvidia-smi output format");
            continue;
        }

        let (Some(id), Some(total), Some(used), Some(util)) = (
            parse_field::<u32>(parts[0]),
            parse_field::<f64>(parts[2]),
            parse_field::<f64>(parts[3]),
            parse_field::<f64>(parts[4]),
        ) else {
            warn!(line = %line, "Skipping nvidia-smi line with unreadable numbers");
            continue;
        };

        let total_memory_mb = total as u64;
        devices.push(Device {
            id,
            name: parts[1].to_string(),
            total_memory_mb,
            free_memory_mb: total_memory_mb.saturating_sub(used as u64),
            utilization_percent: util as u32,
            temperature_c: parse_field::<f64>(parts[5]).map(|t| t as u32),
            power_draw_w: parse_field::<f64>(parts[6]),
            power_limit_w: parse_field::<f64>(parts[7]),
        });
    }

    devices
}

// "[N/A]" and "[Not Supported]" come back as None
fn parse_field<T: std::str::FromStr>(raw: &str) -> Option<T> {
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi() {
        let output = "\
0, NVIDIA A100-SXM4-40GB, 40960, 1024, 3, 34, 52.10, 400.00
1, NVIDIA A100-SXM4-40GB, 40960, 39000, 97, 71, 310.55, 400.00
";
        let devices = parse_nvidia_smi_csv(output);
        assert_eq!(devices.len(), 2);

        assert_eq!(devices[0].id, 0);
        assert_eq!(devices[0].name, "NVIDIA A100-SXM4-40GB");
        assert_eq!(devices[0].total_memory_mb, 40960);
        assert_eq!(devices[0].free_memory_mb, 39936);
        assert_eq!(devices[0].utilization_percent, 3);
        assert_eq!(devices[0].temperature_c, Some(34));

        assert_eq!(devices[1].free_memory_mb, 1960);
        assert_eq!(devices[1].utilization_percent, 97);
    }

    #[test]
    fn test_parse_nvidia_smi_unsupported_fields() {
        let output = "0, Tesla T4, 15360, 0, 0, 40, [N/A], [Not Supported]\n";
        let devices = parse_nvidia_smi_csv(output);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].power_draw_w, None);
        assert_eq!(devices[0].power_limit_w, None);
        assert_eq!(devices[0].temperature_c, Some(40));
    }

    #[test]
    fn test_parse_nvidia_smi_skips_garbage() {
        let output = "garbage line\n\n0, T4, x, 0, 0, 40, 1, 2\n1, T4, 100, 10, 5, 40, 1, 2\n";
        let devices = parse_nvidia_smi_csv(output);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, 1);
    }

    #[test]
    fn test_thresholds() {
        let thresholds = AdmissionThresholds {
            min_free_memory_mb: 1000,
            max_utilization_percent: 10,
        };

        assert!(Device::new(0, 8000, 8000, 0).meets(&thresholds));
        assert!(Device::new(0, 8000, 1000, 10).meets(&thresholds));
        assert!(!Device::new(0, 8000, 999, 0).meets(&thresholds));
        assert!(!Device::new(0, 8000, 8000, 11).meets(&thresholds));
    }

    #[test]
    fn test_snapshot_fresh() {
        let snapshot = DeviceSnapshot::fresh(vec![Device::new(1, 10, 10, 0), Device::new(0, 10, 10, 0)]);
        assert_eq!(snapshot.device_count(), 2);
        assert!(snapshot.contains(0));
        assert!(!snapshot.contains(2));
        assert!(!snapshot.degraded);
        assert!(snapshot.updated_at.is_some());
        assert_eq!(snapshot.devices.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    }
}
