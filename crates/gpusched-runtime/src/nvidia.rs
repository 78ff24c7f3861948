//! NVIDIA device queries
//!
//! NVML is preferred. nvidia-smi is the fallback for hosts where the
//! library cannot be loaded but the CLI works.

use async_trait::async_trait;
use gpusched_core::{
    parse_nvidia_smi_csv, Device, DeviceBackend, SchedError, SchedResult, NVIDIA_SMI_QUERY,
};
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::traits::DeviceQuery;

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Pick a device query for the configured backend
pub fn device_query(backend: DeviceBackend) -> SchedResult<Arc<dyn DeviceQuery>> {
    match backend {
        DeviceBackend::Nvml => Ok(Arc::new(NvmlQuery::init()?)),
        DeviceBackend::NvidiaSmi => Ok(Arc::new(NvidiaSmiQuery::default())),
        DeviceBackend::Auto => match NvmlQuery::init() {
            Ok(query) => {
                info!("Using NVML for device queries");
                Ok(Arc::new(query))
            }
            Err(e) => {
                warn!(error = %e, "NVML unavailable, falling back to nvidia-smi");
                Ok(Arc::new(NvidiaSmiQuery::default()))
            }
        },
    }
}

/// Set while a blocking query runs, including after its caller timed out
#[derive(Debug, Default, Clone)]
struct InFlight(Arc<AtomicBool>);

/// Held by the running query; clears the flag on drop
#[derive(Debug)]
struct InFlightGuard(Arc<AtomicBool>);

impl InFlight {
    fn try_begin(&self) -> Option<InFlightGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(Arc::clone(&self.0)))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Device query backed by the NVIDIA Management Library
pub struct NvmlQuery {
    nvml: Arc<Nvml>,
    in_flight: InFlight,
}

impl NvmlQuery {
    /// Load and initialize NVML
    pub fn init() -> SchedResult<Self> {
        let nvml = Nvml::init()
            .map_err(|e| SchedError::DeviceQuery(format!("NVML init failed: {}", e)))?;
        Ok(Self {
            nvml: Arc::new(nvml),
            in_flight: InFlight::default(),
        })
    }
}

#[async_trait]
impl DeviceQuery for NvmlQuery {
    async fn query(&self) -> SchedResult<Vec<Device>> {
        let guard = self.in_flight.try_begin().ok_or_else(|| {
            SchedError::DeviceQuery("previous NVML query still running".to_string())
        })?;
        let nvml = Arc::clone(&self.nvml);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            read_nvml(&nvml)
        })
            .await
            .map_err(|e| SchedError::Internal(format!("NVML query task failed: {}", e)))?
    }

    fn name(&self) -> &'static str {
        "nvml"
    }
}

fn read_nvml(nvml: &Nvml) -> SchedResult<Vec<Device>> {
    let nvml_err = |e: nvml_wrapper::error::NvmlError| SchedError::DeviceQuery(e.to_string());

    let count = nvml.device_count().map_err(nvml_err)?;
    let mut devices = Vec::with_capacity(count as usize);

    for index in 0..count {
        let device = nvml.device_by_index(index).map_err(nvml_err)?;
        let memory = device.memory_info().map_err(nvml_err)?;
        let utilization = device.utilization_rates().map_err(nvml_err)?;

        devices.push(Device {
            id: index,
            name: device.name().unwrap_or_else(|_| format!("GPU {}", index)),
            total_memory_mb: memory.total / BYTES_PER_MIB,
            free_memory_mb: memory.free / BYTES_PER_MIB,
            utilization_percent: utilization.gpu,
            temperature_c: device.temperature(TemperatureSensor::Gpu).ok(),
            power_draw_w: device.power_usage().ok().map(|mw| f64::from(mw) / 1000.0),
            power_limit_w: device
                .enforced_power_limit()
                .ok()
                .map(|mw| f64::from(mw) / 1000.0),
        });
    }

    Ok(devices)
}

/// Device query that shells out to `nvidia-smi`
pub struct NvidiaSmiQuery {
    program: String,
}

impl NvidiaSmiQuery {
    /// Use a specific nvidia-smi binary
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for NvidiaSmiQuery {
    fn default() -> Self {
        Self::new("nvidia-smi")
    }
}

#[async_trait]
impl DeviceQuery for NvidiaSmiQuery {
    async fn query(&self) -> SchedResult<Vec<Device>> {
        let output = Command::new(&self.program)
            .arg(NVIDIA_SMI_QUERY)
            .arg("--format=csv,noheader,nounits")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SchedError::DeviceQuery(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SchedError::DeviceQuery(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let devices = parse_nvidia_smi_csv(&String::from_utf8_lossy(&output.stdout));
        debug!(count = devices.len(), "nvidia-smi reported devices");
        Ok(devices)
    }

    fn name(&self) -> &'static str {
        "nvidia-smi"
    }
}
