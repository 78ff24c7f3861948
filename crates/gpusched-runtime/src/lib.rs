//! gpusched-runtime: Capabilities the scheduler consumes
//!
//! This crate provides:
//! - Device queries (NVML, nvidia-smi)
//! - Memory ceiling wrappers (systemd-run, ulimit)
//! - An OS process supervisor

pub mod limiter;
pub mod nvidia;
pub mod process;
pub mod traits;

pub use limiter::MemoryLimiter;
pub use nvidia::{device_query, NvidiaSmiQuery, NvmlQuery};
pub use process::{ProcessSupervisor, ProcessSupervisorConfig};
pub use traits::{DeviceQuery, ProcessHandle, ProcessStatus, Supervisor, TermSignal};
