//! Capability trait definitions

use async_trait::async_trait;
use gpusched_core::{Device, Job, JobId, SchedResult};
use std::path::PathBuf;

/// Source of the physical device set
#[async_trait]
pub trait DeviceQuery: Send + Sync {
    /// Query capacity, free memory and utilization of every device
    async fn query(&self) -> SchedResult<Vec<Device>>;

    /// Get the backend name
    fn name(&self) -> &'static str;
}

/// Reference to a launched job process
///
/// The OS handle itself stays inside the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub job_id: JobId,
    pub pid: Option<u32>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

impl ProcessHandle {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            pid: None,
            stdout_path: None,
            stderr_path: None,
        }
    }
}

/// Observed state of a job process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Still running
    Running,
    /// Exited; signaled processes report the negated signal number
    Exited(i32),
    /// Never started
    LaunchFailed(String),
}

/// Signal sent by [`Supervisor::terminate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    /// Polite request (SIGTERM)
    Term,
    /// Forced (SIGKILL)
    Kill,
}

/// Launches and watches job processes
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Check that launches can work at all (e.g. output root is writable)
    async fn prepare(&self) -> SchedResult<()> {
        Ok(())
    }

    /// Start the job's process without waiting for it
    ///
    /// A process that fails to start is reported by the first `poll`.
    /// An `Err` means the launch could not even be attempted.
    async fn launch(&self, job: &Job) -> SchedResult<ProcessHandle>;

    /// Check a launched process; terminal results are reported once
    async fn poll(&self, handle: &ProcessHandle) -> ProcessStatus;

    /// Signal the process and its process group
    async fn terminate(&self, handle: &ProcessHandle, signal: TermSignal) -> SchedResult<()>;

    /// Get the supervisor name
    fn name(&self) -> &'static str;
}
