//! Job request, Job and job state definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::error::{SchedError, SchedResult};
use crate::gpu::DeviceId;

/// Job identifier, assigned sequentially at submission
pub type JobId = u64;

/// Device constraint of a job; the two forms are mutually exclusive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuRequest {
    /// Any `n` devices
    Count(u32),
    /// Exactly these devices
    Ids(Vec<DeviceId>),
}

impl GpuRequest {
    /// Explicit device ids, sorted and de-duplicated
    pub fn ids(ids: impl IntoIterator<Item = DeviceId>) -> Self {
        let mut ids: Vec<DeviceId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        GpuRequest::Ids(ids)
    }

    /// Number of devices this request needs
    pub fn device_count(&self) -> usize {
        match self {
            GpuRequest::Count(n) => *n as usize,
            GpuRequest::Ids(ids) => ids.len(),
        }
    }
}

impl Default for GpuRequest {
    fn default() -> Self {
        GpuRequest::Count(1)
    }
}

/// A job as submitted, before the store assigns an id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Human-readable name
    pub name: Option<String>,
    /// Program and arguments
    pub command: Vec<String>,
    /// Device constraint
    pub gpus: GpuRequest,
    /// Memory ceiling in GB, enforced at launch
    pub memory_limit_gb: Option<u32>,
    /// Higher runs first
    pub priority: i32,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    /// Working directory for the process
    pub working_dir: Option<PathBuf>,
}

impl JobRequest {
    /// Create a request with default values
    pub fn new(command: Vec<String>, gpus: GpuRequest) -> Self {
        Self {
            name: None,
            command,
            gpus,
            memory_limit_gb: None,
            priority: 0,
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// Check the request against the currently known device ids
    pub fn validate<'a>(&self, known_devices: impl IntoIterator<Item = &'a DeviceId>) -> SchedResult<()> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(SchedError::Validation("command must not be empty".to_string()));
        }

        if self.memory_limit_gb == Some(0) {
            return Err(SchedError::Validation(
                "memory_limit must be at least 1 GB".to_string(),
            ));
        }

        let known: Vec<DeviceId> = known_devices.into_iter().copied().collect();
        if known.is_empty() {
            return Err(SchedError::Validation("no GPUs detected".to_string()));
        }

        match &self.gpus {
            GpuRequest::Count(0) => Err(SchedError::Validation(
                "num_gpus must be at least 1".to_string(),
            )),
            GpuRequest::Count(n) if *n as usize > known.len() => {
                Err(SchedError::Validation(format!(
                    "requested {} GPUs but only {} exist",
                    n,
                    known.len()
                )))
            }
            GpuRequest::Count(_) => Ok(()),
            GpuRequest::Ids(ids) if ids.is_empty() => Err(SchedError::Validation(
                "gpu_ids must not be empty".to_string(),
            )),
            GpuRequest::Ids(ids) if ids.iter().collect::<BTreeSet<_>>().len() != ids.len() => {
                Err(SchedError::Validation(format!("duplicate GPU ids: {:?}", ids)))
            }
            GpuRequest::Ids(ids) => {
                let unknown: Vec<DeviceId> =
                    ids.iter().copied().filter(|id| !known.contains(id)).collect();
                if unknown.is_empty() {
                    Ok(())
                } else {
                    Err(SchedError::Validation(format!("unknown GPU ids: {:?}", unknown)))
                }
            }
        }
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for devices
    Pending,
    /// Process launched on assigned devices
    Running,
    /// Exited with code 0
    Completed,
    /// Failed to launch or exited non-zero
    Failed,
    /// Cancelled by request
    Cancelled,
}

impl JobState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Cancelled)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One unit of work and everything recorded about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub command: Vec<String>,
    pub gpus: GpuRequest,
    pub memory_limit_gb: Option<u32>,
    pub priority: i32,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub state: JobState,
    /// Set while running once cancellation was requested
    pub cancel_requested: bool,
    /// Empty until scheduled, then fixed for the job's lifetime
    pub assigned_gpu_ids: Vec<DeviceId>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
    pub pid: Option<u32>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

impl Job {
    /// Create a pending job from a validated request
    pub fn new(id: JobId, request: JobRequest, submitted_at: DateTime<Utc>) -> Self {
        let name = match request.name {
            Some(name) if !name.trim().is_empty() => name,
            _ => format!("job-{}", id),
        };

        Self {
            id,
            name,
            command: request.command,
            gpus: request.gpus,
            memory_limit_gb: request.memory_limit_gb,
            priority: request.priority,
            env: request.env,
            working_dir: request.working_dir,
            state: JobState::Pending,
            cancel_requested: false,
            assigned_gpu_ids: Vec::new(),
            submitted_at,
            started_at: None,
            finished_at: None,
            exit_code: None,
            failure_reason: None,
            pid: None,
            stdout_path: None,
            stderr_path: None,
        }
    }

    /// Value for the device-visibility variable, e.g. `"0,2"`
    pub fn visible_devices(&self) -> String {
        self.assigned_gpu_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Scheduling policy: priority descending, then submission time, then id
pub fn scheduling_order(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.submitted_at.cmp(&b.submitted_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request() -> JobRequest {
        JobRequest::new(vec!["python".to_string(), "train.py".to_string()], GpuRequest::Count(1))
    }

    #[test]
    fn test_job_new() {
        let job = Job::new(4, request(), Utc::now());
        assert_eq!(job.name, "job-4");
        assert_eq!(job.state, JobState::Pending);
        assert!(job.assigned_gpu_ids.is_empty());
        assert!(!job.cancel_requested);

        let mut named = request();
        named.name = Some("resnet".to_string());
        assert_eq!(Job::new(5, named, Utc::now()).name, "resnet");
    }

    #[test]
    fn test_gpu_request_ids_normalized() {
        assert_eq!(GpuRequest::ids([3, 1, 3, 0]), GpuRequest::Ids(vec![0, 1, 3]));
        assert_eq!(GpuRequest::ids([3, 1, 3]).device_count(), 2);
    }

    #[test]
    fn test_validate() {
        let known = [0, 1, 2];
        assert!(request().validate(&known).is_ok());

        let mut too_many = request();
        too_many.gpus = GpuRequest::Count(4);
        assert!(matches!(too_many.validate(&known), Err(SchedError::Validation(_))));

        let mut zero = request();
        zero.gpus = GpuRequest::Count(0);
        assert!(zero.validate(&known).is_err());

        let mut unknown = request();
        unknown.gpus = GpuRequest::ids([1, 5]);
        assert!(unknown.validate(&known).is_err());

        let mut repeated = request();
        repeated.gpus = GpuRequest::Ids(vec![1, 1]);
        assert!(matches!(repeated.validate(&known), Err(SchedError::Validation(_))));

        let mut empty_ids = request();
        empty_ids.gpus = GpuRequest::Ids(Vec::new());
        assert!(empty_ids.validate(&known).is_err());

        let mut no_command = request();
        no_command.command.clear();
        assert!(no_command.validate(&known).is_err());

        let mut no_memory = request();
        no_memory.memory_limit_gb = Some(0);
        assert!(no_memory.validate(&known).is_err());

        assert!(request().validate(&[]).is_err());
    }

    #[test]
    fn test_state_machine() {
        use JobState::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Pending.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn test_scheduling_order() {
        let t0 = Utc::now();
        let mut low = Job::new(1, request(), t0);
        low.priority = 0;
        let mut high_late = Job::new(2, request(), t0 + Duration::seconds(5));
        high_late.priority = 5;
        let mut high_early = Job::new(3, request(), t0 + Duration::seconds(1));
        high_early.priority = 5;
        let mut same_time = Job::new(4, request(), t0 + Duration::seconds(1));
        same_time.priority = 5;

        let mut jobs = vec![low, high_late, same_time, high_early];
        jobs.sort_by(scheduling_order);
        let order: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(order, vec![3, 4, 2, 1]);
    }

    #[test]
    fn test_visible_devices() {
        let mut job = Job::new(1, request(), Utc::now());
        job.assigned_gpu_ids = vec![0, 2];
        assert_eq!(job.visible_devices(), "0,2");
    }

    #[test]
    fn test_state_serde() {
        assert_eq!(serde_json::to_string(&JobState::Cancelled).unwrap(), "\"cancelled\"");
        let gpus: GpuRequest = serde_json::from_str(r#"{"ids":[1,0]}"#).unwrap();
        assert_eq!(gpus, GpuRequest::Ids(vec![1, 0]));
    }
}
