//! In-memory job store
//!
//! Every job and every state transition lives behind a single lock, so a
//! reader never observes a job halfway through a transition.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gpusched_core::{
    scheduling_order, DeviceId, Job, JobId, JobRequest, JobState, SchedError, SchedResult,
};
use gpusched_runtime::ProcessHandle;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was pending and is now cancelled
    Cancelled,
    /// The job is running; the scheduler loop will terminate it
    CancelRequested,
}

/// Number of jobs per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }
}

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<JobId, Job>,
    next_id: JobId,
    last_submitted_at: Option<DateTime<Utc>>,
}

impl Inner {
    fn job_mut(&mut self, id: JobId) -> SchedResult<&mut Job> {
        self.jobs.get_mut(&id).ok_or(SchedError::JobNotFound(id))
    }

    /// Strictly increasing submission time, even if the clock steps back
    fn next_submitted_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let at = match self.last_submitted_at {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_submitted_at = Some(at);
        at
    }
}

/// Authoritative record of all jobs
#[derive(Default)]
pub struct JobStore {
    inner: RwLock<Inner>,
}

impl JobStore {
    /// Create an empty store; the first job gets id 1
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_id: 1,
                ..Inner::default()
            }),
        }
    }

    /// Validate a request against the known devices and record it as pending
    pub async fn submit(&self, request: JobRequest, known_devices: &[DeviceId]) -> SchedResult<JobId> {
        request.validate(known_devices)?;

        let mut inner = self.inner.write().await;
        let id = inner.next_id.max(1);
        inner.next_id = id + 1;
        let submitted_at = inner.next_submitted_at();

        let job = Job::new(id, request, submitted_at);
        info!(
            job_id = id,
            name = %job.name,
            priority = job.priority,
            gpus = ?job.gpus,
            "Job submitted"
        );
        inner.jobs.insert(id, job);

        Ok(id)
    }

    /// Get a copy of one job
    pub async fn get(&self, id: JobId) -> SchedResult<Job> {
        self.inner
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or(SchedError::JobNotFound(id))
    }

    /// All jobs, ordered by id
    pub async fn list(&self) -> Vec<Job> {
        self.inner.read().await.jobs.values().cloned().collect()
    }

    /// Pending jobs in scheduling order
    pub async fn pending(&self) -> Vec<Job> {
        let mut pending: Vec<Job> = self
            .inner
            .read()
            .await
            .jobs
            .values()
            .filter(|job| job.state == JobState::Pending)
            .cloned()
            .collect();
        pending.sort_by(scheduling_order);
        pending
    }

    /// Running jobs, ordered by id
    pub async fn running(&self) -> Vec<Job> {
        self.inner
            .read()
            .await
            .jobs
            .values()
            .filter(|job| job.state == JobState::Running)
            .cloned()
            .collect()
    }

    /// Devices held by running jobs
    pub async fn held_devices(&self) -> BTreeMap<DeviceId, JobId> {
        let inner = self.inner.read().await;
        held_by_running(&inner.jobs)
    }

    /// Move a pending job to running on `gpu_ids`
    pub async fn mark_running(&self, id: JobId, gpu_ids: Vec<DeviceId>) -> SchedResult<Job> {
        if gpu_ids.is_empty() {
            return Err(SchedError::Internal(format!(
                "job {} cannot run without devices",
                id
            )));
        }

        let mut inner = self.inner.write().await;
        let held = held_by_running(&inner.jobs);
        if let Some((device, owner)) = gpu_ids
            .iter()
            .find_map(|d| held.get(d).map(|owner| (*d, *owner)))
        {
            return Err(SchedError::Internal(format!(
                "GPU {} is already held by job {}",
                device, owner
            )));
        }

        let job = inner.job_mut(id)?;
        check_transition(job, JobState::Running)?;

        job.state = JobState::Running;
        job.assigned_gpu_ids = gpu_ids;
        job.started_at = Some(Utc::now());

        debug!(job_id = id, gpus = ?job.assigned_gpu_ids, "Job marked running");
        Ok(job.clone())
    }

    /// Record process details of a launched job
    pub async fn record_launch(&self, handle: &ProcessHandle) -> SchedResult<()> {
        let mut inner = self.inner.write().await;
        let job = inner.job_mut(handle.job_id)?;
        job.pid = handle.pid;
        job.stdout_path = handle.stdout_path.clone();
        job.stderr_path = handle.stderr_path.clone();
        Ok(())
    }

    /// Move a job to a terminal state
    pub async fn mark_terminal(
        &self,
        id: JobId,
        state: JobState,
        exit_code: Option<i32>,
        reason: Option<String>,
    ) -> SchedResult<Job> {
        if !state.is_terminal() {
            return Err(SchedError::Internal(format!("{} is not a terminal state", state)));
        }

        let mut inner = self.inner.write().await;
        let job = inner.job_mut(id)?;
        check_transition(job, state)?;

        job.state = state;
        job.finished_at = Some(Utc::now());
        job.exit_code = exit_code;
        job.failure_reason = reason;

        Ok(job.clone())
    }

    /// Cancel a job
    ///
    /// Pending jobs are cancelled on the spot. Running jobs are only flagged;
    /// the scheduler loop signals the process and finalizes the job.
    pub async fn cancel(&self, id: JobId) -> SchedResult<CancelOutcome> {
        let mut inner = self.inner.write().await;
        let job = inner.job_mut(id)?;

        match job.state {
            JobState::Pending => {
                job.state = JobState::Cancelled;
                job.finished_at = Some(Utc::now());
                info!(job_id = id, "Pending job cancelled");
                Ok(CancelOutcome::Cancelled)
            }
            JobState::Running => {
                if !job.cancel_requested {
                    job.cancel_requested = true;
                    info!(job_id = id, "Cancellation requested for running job");
                }
                Ok(CancelOutcome::CancelRequested)
            }
            state => Err(SchedError::AlreadyTerminal { id, state }),
        }
    }

    /// Number of jobs per state
    pub async fn counts(&self) -> JobCounts {
        let inner = self.inner.read().await;
        let mut counts = JobCounts::default();
        for job in inner.jobs.values() {
            match job.state {
                JobState::Pending => counts.pending += 1,
                JobState::Running => counts.running += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}

fn held_by_running(jobs: &BTreeMap<JobId, Job>) -> BTreeMap<DeviceId, JobId> {
    jobs.values()
        .filter(|job| job.state == JobState::Running)
        .flat_map(|job| job.assigned_gpu_ids.iter().map(move |d| (*d, job.id)))
        .collect()
}

fn check_transition(job: &Job, next: JobState) -> SchedResult<()> {
    if job.state.is_terminal() {
        return Err(SchedError::AlreadyTerminal {
            id: job.id,
            state: job.state,
        });
    }
    if !job.state.can_transition_to(next) {
        return Err(SchedError::IllegalTransition {
            id: job.id,
            from: job.state,
            to: next,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpusched_core::GpuRequest;

    const KNOWN: [DeviceId; 4] = [0, 1, 2, 3];

    fn request(priority: i32) -> JobRequest {
        let mut request = JobRequest::new(vec!["true".to_string()], GpuRequest::Count(1));
        request.priority = priority;
        request
    }

    #[tokio::test]
    async fn test_submit_assigns_sequential_ids() {
        let store = JobStore::new();
        let a = store.submit(request(0), &KNOWN).await.unwrap();
        let b = store.submit(request(0), &KNOWN).await.unwrap();
        assert_eq!((a, b), (1, 2));

        let jobs = store.list().await;
        assert!(jobs[0].submitted_at < jobs[1].submitted_at);
        assert!(jobs.iter().all(|j| j.state == JobState::Pending));
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid() {
        let store = JobStore::new();
        let mut bad = request(0);
        bad.gpus = GpuRequest::ids([9]);
        assert!(matches!(
            store.submit(bad, &KNOWN).await,
            Err(SchedError::Validation(_))
        ));
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_pending_in_scheduling_order() {
        let store = JobStore::new();
        let low = store.submit(request(0), &KNOWN).await.unwrap();
        let high = store.submit(request(5), &KNOWN).await.unwrap();
        let low2 = store.submit(request(0), &KNOWN).await.unwrap();

        let order: Vec<JobId> = store.pending().await.iter().map(|j| j.id).collect();
        assert_eq!(order, vec![high, low, low2]);
    }

    #[tokio::test]
    async fn test_mark_running_enforces_exclusion() {
        let store = JobStore::new();
        let a = store.submit(request(0), &KNOWN).await.unwrap();
        let b = store.submit(request(0), &KNOWN).await.unwrap();

        let job = store.mark_running(a, vec![0, 1]).await.unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.started_at.is_some());

        assert!(store.mark_running(b, vec![1]).await.is_err());
        assert_eq!(store.get(b).await.unwrap().state, JobState::Pending);

        let held = store.held_devices().await;
        assert_eq!(held.get(&0), Some(&a));
        assert_eq!(held.get(&1), Some(&a));
        assert_eq!(held.len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_releases_devices() {
        let store = JobStore::new();
        let id = store.submit(request(0), &KNOWN).await.unwrap();
        store.mark_running(id, vec![2]).await.unwrap();

        let job = store
            .mark_terminal(id, JobState::Completed, Some(0), None)
            .await
            .unwrap();
        assert_eq!(job.exit_code, Some(0));
        assert!(job.finished_at.is_some());
        assert_eq!(job.assigned_gpu_ids, vec![2]);
        assert!(store.held_devices().await.is_empty());

        // Terminal states are absorbing
        assert!(matches!(
            store.mark_terminal(id, JobState::Failed, Some(1), None).await,
            Err(SchedError::AlreadyTerminal { .. })
        ));
    }

    #[tokio::test]
    async fn test_illegal_transitions() {
        let store = JobStore::new();
        let id = store.submit(request(0), &KNOWN).await.unwrap();

        assert!(matches!(
            store.mark_terminal(id, JobState::Completed, Some(0), None).await,
            Err(SchedError::IllegalTransition { .. })
        ));
        assert!(store.mark_terminal(id, JobState::Running, None, None).await.is_err());
        assert!(matches!(
            store.mark_running(99, vec![0]).await,
            Err(SchedError::JobNotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_cancel() {
        let store = JobStore::new();
        let pending = store.submit(request(0), &KNOWN).await.unwrap();
        let running = store.submit(request(0), &KNOWN).await.unwrap();
        store.mark_running(running, vec![0]).await.unwrap();

        assert_eq!(store.cancel(pending).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(store.get(pending).await.unwrap().state, JobState::Cancelled);

        assert_eq!(
            store.cancel(running).await.unwrap(),
            CancelOutcome::CancelRequested
        );
        assert_eq!(
            store.cancel(running).await.unwrap(),
            CancelOutcome::CancelRequested
        );
        let job = store.get(running).await.unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.cancel_requested);

        assert!(matches!(
            store.cancel(pending).await,
            Err(SchedError::AlreadyTerminal {
                state: JobState::Cancelled,
                ..
            })
        ));
        assert!(matches!(
            store.cancel(42).await,
            Err(SchedError::JobNotFound(42))
        ));

        // A cancelled pending job can no longer be scheduled
        assert!(store.mark_running(pending, vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn test_record_launch_and_counts() {
        let store = JobStore::new();
        let id = store.submit(request(0), &KNOWN).await.unwrap();
        store.submit(request(0), &KNOWN).await.unwrap();
        store.mark_running(id, vec![3]).await.unwrap();

        let mut handle = ProcessHandle::new(id);
        handle.pid = Some(4242);
        handle.stdout_path = Some("/tmp/out/1/stdout.txt".into());
        store.record_launch(&handle).await.unwrap();

        let job = store.get(id).await.unwrap();
        assert_eq!(job.pid, Some(4242));
        assert!(job.stdout_path.is_some());

        let counts = store.counts().await;
        assert_eq!(counts.running, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 2);
    }
}
