//! Scheduler loop
//!
//! Each tick refreshes the device snapshot, reaps finished processes,
//! applies cancellations and then starts whatever pending work fits.
//! Ticks never overlap; the API talks to the store concurrently.

use chrono::{DateTime, Utc};
use gpusched_core::{
    DaemonConfig, DeviceId, DeviceSnapshot, GpuStatus, Job, JobId, JobRequest, JobState,
    SchedError, SchedResult, SchedulerConfig,
};
use gpusched_runtime::{
    device_query, ProcessHandle, ProcessStatus, ProcessSupervisor, ProcessSupervisorConfig,
    Supervisor, TermSignal,
};
use gpusched_store::{tail_lines, OutputStore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::allocator::{allocate, availability};
use crate::monitor::DeviceMonitor;
use crate::placement::{placement_for, PlacementStrategy};
use crate::store::{CancelOutcome, JobCounts, JobStore};

/// What a single tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The device snapshot used by this tick was degraded
    pub degraded: bool,
    /// Jobs that reached a terminal state
    pub finalized: Vec<(JobId, JobState)>,
    /// Jobs whose process was launched
    pub launched: Vec<JobId>,
    /// Termination signals sent for cancellations
    pub signals_sent: usize,
}

impl TickReport {
    /// Whether nothing changed
    pub fn is_idle(&self) -> bool {
        self.finalized.is_empty() && self.launched.is_empty() && self.signals_sent == 0
    }
}

/// A job with the tail of its standard output
#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub recent_output: Option<String>,
}

/// Device view served to clients
#[derive(Debug, Clone, Serialize)]
pub struct GpuReport {
    pub gpus: Vec<GpuStatus>,
    pub degraded: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Engine summary
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub running: bool,
    pub jobs: JobCounts,
    pub gpus_total: usize,
    pub gpus_available: usize,
    pub degraded: bool,
    pub device_backend: &'static str,
    pub supervisor: &'static str,
    pub placement: &'static str,
}

/// A launched process as seen by the loop
struct TrackedProcess {
    handle: ProcessHandle,
    terminate_sent_at: Option<Instant>,
    killed: bool,
}

impl TrackedProcess {
    fn new(handle: ProcessHandle) -> Self {
        Self {
            handle,
            terminate_sent_at: None,
            killed: false,
        }
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Scheduling engine
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<JobStore>,
    monitor: Arc<DeviceMonitor>,
    supervisor: Arc<dyn Supervisor>,
    placement: Arc<dyn PlacementStrategy>,
    /// Launched processes by job; held for the whole tick
    processes: Mutex<HashMap<JobId, TrackedProcess>>,
    worker: Mutex<Option<Worker>>,
}

impl Scheduler {
    /// Create a scheduler from its collaborators
    pub fn new(
        config: SchedulerConfig,
        store: Arc<JobStore>,
        monitor: Arc<DeviceMonitor>,
        supervisor: Arc<dyn Supervisor>,
        placement: Arc<dyn PlacementStrategy>,
    ) -> Self {
        info!(
            poll_interval_secs = config.poll_interval().as_secs(),
            device_backend = monitor.backend(),
            supervisor = supervisor.name(),
            placement = placement.name(),
            "Scheduler initialized"
        );

        Self {
            config,
            store,
            monitor,
            supervisor,
            placement,
            processes: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
        }
    }

    /// Build a scheduler with the real device query and process supervisor
    pub fn from_config(config: &DaemonConfig) -> SchedResult<Self> {
        let query = device_query(config.scheduler.device_backend)?;
        let monitor = DeviceMonitor::new(query, config.scheduler.query_timeout());

        let output = OutputStore::new(config.runtime.output_dir.clone());
        let supervisor = ProcessSupervisor::new(
            ProcessSupervisorConfig::from_runtime_config(&config.runtime),
            output,
        );

        Ok(Self::new(
            config.scheduler.clone(),
            Arc::new(JobStore::new()),
            Arc::new(monitor),
            Arc::new(supervisor),
            placement_for(config.scheduler.placement),
        ))
    }

    /// The job store
    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Check the supervisor, take a first snapshot and start ticking
    pub async fn start(self: &Arc<Self>) -> SchedResult<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(SchedError::Internal("scheduler already started".to_string()));
        }

        self.supervisor.prepare().await?;

        let snapshot = self.monitor.refresh().await;
        if snapshot.degraded {
            warn!(
                error = snapshot.error.as_deref().unwrap_or("unknown"),
                "Initial device query failed; jobs will wait for a successful query"
            );
        } else {
            info!(gpus = snapshot.device_count(), "Initial device snapshot taken");
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let interval = self.config.poll_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                // Shutdown is only observed between ticks
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                let report = engine.tick().await;
                if !report.is_idle() {
                    debug!(
                        launched = ?report.launched,
                        finalized = ?report.finalized,
                        signals = report.signals_sent,
                        "Tick finished"
                    );
                }
            }

            debug!("Scheduler loop exited");
        });

        *worker = Some(Worker { shutdown, task });
        info!("Scheduler started");
        Ok(())
    }

    /// Stop ticking; optionally signal every tracked process
    pub async fn stop(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            if let Err(e) = worker.task.await {
                error!(error = %e, "Scheduler loop panicked");
            }
        }

        if self.config.terminate_on_shutdown {
            let processes = self.processes.lock().await;
            for (job_id, tracked) in processes.iter() {
                info!(job_id = job_id, "Terminating job on shutdown");
                if let Err(e) = self
                    .supervisor
                    .terminate(&tracked.handle, TermSignal::Term)
                    .await
                {
                    warn!(job_id = job_id, error = %e, "Failed to terminate job");
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Whether the loop is running
    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    /// Run one scheduling pass
    pub async fn tick(&self) -> TickReport {
        let mut processes = self.processes.lock().await;
        let mut report = TickReport::default();

        let snapshot = self.monitor.refresh().await;
        report.degraded = snapshot.degraded;

        self.reap(&mut processes, &mut report).await;
        self.apply_cancellations(&mut processes, &mut report).await;
        self.schedule(&snapshot, &mut processes, &mut report).await;

        report
    }

    async fn reap(&self, processes: &mut HashMap<JobId, TrackedProcess>, report: &mut TickReport) {
        for job in self.store.running().await {
            let (state, exit_code, reason) = match processes.get(&job.id) {
                None => (
                    JobState::Failed,
                    None,
                    Some("process handle lost".to_string()),
                ),
                Some(tracked) => match self.supervisor.poll(&tracked.handle).await {
                    ProcessStatus::Running => continue,
                    ProcessStatus::LaunchFailed(reason) => (JobState::Failed, None, Some(reason)),
                    // Whatever the signal did to the exit code, we asked for it
                    ProcessStatus::Exited(code) if tracked.terminate_sent_at.is_some() => {
                        (JobState::Cancelled, Some(code), None)
                    }
                    ProcessStatus::Exited(0) => (JobState::Completed, Some(0), None),
                    ProcessStatus::Exited(code) => (
                        JobState::Failed,
                        Some(code),
                        Some(format!("exited with code {}", code)),
                    ),
                },
            };

            processes.remove(&job.id);
            self.finalize(job.id, state, exit_code, reason, report).await;
        }
    }

    async fn apply_cancellations(
        &self,
        processes: &mut HashMap<JobId, TrackedProcess>,
        report: &mut TickReport,
    ) {
        let grace = self.config.kill_grace();

        for job in self.store.running().await {
            if !job.cancel_requested {
                continue;
            }
            let Some(tracked) = processes.get_mut(&job.id) else {
                continue;
            };

            let signal = match tracked.terminate_sent_at {
                None => TermSignal::Term,
                Some(sent) if !tracked.killed && sent.elapsed() >= grace => TermSignal::Kill,
                Some(_) => continue,
            };

            match self.supervisor.terminate(&tracked.handle, signal).await {
                Ok(()) => {
                    match signal {
                        TermSignal::Term => tracked.terminate_sent_at = Some(Instant::now()),
                        TermSignal::Kill => tracked.killed = true,
                    }
                    report.signals_sent += 1;
                    info!(job_id = job.id, signal = ?signal, "Cancellation signal sent");
                }
                // Retried next tick
                Err(e) => error!(job_id = job.id, error = %e, "Failed to signal job"),
            }
        }
    }

    async fn schedule(
        &self,
        snapshot: &DeviceSnapshot,
        processes: &mut HashMap<JobId, TrackedProcess>,
        report: &mut TickReport,
    ) {
        if snapshot.degraded {
            debug!("Device snapshot degraded, not assigning new jobs");
            return;
        }

        let pending = self.store.pending().await;
        if pending.is_empty() {
            return;
        }

        let held = self.store.held_devices().await;
        let devices = availability(snapshot, &self.config.thresholds(), &held);
        let allocations = allocate(&devices, &pending, self.placement.as_ref());

        for allocation in allocations {
            // Running before launch, so a cancel from now on targets the process
            let job = match self
                .store
                .mark_running(allocation.job_id, allocation.gpu_ids)
                .await
            {
                Ok(job) => job,
                Err(e) => {
                    debug!(job_id = allocation.job_id, error = %e, "Skipping allocation");
                    continue;
                }
            };

            match self.supervisor.launch(&job).await {
                Ok(handle) => {
                    if let Err(e) = self.store.record_launch(&handle).await {
                        warn!(job_id = job.id, error = %e, "Failed to record launch");
                    }
                    info!(
                        job_id = job.id,
                        name = %job.name,
                        gpus = ?job.assigned_gpu_ids,
                        "Job started"
                    );
                    processes.insert(job.id, TrackedProcess::new(handle));
                    report.launched.push(job.id);
                }
                Err(e) => {
                    error!(job_id = job.id, error = %e, "Failed to launch job");
                    self.finalize(job.id, JobState::Failed, None, Some(e.to_string()), report)
                        .await;
                }
            }
        }
    }

    async fn finalize(
        &self,
        job_id: JobId,
        state: JobState,
        exit_code: Option<i32>,
        reason: Option<String>,
        report: &mut TickReport,
    ) {
        match self
            .store
            .mark_terminal(job_id, state, exit_code, reason)
            .await
        {
            Ok(job) => {
                info!(
                    job_id = job_id,
                    state = %state,
                    exit_code = ?exit_code,
                    reason = job.failure_reason.as_deref().unwrap_or(""),
                    "Job finished"
                );
                report.finalized.push((job_id, state));
            }
            Err(e) => error!(job_id = job_id, error = %e, "Failed to finalize job"),
        }
    }

    /// Submit a job; it waits for the next tick
    pub async fn submit(&self, mut request: JobRequest) -> SchedResult<JobId> {
        if request.memory_limit_gb.is_none() {
            request.memory_limit_gb = self.config.default_memory_limit_gb;
        }

        let snapshot = self.monitor.snapshot().await;
        let known: Vec<DeviceId> = snapshot.devices.keys().copied().collect();
        self.store.submit(request, &known).await
    }

    /// All jobs, ordered by id
    pub async fn list(&self) -> Vec<Job> {
        self.store.list().await
    }

    /// One job
    pub async fn get(&self, id: JobId) -> SchedResult<Job> {
        self.store.get(id).await
    }

    /// One job with the last `lines` lines of its standard output
    pub async fn job_detail(&self, id: JobId, lines: usize) -> SchedResult<JobDetail> {
        let job = self.store.get(id).await?;

        let recent_output = match &job.stdout_path {
            Some(path) => match tail_lines(path, lines).await {
                Ok(tail) => Some(tail),
                Err(e) => {
                    warn!(job_id = id, error = %e, "Failed to read job output");
                    None
                }
            },
            None => None,
        };

        Ok(JobDetail { job, recent_output })
    }

    /// Cancel a job
    pub async fn cancel(&self, id: JobId) -> SchedResult<CancelOutcome> {
        self.store.cancel(id).await
    }

    /// Devices with their availability
    pub async fn gpu_status(&self) -> GpuReport {
        let snapshot = self.monitor.snapshot().await;
        let held = self.store.held_devices().await;
        let gpus = availability(&snapshot, &self.config.thresholds(), &held)
            .into_values()
            .collect();

        GpuReport {
            gpus,
            degraded: snapshot.degraded,
            updated_at: snapshot.updated_at,
            error: snapshot.error,
        }
    }

    /// Engine summary
    pub async fn status(&self) -> EngineStatus {
        let report = self.gpu_status().await;

        EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            running: self.is_running().await,
            jobs: self.store.counts().await,
            gpus_total: report.gpus.len(),
            gpus_available: report.gpus.iter().filter(|g| g.available).count(),
            degraded: report.degraded,
            device_backend: self.monitor.backend(),
            supervisor: self.supervisor.name(),
            placement: self.placement.name(),
        }
    }
}
