//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use gpusched_core::{DeviceId, GpuRequest, Job, JobId, JobRequest, JobState, SchedError};
use gpusched_scheduler::{CancelOutcome, EngineStatus, GpuReport, JobDetail, Scheduler};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    /// Lines of stdout included in job detail
    pub recent_output_lines: usize,
}

/// Create the API router
pub fn create_router(scheduler: Arc<Scheduler>, recent_output_lines: usize) -> Router {
    let state = Arc::new(AppState {
        scheduler,
        recent_output_lines,
    });

    Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/gpus", get(get_gpus))
        .route("/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn api_error(e: SchedError) -> ApiError {
    let status = match &e {
        SchedError::Validation(_) => StatusCode::BAD_REQUEST,
        SchedError::JobNotFound(_) => StatusCode::NOT_FOUND,
        SchedError::AlreadyTerminal { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// Command as a shell string or an argv array
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    /// Run through `sh -c`
    Shell(String),
    /// Run directly
    Argv(Vec<String>),
}

impl CommandSpec {
    fn into_argv(self) -> Vec<String> {
        match self {
            CommandSpec::Shell(line) if line.trim().is_empty() => Vec::new(),
            CommandSpec::Shell(line) => vec!["sh".to_string(), "-c".to_string(), line],
            CommandSpec::Argv(argv) => argv,
        }
    }
}

/// Request to submit a job
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub command: CommandSpec,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub num_gpus: Option<u32>,
    #[serde(default)]
    pub gpu_ids: Option<Vec<DeviceId>>,
    /// Memory ceiling in GB
    #[serde(default)]
    pub memory_limit: Option<u32>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl SubmitJobRequest {
    /// Resolve the device constraint and build a job request
    ///
    /// Non-empty `gpu_ids` win; otherwise `num_gpus`, defaulting to one.
    pub fn into_job_request(self) -> Result<JobRequest, SchedError> {
        let gpus = match self.gpu_ids {
            Some(ids) if !ids.is_empty() => {
                let gpus = GpuRequest::ids(ids);
                if let Some(n) = self.num_gpus {
                    if n as usize != gpus.device_count() {
                        return Err(SchedError::Validation(format!(
                            "num_gpus is {} but gpu_ids names {} devices",
                            n,
                            gpus.device_count()
                        )));
                    }
                }
                gpus
            }
            _ => GpuRequest::Count(self.num_gpus.unwrap_or(1)),
        };

        let mut request = JobRequest::new(self.command.into_argv(), gpus);
        request.name = self.name;
        request.memory_limit_gb = self.memory_limit;
        request.priority = self.priority;
        request.env = self.env;
        request.working_dir = self.working_dir;
        Ok(request)
    }
}

#[derive(Debug, Serialize)]
struct SubmitJobResponse {
    job_id: JobId,
}

/// Submit a job
async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    let request = req.into_job_request().map_err(api_error)?;
    let job_id = state.scheduler.submit(request).await.map_err(api_error)?;
    Ok(Json(SubmitJobResponse { job_id }))
}

/// Job as shown in listings
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub assigned_gpu_ids: Vec<DeviceId>,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
}

impl From<Job> for JobSummary {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            name: job.name,
            state: job.state,
            assigned_gpu_ids: job.assigned_gpu_ids,
            priority: job.priority,
            submitted_at: job.submitted_at,
            exit_code: job.exit_code,
        }
    }
}

#[derive(Debug, Serialize)]
struct JobListResponse {
    jobs: Vec<JobSummary>,
}

/// List all jobs
async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<JobListResponse> {
    let jobs = state
        .scheduler
        .list()
        .await
        .into_iter()
        .map(JobSummary::from)
        .collect();
    Json(JobListResponse { jobs })
}

#[derive(Debug, Serialize)]
struct JobDetailResponse {
    job: JobDetail,
}

/// Get one job with its recent output
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobDetailResponse>, ApiError> {
    let job = state
        .scheduler
        .job_detail(id, state.recent_output_lines)
        .await
        .map_err(api_error)?;
    Ok(Json(JobDetailResponse { job }))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    job_id: JobId,
    outcome: CancelOutcome,
}

/// Cancel a job
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<CancelResponse>, ApiError> {
    info!(job_id = id, "Cancel requested");
    let outcome = state.scheduler.cancel(id).await.map_err(api_error)?;
    Ok(Json(CancelResponse { job_id: id, outcome }))
}

/// Get device status
async fn get_gpus(State(state): State<Arc<AppState>>) -> Json<GpuReport> {
    Json(state.scheduler.gpu_status().await)
}

/// Get engine status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<EngineStatus> {
    Json(state.scheduler.status().await)
}
