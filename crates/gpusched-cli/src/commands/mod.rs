//! CLI commands implementation

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use gpusched_core::{GpuStatus, Job, JobId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Parse a `KEY=VALUE` pair
pub fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid KEY=VALUE: no `=` found in `{}`", s)),
    }
}

/// Body of a job submission
#[derive(Debug, Serialize)]
pub struct SubmitBody {
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_gpus: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gpu_ids: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u32>,
    pub priority: i32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: JobId,
}

/// Job row from the listing
#[derive(Debug, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub state: String,
    pub assigned_gpu_ids: Vec<u32>,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct JobListResponse {
    jobs: Vec<JobSummary>,
}

/// Job detail with recent output
#[derive(Debug, Deserialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub recent_output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobDetailResponse {
    job: JobDetail,
}

#[derive(Debug, Deserialize)]
struct CancelResponse {
    job_id: JobId,
    outcome: String,
}

/// GPU status response
#[derive(Debug, Deserialize)]
pub struct GpuReport {
    pub gpus: Vec<GpuStatus>,
    pub degraded: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Per-state job counts
#[derive(Debug, Deserialize)]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Scheduler status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub running: bool,
    pub jobs: JobCounts,
    pub gpus_total: usize,
    pub gpus_available: usize,
    pub degraded: bool,
    pub device_backend: String,
    pub supervisor: String,
    pub placement: String,
}

/// Submit a job
pub async fn submit(client: &ApiClient, body: &SubmitBody) -> Result<()> {
    let response = client
        .client
        .post(client.url("/jobs"))
        .json(body)
        .send()
        .await?;

    if response.status().is_success() {
        let result: SubmitResponse = response.json().await?;
        println!("Job submitted with ID: {}", result.job_id);
    } else {
        let error = response.text().await?;
        eprintln!("Error submitting job: {}", error);
    }

    Ok(())
}

/// List all jobs
pub async fn list(client: &ApiClient) -> Result<()> {
    let response = client.client.get(client.url("/jobs")).send().await?;

    if response.status().is_success() {
        let list: JobListResponse = response.json().await?;

        if list.jobs.is_empty() {
            println!("No jobs found");
        } else {
            println!(
                "{:<8} {:<20} {:<10} {:<10} {:<5} {:<5} {:<20}",
                "JOB ID", "NAME", "STATUS", "GPUs", "PRIO", "EXIT", "SUBMITTED"
            );
            println!("{}", "-".repeat(82));
            for job in list.jobs {
                println!(
                    "{:<8} {:<20} {:<10} {:<10} {:<5} {:<5} {:<20}",
                    job.id,
                    truncate(&job.name, 20),
                    job.state,
                    gpu_list(&job.assigned_gpu_ids),
                    job.priority,
                    job.exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    local_time(&job.submitted_at)
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Error listing jobs: {}", error);
    }

    Ok(())
}

/// Show one job in detail
pub async fn status(client: &ApiClient, job_id: JobId) -> Result<()> {
    let response = client
        .client
        .get(client.url(&format!("/jobs/{}", job_id)))
        .send()
        .await?;

    if response.status().is_success() {
        let detail: JobDetailResponse = response.json().await?;
        print_job_details(&detail.job);
    } else {
        let error = response.text().await?;
        eprintln!("Error getting job status: {}", error);
    }

    Ok(())
}

/// Cancel a job
pub async fn cancel(client: &ApiClient, job_id: JobId) -> Result<()> {
    let response = client
        .client
        .post(client.url(&format!("/jobs/{}/cancel", job_id)))
        .send()
        .await?;

    if response.status().is_success() {
        let result: CancelResponse = response.json().await?;
        match result.outcome.as_str() {
            "cancelled" => println!("Job {} cancelled successfully.", result.job_id),
            _ => println!(
                "Job {} is running; it will be terminated shortly.",
                result.job_id
            ),
        }
    } else {
        let error = response.text().await?;
        eprintln!("Error cancelling job: {}", error);
    }

    Ok(())
}

/// Show GPU status
pub async fn gpus(client: &ApiClient) -> Result<()> {
    let response = client.client.get(client.url("/gpus")).send().await?;

    if response.status().is_success() {
        let report: GpuReport = response.json().await?;

        if report.degraded {
            println!(
                "Warning: device data is stale ({})",
                report.error.as_deref().unwrap_or("query failed")
            );
        }
        if let Some(at) = &report.updated_at {
            println!("Last updated: {}", local_time(at));
        }

        println!(
            "{:<8} {:<20} {:<18} {:<8} {:<6} {:<10}",
            "GPU ID", "NAME", "MEMORY", "UTIL %", "TEMP", "JOB"
        );
        println!("{}", "-".repeat(76));
        for gpu in report.gpus {
            let memory = format!(
                "{}/{} MB",
                gpu.device.total_memory_mb.saturating_sub(gpu.device.free_memory_mb),
                gpu.device.total_memory_mb
            );
            let temperature = gpu
                .device
                .temperature_c
                .map(|t| format!("{}C", t))
                .unwrap_or_else(|| "-".to_string());
            let job = match (gpu.assigned_job_id, gpu.available) {
                (Some(id), _) => id.to_string(),
                (None, true) => "free".to_string(),
                (None, false) => "busy".to_string(),
            };
            println!(
                "{:<8} {:<20} {:<18} {:<8} {:<6} {:<10}",
                gpu.device.id,
                truncate(&gpu.device.name, 20),
                memory,
                gpu.device.utilization_percent,
                temperature,
                job
            );
        }
    } else {
        let error = response.text().await?;
        eprintln!("Error getting GPU status: {}", error);
    }

    Ok(())
}

/// Show scheduler status
pub async fn info(client: &ApiClient) -> Result<()> {
    let response = client.client.get(client.url("/status")).send().await?;

    if response.status().is_success() {
        let status: StatusResponse = response.json().await?;

        println!("gpusched v{}", status.version);
        println!();
        println!(
            "Scheduler: {} ({} placement, {} devices, {} supervisor)",
            if status.running { "running" } else { "stopped" },
            status.placement,
            status.device_backend,
            status.supervisor
        );
        println!(
            "GPUs: {} total, {} available{}",
            status.gpus_total,
            status.gpus_available,
            if status.degraded { " (stale)" } else { "" }
        );
        println!(
            "Jobs: {} pending, {} running, {} completed, {} failed, {} cancelled",
            status.jobs.pending,
            status.jobs.running,
            status.jobs.completed,
            status.jobs.failed,
            status.jobs.cancelled
        );
    } else {
        let error = response.text().await?;
        eprintln!("Error getting status: {}", error);
    }

    Ok(())
}

fn print_job_details(detail: &JobDetail) {
    let job = &detail.job;

    println!("Job ID: {}", job.id);
    println!("Name: {}", job.name);
    println!("Status: {}", job.state);
    println!("Command: {}", job.command.join(" "));
    if job.assigned_gpu_ids.is_empty() {
        println!("GPUs: (not assigned)");
    } else {
        println!("GPUs: {}", gpu_list(&job.assigned_gpu_ids));
    }
    match job.memory_limit_gb {
        Some(gb) => println!("Memory Limit: {} GB", gb),
        None => println!("Memory Limit: none"),
    }
    println!("Priority: {}", job.priority);
    println!("Submit Time: {}", local_time(&job.submitted_at));
    if let Some(at) = &job.started_at {
        println!("Start Time: {}", local_time(at));
    }
    if let Some(at) = &job.finished_at {
        println!("End Time: {}", local_time(at));
    }
    if let Some(code) = job.exit_code {
        println!("Exit Code: {}", code);
    }
    if let Some(reason) = &job.failure_reason {
        println!("Reason: {}", reason);
    }
    if let Some(path) = &job.stdout_path {
        println!("Stdout: {}", path.display());
    }

    if let Some(output) = detail.recent_output.as_deref().filter(|o| !o.is_empty()) {
        println!("\nRecent Output:");
        println!("{}", "-".repeat(40));
        println!("{}", output.trim_end());
    }
}

fn gpu_list(ids: &[u32]) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn local_time(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_env() {
        assert_eq!(
            parse_env("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert_eq!(parse_env("EMPTY=").unwrap(), ("EMPTY".to_string(), String::new()));
        assert!(parse_env("novalue").is_err());
        assert!(parse_env("=x").is_err());
    }

    #[test]
    fn test_submit_body_omits_unset_fields() {
        let body = SubmitBody {
            command: vec!["python".to_string(), "train.py".to_string()],
            name: None,
            num_gpus: None,
            gpu_ids: vec![1, 3],
            memory_limit: Some(8),
            priority: 2,
            env: BTreeMap::new(),
            working_dir: None,
        };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "command": ["python", "train.py"],
                "gpu_ids": [1, 3],
                "memory_limit": 8,
                "priority": 2
            })
        );
    }

    #[test]
    fn test_job_detail_decodes() {
        let detail: JobDetailResponse = serde_json::from_value(json!({
            "job": {
                "id": 3,
                "name": "job-3",
                "command": ["true"],
                "gpus": {"count": 1},
                "memory_limit_gb": 5,
                "priority": 0,
                "env": {},
                "working_dir": null,
                "state": "completed",
                "cancel_requested": false,
                "assigned_gpu_ids": [0],
                "submitted_at": "2024-05-01T10:00:00Z",
                "started_at": "2024-05-01T10:00:05Z",
                "finished_at": "2024-05-01T10:01:00Z",
                "exit_code": 0,
                "failure_reason": null,
                "pid": 1234,
                "stdout_path": "/tmp/out/3/stdout.txt",
                "stderr_path": "/tmp/out/3/stderr.txt",
                "recent_output": "done\n"
            }
        }))
        .unwrap();

        assert_eq!(detail.job.job.id, 3);
        assert_eq!(detail.job.job.exit_code, Some(0));
        assert_eq!(detail.job.recent_output.as_deref(), Some("done\n"));
    }

    #[test]
    fn test_helpers() {
        assert_eq!(gpu_list(&[]), "-");
        assert_eq!(gpu_list(&[0, 2]), "0,2");
        assert_eq!(truncate("abcdef", 3), "abc");
    }
}
