//! Process-based supervisor implementation
//!
//! Each job runs as a direct child process in its own process group,
//! with output redirected into the job's output directory.

use async_trait::async_trait;
use gpusched_core::{Job, JobId, RuntimeConfig, SchedError, SchedResult};
use gpusched_store::OutputStore;
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::limiter::MemoryLimiter;
use crate::traits::{ProcessHandle, ProcessStatus, Supervisor, TermSignal};

/// Process supervisor configuration
#[derive(Debug, Clone)]
pub struct ProcessSupervisorConfig {
    /// Variable that restricts visible devices
    pub visible_devices_env: String,
    /// Memory ceiling mechanism
    pub memory_limiter: MemoryLimiter,
}

impl Default for ProcessSupervisorConfig {
    fn default() -> Self {
        Self {
            visible_devices_env: "CUDA_VISIBLE_DEVICES".to_string(),
            memory_limiter: MemoryLimiter::None,
        }
    }
}

impl ProcessSupervisorConfig {
    pub fn from_runtime_config(config: &RuntimeConfig) -> Self {
        Self {
            visible_devices_env: config.visible_devices_env.clone(),
            memory_limiter: MemoryLimiter::from_kind(config.memory_limiter),
        }
    }
}

enum Tracked {
    Child(Child),
    LaunchFailed(String),
}

/// Supervisor for job processes
pub struct ProcessSupervisor {
    config: ProcessSupervisorConfig,
    output: OutputStore,
    /// Launched processes by job
    processes: Mutex<HashMap<JobId, Tracked>>,
}

impl ProcessSupervisor {
    /// Create a new process supervisor
    pub fn new(config: ProcessSupervisorConfig, output: OutputStore) -> Self {
        Self {
            config,
            output,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Build the command to start a job, without output redirection
    fn build_command(&self, job: &Job) -> Command {
        let argv = self
            .config
            .memory_limiter
            .wrap(&job.command, job.memory_limit_gb);

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);

        // Inherited environment, then the job's, then device visibility
        cmd.envs(&job.env);
        cmd.env(&self.config.visible_devices_env, job.visible_devices());

        if let Some(dir) = &job.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null());

        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }

    /// Number of processes still tracked
    pub async fn tracked_count(&self) -> usize {
        self.processes.lock().await.len()
    }
}

/// Open an output file for the child's stdio
async fn open_append(path: &Path) -> SchedResult<std::fs::File> {
    let file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await?;
    Ok(file.into_std().await)
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn prepare(&self) -> SchedResult<()> {
        self.output.init().await
    }

    async fn launch(&self, job: &Job) -> SchedResult<ProcessHandle> {
        if job.command.is_empty() {
            return Err(SchedError::Launch("empty command".to_string()));
        }

        let output = self.output.prepare(job.id).await?;
        let stdout = open_append(&output.stdout_path).await?;
        let stderr = open_append(&output.stderr_path).await?;

        let mut cmd = self.build_command(job);
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::from(stderr));

        let mut handle = ProcessHandle::new(job.id);
        handle.stdout_path = Some(output.stdout_path);
        handle.stderr_path = Some(output.stderr_path);

        let tracked = match cmd.spawn() {
            Ok(child) => {
                handle.pid = child.id();
                info!(
                    job_id = job.id,
                    pid = ?handle.pid,
                    gpus = %job.visible_devices(),
                    "Job process spawned"
                );
                Tracked::Child(child)
            }
            Err(e) => {
                error!(
                    job_id = job.id,
                    program = %job.command[0],
                    error = %e,
                    "Failed to spawn job process"
                );
                Tracked::LaunchFailed(format!("failed to start {}: {}", job.command[0], e))
            }
        };

        self.processes.lock().await.insert(job.id, tracked);
        Ok(handle)
    }

    async fn poll(&self, handle: &ProcessHandle) -> ProcessStatus {
        let mut processes = self.processes.lock().await;

        let status = match processes.get_mut(&handle.job_id) {
            None => {
                return ProcessStatus::LaunchFailed("no process tracked for job".to_string())
            }
            Some(Tracked::LaunchFailed(reason)) => ProcessStatus::LaunchFailed(reason.clone()),
            Some(Tracked::Child(child)) => match child.try_wait() {
                Ok(None) => return ProcessStatus::Running,
                Ok(Some(status)) => ProcessStatus::Exited(exit_code(status)),
                Err(e) => {
                    warn!(job_id = handle.job_id, error = %e, "Failed to query job process");
                    ProcessStatus::Exited(-1)
                }
            },
        };

        processes.remove(&handle.job_id);
        debug!(job_id = handle.job_id, status = ?status, "Job process finished");
        status
    }

    async fn terminate(&self, handle: &ProcessHandle, signal: TermSignal) -> SchedResult<()> {
        let mut processes = self.processes.lock().await;
        let Some(Tracked::Child(child)) = processes.get_mut(&handle.job_id) else {
            return Ok(());
        };
        let Some(pid) = child.id() else {
            // already reaped
            return Ok(());
        };

        info!(job_id = handle.job_id, pid = pid, signal = ?signal, "Signalling job process group");

        #[cfg(unix)]
        {
            let sig = match signal {
                TermSignal::Term => libc::SIGTERM,
                TermSignal::Kill => libc::SIGKILL,
            };
            // SAFETY: killpg has no memory-safety preconditions. The child is not
            // reaped yet, so its pid (which is also its pgid) cannot be reused.
            let rc = unsafe { libc::killpg(pid as libc::pid_t, sig) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(SchedError::Io(err));
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = signal;
            child.start_kill()?;
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }

    -1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::Utc;
    use gpusched_core::{GpuRequest, JobRequest};
    use std::time::Duration;

    fn supervisor(root: &std::path::Path) -> ProcessSupervisor {
        ProcessSupervisor::new(
            ProcessSupervisorConfig::default(),
            OutputStore::new(root.to_path_buf()),
        )
    }

    fn job(id: JobId, command: &[&str], gpus: Vec<u32>) -> Job {
        let request = JobRequest::new(
            command.iter().map(|s| s.to_string()).collect(),
            GpuRequest::ids(gpus.clone()),
        );
        let mut job = Job::new(id, request, Utc::now());
        job.assigned_gpu_ids = gpus;
        job
    }

    async fn wait_for_exit(sup: &ProcessSupervisor, handle: &ProcessHandle) -> ProcessStatus {
        for _ in 0..250 {
            let status = sup.poll(handle).await;
            if status != ProcessStatus::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("process did not exit in time");
    }

    #[test]
    fn test_build_command_environment() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let mut job = job(1, &["python", "train.py"], vec![0, 2]);
        job.env.insert("WANDB_MODE".to_string(), "offline".to_string());
        job.env
            .insert("CUDA_VISIBLE_DEVICES".to_string(), "7".to_string());
        job.working_dir = Some(tmp.path().to_path_buf());

        let cmd = sup.build_command(&job);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), std::ffi::OsStr::new("python"));

        let envs: HashMap<String, Option<String>> = std_cmd
            .get_envs()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().to_string(),
                    v.map(|v| v.to_string_lossy().to_string()),
                )
            })
            .collect();
        assert_eq!(envs["CUDA_VISIBLE_DEVICES"], Some("0,2".to_string()));
        assert_eq!(envs["WANDB_MODE"], Some("offline".to_string()));
        assert_eq!(std_cmd.get_current_dir(), Some(tmp.path()));
    }

    #[tokio::test]
    async fn test_open_append_keeps_existing_output() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stdout.txt");
        tokio::fs::write(&path, "first\n").await.unwrap();

        let mut file = open_append(&path).await.unwrap();
        std::io::Write::write_all(&mut file, b"second\n").unwrap();
        drop(file);

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "first\nsecond\n");

        let missing = open_append(&tmp.path().join("gone/stdout.txt")).await;
        assert!(matches!(missing, Err(SchedError::Io(_))));
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());

        let handle = sup.launch(&job(1, &["sh", "-c", "exit 3"], vec![0])).await.unwrap();
        assert!(handle.pid.is_some());
        assert_eq!(wait_for_exit(&sup, &handle).await, ProcessStatus::Exited(3));
        assert_eq!(sup.tracked_count().await, 0);
    }

    #[tokio::test]
    async fn test_output_and_visible_devices_captured() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());

        let handle = sup
            .launch(&job(
                2,
                &["sh", "-c", "echo devices=$CUDA_VISIBLE_DEVICES; echo oops >&2"],
                vec![1, 3],
            ))
            .await
            .unwrap();
        assert_eq!(wait_for_exit(&sup, &handle).await, ProcessStatus::Exited(0));

        let stdout_path = handle.stdout_path.unwrap();
        assert_eq!(stdout_path, tmp.path().join("2").join("stdout.txt"));
        let stdout = std::fs::read_to_string(stdout_path).unwrap();
        assert_eq!(stdout.trim(), "devices=1,3");
        let stderr = std::fs::read_to_string(handle.stderr_path.unwrap()).unwrap();
        assert_eq!(stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());

        let handle = sup
            .launch(&job(3, &["/definitely/not/a/binary"], vec![0]))
            .await
            .unwrap();
        assert!(handle.pid.is_none());
        assert!(matches!(
            sup.poll(&handle).await,
            ProcessStatus::LaunchFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_terminate_process_group() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());

        let handle = sup
            .launch(&job(4, &["sh", "-c", "sleep 30 & wait"], vec![0]))
            .await
            .unwrap();
        assert_eq!(sup.poll(&handle).await, ProcessStatus::Running);

        sup.terminate(&handle, TermSignal::Term).await.unwrap();
        assert_eq!(
            wait_for_exit(&sup, &handle).await,
            ProcessStatus::Exited(-libc::SIGTERM)
        );

        // Nothing left to signal
        sup.terminate(&handle, TermSignal::Kill).await.unwrap();
    }
}
