//! Per-job output directories

use gpusched_core::{JobId, SchedError, SchedResult};
use serde::Serialize;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

const STDOUT_FILE: &str = "stdout.txt";
const STDERR_FILE: &str = "stderr.txt";

/// How much of a file's tail is read when extracting recent lines
const TAIL_WINDOW_BYTES: u64 = 256 * 1024;

/// Output file locations for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutput {
    /// Directory holding the job's files
    pub dir: PathBuf,
    /// Captured standard output
    pub stdout_path: PathBuf,
    /// Captured standard error
    pub stderr_path: PathBuf,
}

/// Output directory manager
#[derive(Debug, Clone)]
pub struct OutputStore {
    /// Root directory; one subdirectory per job id
    root: PathBuf,
}

impl OutputStore {
    /// Create a new output store rooted at `root`
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and make sure it is writable
    ///
    /// Failing here means no job could ever capture output.
    pub async fn init(&self) -> SchedResult<()> {
        if !self.root.exists() {
            tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
                SchedError::Config(format!(
                    "cannot create output directory {}: {}",
                    self.root.display(),
                    e
                ))
            })?;
            info!(path = %self.root.display(), "Created output directory");
        }

        let probe = self.root.join(".write-probe");
        tokio::fs::write(&probe, b"").await.map_err(|e| {
            SchedError::Config(format!(
                "output directory {} is not writable: {}",
                self.root.display(),
                e
            ))
        })?;
        tokio::fs::remove_file(&probe).await?;

        Ok(())
    }

    /// Locations for a job, without touching the filesystem
    pub fn paths(&self, job_id: JobId) -> JobOutput {
        let dir = self.root.join(job_id.to_string());
        JobOutput {
            stdout_path: dir.join(STDOUT_FILE),
            stderr_path: dir.join(STDERR_FILE),
            dir,
        }
    }

    /// Create the job directory and empty output files
    pub async fn prepare(&self, job_id: JobId) -> SchedResult<JobOutput> {
        let output = self.paths(job_id);
        tokio::fs::create_dir_all(&output.dir).await?;
        tokio::fs::File::create(&output.stdout_path).await?;
        tokio::fs::File::create(&output.stderr_path).await?;

        debug!(
            job_id = job_id,
            dir = %output.dir.display(),
            "Prepared job output directory"
        );

        Ok(output)
    }
}

/// Last `lines` lines of a file; empty if the file does not exist
pub async fn tail_lines(path: &Path, lines: usize) -> SchedResult<String> {
    if lines == 0 {
        return Ok(String::new());
    }

    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e.into()),
    };

    let len = file.metadata().await?.len();
    let start = len.saturating_sub(TAIL_WINDOW_BYTES);
    file.seek(SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).await?;
    let text = String::from_utf8_lossy(&buf);

    let mut all: Vec<&str> = text.lines().collect();
    if start > 0 && !all.is_empty() {
        // first line was cut by the window
        all.remove(0);
    }

    let skip = all.len().saturating_sub(lines);
    let mut tail = all[skip..].join("\n");
    if !tail.is_empty() && text.ends_with('\n') {
        tail.push('\n');
    }
    Ok(tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_creates_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = OutputStore::new(tmp.path().join("output"));
        store.init().await.unwrap();

        let output = store.prepare(12).await.unwrap();
        assert_eq!(output.dir, tmp.path().join("output").join("12"));
        assert!(output.stdout_path.ends_with("12/stdout.txt"));
        assert!(output.stderr_path.ends_with("12/stderr.txt"));
        assert!(output.stdout_path.exists());
        assert!(output.stderr_path.exists());
    }

    #[tokio::test]
    async fn test_prepare_truncates_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = OutputStore::new(tmp.path().to_path_buf());

        let output = store.prepare(1).await.unwrap();
        tokio::fs::write(&output.stdout_path, "old run\n").await.unwrap();

        let output = store.prepare(1).await.unwrap();
        let content = tokio::fs::read_to_string(&output.stdout_path).await.unwrap();
        assert!(content.is_empty());
    }

    #[tokio::test]
    async fn test_init_rejects_file_root() {
        let tmp = tempfile::tempdir().unwrap();
        let not_a_dir = tmp.path().join("plain-file");
        std::fs::write(&not_a_dir, "x").unwrap();

        let store = OutputStore::new(not_a_dir);
        assert!(matches!(store.init().await, Err(SchedError::Config(_))));
    }

    #[tokio::test]
    async fn test_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let store = OutputStore::new(tmp.path().to_path_buf());
        let output = store.prepare(3).await.unwrap();

        let content: String = (1..=100).map(|i| format!("line {}\n", i)).collect();
        tokio::fs::write(&output.stdout_path, content).await.unwrap();

        let tail = tail_lines(&output.stdout_path, 3).await.unwrap();
        assert_eq!(tail, "line 98\nline 99\nline 100\n");

        let everything = tail_lines(&output.stdout_path, 500).await.unwrap();
        assert!(everything.starts_with("line 1\n"));
    }

    #[tokio::test]
    async fn test_tail_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let tail = tail_lines(&tmp.path().join("nope.txt"), 10).await.unwrap();
        assert!(tail.is_empty());
    }
}
