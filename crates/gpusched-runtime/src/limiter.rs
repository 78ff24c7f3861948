//! Memory ceiling enforcement
//!
//! The ceiling is applied by wrapping the job's argv, either in a
//! transient systemd scope or in a shell that sets `ulimit -v`.

use gpusched_core::MemoryLimiterKind;
use std::path::Path;
use tracing::debug;

/// How a job's memory ceiling is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLimiter {
    /// `systemd-run --user --scope -p MemoryMax=<n>G`
    SystemdRun,
    /// `sh -c 'ulimit -v <KiB> && exec "$@"'`
    Ulimit,
    /// Run the command as-is
    None,
}

impl MemoryLimiter {
    /// Resolve the configured kind, probing `PATH` for `auto`
    pub fn from_kind(kind: MemoryLimiterKind) -> Self {
        match kind {
            MemoryLimiterKind::SystemdRun => MemoryLimiter::SystemdRun,
            MemoryLimiterKind::Ulimit => MemoryLimiter::Ulimit,
            MemoryLimiterKind::None => MemoryLimiter::None,
            MemoryLimiterKind::Auto => {
                let limiter = if on_path("systemd-run") {
                    MemoryLimiter::SystemdRun
                } else {
                    MemoryLimiter::Ulimit
                };
                debug!(limiter = ?limiter, "Resolved memory limiter");
                limiter
            }
        }
    }

    /// Argv that runs `command` under a ceiling of `limit_gb`
    pub fn wrap(&self, command: &[String], limit_gb: Option<u32>) -> Vec<String> {
        let Some(gb) = limit_gb else {
            return command.to_vec();
        };

        match self {
            MemoryLimiter::None => command.to_vec(),
            MemoryLimiter::SystemdRun => {
                let mut argv = vec![
                    "systemd-run".to_string(),
                    "--user".to_string(),
                    "--scope".to_string(),
                    "--quiet".to_string(),
                    format!("--property=MemoryMax={}G", gb),
                    "--".to_string(),
                ];
                argv.extend(command.iter().cloned());
                argv
            }
            MemoryLimiter::Ulimit => {
                let kib = u64::from(gb) * 1024 * 1024;
                let mut argv = vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("ulimit -v {} && exec \"$@\"", kib),
                    "sh".to_string(),
                ];
                argv.extend(command.iter().cloned());
                argv
            }
        }
    }
}

fn on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| is_file(&dir.join(program)))
        })
        .unwrap_or(false)
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> Vec<String> {
        vec!["python".to_string(), "train.py".to_string(), "--epochs=3".to_string()]
    }

    #[test]
    fn test_systemd_run_wrap() {
        let argv = MemoryLimiter::SystemdRun.wrap(&command(), Some(8));
        assert_eq!(argv[0], "systemd-run");
        assert!(argv.contains(&"--property=MemoryMax=8G".to_string()));
        assert_eq!(&argv[argv.len() - 3..], command().as_slice());
        assert_eq!(argv[argv.len() - 4], "--");
    }

    #[test]
    fn test_ulimit_wrap() {
        let argv = MemoryLimiter::Ulimit.wrap(&command(), Some(2));
        assert_eq!(argv[0], "sh");
        assert_eq!(argv[2], "ulimit -v 2097152 && exec \"$@\"");
        assert_eq!(argv[3], "sh");
        assert_eq!(&argv[4..], command().as_slice());
    }

    #[test]
    fn test_no_limit_passthrough() {
        assert_eq!(MemoryLimiter::Ulimit.wrap(&command(), None), command());
        assert_eq!(MemoryLimiter::None.wrap(&command(), Some(4)), command());
    }

    #[test]
    fn test_from_kind() {
        assert_eq!(
            MemoryLimiter::from_kind(MemoryLimiterKind::Ulimit),
            MemoryLimiter::Ulimit
        );
        assert_eq!(
            MemoryLimiter::from_kind(MemoryLimiterKind::None),
            MemoryLimiter::None
        );
        let auto = MemoryLimiter::from_kind(MemoryLimiterKind::Auto);
        assert_ne!(auto, MemoryLimiter::None);
    }
}
