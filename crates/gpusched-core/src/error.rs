//! Error types for gpusched

use thiserror::Error;

use crate::job::{JobId, JobState};

/// Main error type for gpusched
#[derive(Error, Debug)]
pub enum SchedError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected job submission
    #[error("Invalid job request: {0}")]
    Validation(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Job already reached a terminal state
    #[error("Job {id} is already {state}")]
    AlreadyTerminal { id: JobId, state: JobState },

    /// State machine violation
    #[error("Illegal transition for job {id}: {from} -> {to}")]
    IllegalTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    /// Process could not be prepared or started
    #[error("Launch error: {0}")]
    Launch(String),

    /// Device query failed or timed out
    #[error("Device query error: {0}")]
    DeviceQuery(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpusched operations
pub type SchedResult<T> = Result<T, SchedError>;

impl From<serde_json::Error> for SchedError {
    fn from(err: serde_json::Error) -> Self {
        SchedError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SchedError {
    fn from(err: toml::de::Error) -> Self {
        SchedError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedError::Config("invalid config".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid config");

        let err = SchedError::AlreadyTerminal {
            id: 7,
            state: JobState::Completed,
        };
        assert_eq!(err.to_string(), "Job 7 is already completed");

        let err = SchedError::IllegalTransition {
            id: 3,
            from: JobState::Pending,
            to: JobState::Completed,
        };
        assert_eq!(
            err.to_string(),
            "Illegal transition for job 3: pending -> completed"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SchedError = io_err.into();
        assert!(matches!(err, SchedError::Io(_)));
    }

    #[test]
    fn test_error_from_toml() {
        let err: SchedError = toml::from_str::<toml::Value>("= broken")
            .unwrap_err()
            .into();
        assert!(matches!(err, SchedError::Config(_)));
    }
}
