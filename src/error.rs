//! Errors returned by supervisor control operations.

use serde::Serialize;
use thiserror::Error;

/// Why a control operation did not succeed.
///
/// Expected conditions (unknown name, already running, not running) are
/// variants here rather than panics, so callers can report them as-is.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("process not found: {0}")]
    NotFound(String),

    #[error("process {0} is already running")]
    AlreadyRunning(String),

    #[error("process {0} is not running")]
    NotRunning(String),

    #[error("invalid process definition: {0}")]
    Invalid(String),

    #[error("process {0} is already defined")]
    Duplicate(String),

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process {name} (pid {pid}) survived SIGKILL")]
    SurvivedKill { name: String, pid: u32 },

    #[error("{action} failed for: {}", .failed.join(", "))]
    Partial {
        action: &'static str,
        failed: Vec<String>,
    },
}

/// Serializable rendering of a control operation's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlOutcome {
    pub success: bool,
    pub message: String,
}

impl ControlOutcome {
    pub fn from_result<T>(result: &Result<T, ControlError>, ok_message: impl Into<String>) -> Self {
        match result {
            Ok(_) => Self {
                success: true,
                message: ok_message.into(),
            },
            Err(err) => Self {
                success: false,
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_lists_failed_names() {
        let err = ControlError::Partial {
            action: "start",
            failed: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "start failed for: a, b");
    }

    #[test]
    fn outcome_carries_reason() {
        let result: Result<(), ControlError> = Err(ControlError::NotFound("web".into()));
        let outcome = ControlOutcome::from_result(&result, "ok");
        assert!(!outcome.success);
        assert_eq!(outcome.message, "process not found: web");
    }
}
