//! Error types for the sandbox engine.
//!
//! Only `PolicyDenied`, `ContainerCreateFailed` and repeated
//! `ExecRejectedCapacity` are meant to reach an end user. Everything else
//! either self-heals (crash backoff, drift) or degrades to a warning.

use thiserror::Error;

pub type SandboxResult<T> = Result<T, SandboxError>;

#[derive(Error, Debug)]
pub enum SandboxError {
    /// Sandboxing was required but is unavailable for a non-local caller.
    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    /// The container runtime cannot be reached.
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Failed to create container {name}: {reason}")]
    ContainerCreateFailed { name: String, reason: String },

    /// Timeout or disconnect while an exec was in flight.
    #[error("Exec interrupted: {0}")]
    ExecTransient(String),

    /// The pre-exec guard predicted process exhaustion.
    #[error("Container {name} is busy ({processes}/{limit} processes), retry later")]
    ExecRejectedCapacity {
        name: String,
        processes: u32,
        limit: u32,
    },

    #[error("Container {name} crashed (exit code {exit_code:?}, oom: {oom_killed})")]
    ContainerCrashed {
        name: String,
        exit_code: Option<i64>,
        oom_killed: bool,
    },

    /// Rejected at the trust boundary: never retried.
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Unknown trust level: {0:?}")]
    UnknownTrustLevel(String),

    #[error("Named environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("Invalid environment name: {0:?}")]
    InvalidEnvironmentName(String),

    /// A runtime CLI call exited non-zero.
    #[error("{command} failed: {stderr}")]
    Runtime { command: String, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Whether the caller may retry the same request against the same
    /// container.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SandboxError::ExecTransient(_) | SandboxError::ExecRejectedCapacity { .. }
        )
    }

    /// Whether this failure is surfaced to the end user rather than being
    /// absorbed by fallback or self-healing.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            SandboxError::PolicyDenied(_)
                | SandboxError::ContainerCreateFailed { .. }
                | SandboxError::ExecRejectedCapacity { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(SandboxError::ExecTransient("timeout".into()).is_retriable());
        assert!(SandboxError::ExecRejectedCapacity {
            name: "c".into(),
            processes: 250,
            limit: 256,
        }
        .is_retriable());
        assert!(!SandboxError::InvalidIdentifier("../etc".into()).is_retriable());
        assert!(!SandboxError::PolicyDenied("no".into()).is_retriable());
        assert!(!SandboxError::ContainerCreateFailed {
            name: "c".into(),
            reason: "boom".into(),
        }
        .is_retriable());
    }

    #[test]
    fn test_user_visible_classification() {
        assert!(SandboxError::PolicyDenied("no".into()).is_user_visible());
        assert!(!SandboxError::RuntimeUnavailable("gone".into()).is_user_visible());
        assert!(!SandboxError::ContainerCrashed {
            name: "c".into(),
            exit_code: Some(137),
            oom_killed: true,
        }
        .is_user_visible());
    }

    #[test]
    fn test_capacity_message_mentions_retry() {
        let err = SandboxError::ExecRejectedCapacity {
            name: "fluux-sandbox-default".into(),
            processes: 240,
            limit: 256,
        };
        assert!(err.to_string().contains("retry later"));
    }
}
