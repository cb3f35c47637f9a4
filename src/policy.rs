//! Execution-mode resolution.
//!
//! Decides whether a session runs directly on the host or inside a
//! container, from the requested trust level, the session origin and
//! whether the container runtime is reachable.
//!
//! The asymmetry is the security contract: a local caller silently degrades
//! to direct execution when the runtime is missing, an external caller is
//! rejected outright.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{SandboxError, SandboxResult};

/// Where a session was started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    /// Local UI or CLI on the same host
    Local,
    /// Protocol adapter (chat platform, remote client)
    External,
}

/// Canonical trust level, after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Sandboxed,
    Direct,
}

/// The environment a session actually runs in.
pub type ExecutionMode = TrustLevel;

impl TrustLevel {
    /// The one mapping from stored/requested strings to a trust level.
    ///
    /// Older names for the sandboxed level are accepted. Direct has exactly
    /// one spelling, and anything unrecognized is an error, so no alias or
    /// typo can silently grant host access.
    pub fn normalize(raw: &str) -> SandboxResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sandboxed" | "sandbox" | "container" | "isolated" | "restricted" => {
                Ok(TrustLevel::Sandboxed)
            }
            "direct" => Ok(TrustLevel::Direct),
            _ => Err(SandboxError::UnknownTrustLevel(raw.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrustLevel::Sandboxed => "sandboxed",
            TrustLevel::Direct => "direct",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for SessionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionSource::Local => f.write_str("local"),
            SessionSource::External => f.write_str("external"),
        }
    }
}

/// A request to run work for a session. Built once by the caller and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub session_id: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub named_env_slug: Option<String>,
    pub session_source: SessionSource,
    /// Raw value as stored or sent by the client; normalized on resolve.
    pub requested_trust_level: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Resolved execution mode for one session. Downstream capability filtering
/// reads `effective_mode`, never the requested level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub effective_mode: ExecutionMode,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Pure resolution of the execution mode.
pub struct PolicyResolver;

impl PolicyResolver {
    pub fn resolve(
        requested: &str,
        source: SessionSource,
        runtime_available: bool,
    ) -> SandboxResult<ExecutionOutcome> {
        let level = TrustLevel::normalize(requested)?;

        match (level, runtime_available, source) {
            (TrustLevel::Direct, _, _) => Ok(ExecutionOutcome {
                effective_mode: TrustLevel::Direct,
                container_name: None,
                warnings: Vec::new(),
            }),
            (TrustLevel::Sandboxed, true, _) => Ok(ExecutionOutcome {
                effective_mode: TrustLevel::Sandboxed,
                container_name: None,
                warnings: Vec::new(),
            }),
            (TrustLevel::Sandboxed, false, SessionSource::Local) => {
                warn!("Container runtime unavailable, local session falls back to direct mode");
                Ok(ExecutionOutcome {
                    effective_mode: TrustLevel::Direct,
                    container_name: None,
                    warnings: vec![
                        "Container runtime is unavailable; running directly on the host \
                         instead of in a sandbox"
                            .to_string(),
                    ],
                })
            }
            (TrustLevel::Sandboxed, false, SessionSource::External) => {
                info!("Rejecting external session: sandbox required but runtime unavailable");
                Err(SandboxError::PolicyDenied(
                    "sandboxed execution is required for external sessions and the \
                     container runtime is unavailable"
                        .to_string(),
                ))
            }
        }
    }
}
