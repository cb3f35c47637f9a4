//! Per-exec tool-server configuration with authoritative session context.
//!
//! The base configuration comes from a user-editable JSON file and is
//! cached. Before each exec the session id, workspace/environment id and
//! effective trust level are written into every server's environment on a
//! copy of the cached value. Injected values always replace whatever the
//! file holds under the same names.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SandboxResult;
use crate::filecache::FileCache;
use crate::policy::ExecutionMode;

pub const ENV_SESSION_ID: &str = "FLUUX_SESSION_ID";
pub const ENV_WORKSPACE_ID: &str = "FLUUX_WORKSPACE_ID";
pub const ENV_ENVIRONMENT_ID: &str = "FLUUX_ENVIRONMENT_ID";
pub const ENV_TRUST_LEVEL: &str = "FLUUX_TRUST_LEVEL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, ToolServer>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolServer {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Unknown fields are carried through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Values computed by the orchestrator for one exec.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub session_id: String,
    pub workspace_id: Option<String>,
    pub environment_id: Option<String>,
    pub trust_level: ExecutionMode,
}

impl SessionContext {
    /// Returns a stamped copy of `base`; `base` itself is never modified.
    pub fn apply(&self, base: &ToolConfig) -> ToolConfig {
        let mut config = base.clone();
        for server in config.servers.values_mut() {
            server
                .env
                .insert(ENV_SESSION_ID.to_string(), self.session_id.clone());
            server
                .env
                .insert(ENV_TRUST_LEVEL.to_string(), self.trust_level.to_string());
            set_or_clear(&mut server.env, ENV_WORKSPACE_ID, &self.workspace_id);
            set_or_clear(&mut server.env, ENV_ENVIRONMENT_ID, &self.environment_id);
        }
        config
    }
}

/// An absent value must not leave a user-supplied one in place.
fn set_or_clear(env: &mut BTreeMap<String, String>, name: &str, value: &Option<String>) {
    match value {
        Some(v) => {
            env.insert(name.to_string(), v.clone());
        }
        None => {
            env.remove(name);
        }
    }
}

pub struct SessionContextInjector {
    cache: FileCache<ToolConfig>,
}

impl SessionContextInjector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            cache: FileCache::new(path),
        }
    }

    /// The cached base configuration, shared between readers.
    pub fn base(&self) -> SandboxResult<Arc<ToolConfig>> {
        self.cache.get(|content| {
            if content.trim().is_empty() {
                return Ok(ToolConfig::default());
            }
            Ok(serde_json::from_str(content)?)
        })
    }

    pub fn prepare(&self, context: &SessionContext) -> SandboxResult<ToolConfig> {
        let base = self.base()?;
        Ok(context.apply(&base))
    }
}
