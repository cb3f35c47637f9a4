//! Host credentials delivered into the exec environment.
//!
//! Loaded from a single host-only JSON file (flat `{"NAME": "value"}`),
//! cached by modification time and filtered through a reserved-name
//! blocklist. Externally-originated sessions only receive explicitly
//! allow-listed names. Values are never logged.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::CredentialsConfig;
use crate::error::SandboxResult;
use crate::filecache::FileCache;
use crate::policy::SessionSource;

/// Names that the sandbox or the launch protocol owns; a credential file
/// can never override them.
const RESERVED_NAMES: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "PWD",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "FLUUX_SESSION_ID",
    "FLUUX_WORKSPACE_ID",
    "FLUUX_ENVIRONMENT_ID",
    "FLUUX_TRUST_LEVEL",
];

/// Environment variable name → value. `Debug` prints names only.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CredentialSet(BTreeMap<String, String>);

impl CredentialSet {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

impl FromIterator<(String, String)> for CredentialSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub struct CredentialInjector {
    cache: FileCache<CredentialSet>,
    blocklist: HashSet<String>,
    external_allowlist: HashSet<String>,
}

impl CredentialInjector {
    pub fn new(path: impl Into<PathBuf>, config: &CredentialsConfig) -> Self {
        let blocklist = RESERVED_NAMES
            .iter()
            .map(|n| n.to_string())
            .chain(config.blocklist.iter().map(|n| n.to_ascii_uppercase()))
            .collect();
        Self {
            cache: FileCache::new(path),
            blocklist,
            external_allowlist: config.external_allowlist.iter().cloned().collect(),
        }
    }

    /// Credentials for one session. Empty for external sessions unless
    /// names are allow-listed.
    pub fn for_session(&self, source: SessionSource) -> SandboxResult<CredentialSet> {
        if source == SessionSource::External && self.external_allowlist.is_empty() {
            debug!("No credentials for external session");
            return Ok(CredentialSet::default());
        }

        let blocklist = &self.blocklist;
        let all = self.cache.get(|content| parse_credentials(content, blocklist))?;

        let selected: CredentialSet = match source {
            SessionSource::Local => (*all).clone(),
            SessionSource::External => all
                .0
                .iter()
                .filter(|(name, _)| self.external_allowlist.contains(*name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };

        debug!(
            source = %source,
            keys = ?selected.names(),
            "Resolved credentials"
        );
        Ok(selected)
    }
}

fn parse_credentials(content: &str, blocklist: &HashSet<String>) -> SandboxResult<CredentialSet> {
    if content.trim().is_empty() {
        return Ok(CredentialSet::default());
    }
    // Non-string values fail here rather than being coerced
    let raw: BTreeMap<String, String> = serde_json::from_str(content)?;
    let mut set = BTreeMap::new();
    for (name, value) in raw {
        if blocklist.contains(&name.to_ascii_uppercase()) {
            warn!("Ignoring reserved credential name {name}");
            continue;
        }
        if !is_env_name(&name) {
            warn!("Ignoring credential with invalid environment name {name:?}");
            continue;
        }
        set.insert(name, value);
    }
    Ok(CredentialSet(set))
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
