//! Container kinds, naming and per-kind specs.
//!
//! | Kind | Name | Working dir | Mounts |
//! |------|------|-------------|--------|
//! | ephemeral | `{prefix}-sess-{session}` | `/scratch/{session}` or `/project` | vault ro, session transcripts rw, project rw (optional) |
//! | named | `{prefix}-env-{slug}` | `/workspace` | vault ro, environment dir rw, environment transcripts rw |
//! | default | `{prefix}-default` | `/scratch/{session}` | vault ro, tool volume ro |

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::environments::NamedEnvironment;

use super::hardening::HardeningSpec;

pub const LABEL_OWNER: &str = "fluux.sandbox.owner";
pub const LABEL_KIND: &str = "fluux.sandbox.kind";
pub const LABEL_KEY: &str = "fluux.sandbox.key";
pub const LABEL_FINGERPRINT: &str = "fluux.sandbox.fingerprint";

pub const SCRATCH_DIR: &str = "/scratch";
pub const WORKSPACE_DIR: &str = "/workspace";
pub const PROJECT_DIR: &str = "/project";
pub const VAULT_DIR: &str = "/vault";
pub const TRANSCRIPTS_DIR: &str = "/transcripts";
pub const TOOLS_DIR: &str = "/opt/tools";

/// Key of the always-on shared container.
pub const DEFAULT_KEY: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// One per session, torn down with it
    Ephemeral,
    /// One per named environment, until explicit delete
    Named,
    /// The single shared container
    Default,
}

impl ContainerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerKind::Ephemeral => "ephemeral",
            ContainerKind::Named => "named",
            ContainerKind::Default => "default",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "ephemeral" => Some(ContainerKind::Ephemeral),
            "named" => Some(ContainerKind::Named),
            "default" => Some(ContainerKind::Default),
            _ => None,
        }
    }

    /// Fixed mount targets and read-only flags for this kind. Part of the
    /// fingerprint; per-session optional mounts are not.
    pub fn mount_layout(self) -> &'static [(&'static str, bool)] {
        match self {
            ContainerKind::Ephemeral => &[(VAULT_DIR, true), (TRANSCRIPTS_DIR, false)],
            ContainerKind::Named => &[
                (VAULT_DIR, true),
                (WORKSPACE_DIR, false),
                (TRANSCRIPTS_DIR, false),
            ],
            ContainerKind::Default => &[(VAULT_DIR, true), (TOOLS_DIR, true)],
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// At most one container exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerKey {
    pub kind: ContainerKind,
    pub key: String,
}

impl ContainerKey {
    pub fn ephemeral(session_id: &str) -> Self {
        Self {
            kind: ContainerKind::Ephemeral,
            key: session_id.to_string(),
        }
    }

    pub fn named(slug: &str) -> Self {
        Self {
            kind: ContainerKind::Named,
            key: slug.to_string(),
        }
    }

    pub fn default_shared() -> Self {
        Self {
            kind: ContainerKind::Default,
            key: DEFAULT_KEY.to_string(),
        }
    }

    /// Container name for this key under `prefix`.
    pub fn container_name(&self, prefix: &str) -> String {
        match self.kind {
            ContainerKind::Ephemeral => format!("{prefix}-sess-{}", self.key),
            ContainerKind::Named => format!("{prefix}-env-{}", self.key),
            ContainerKind::Default => format!("{prefix}-default"),
        }
    }

    /// Recovers a key from the kind/key labels, checking that the name
    /// matches the current naming convention. Anything else is a
    /// deprecated shape.
    pub fn from_labels(
        prefix: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Option<Self> {
        let kind = ContainerKind::parse(labels.get(LABEL_KIND)?)?;
        let key = labels.get(LABEL_KEY)?.clone();
        if kind == ContainerKind::Default && key != DEFAULT_KEY {
            return None;
        }
        let parsed = Self { kind, key };
        (parsed.container_name(prefix) == name).then_some(parsed)
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    Bind(PathBuf),
    Volume(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    fn bind(source: PathBuf, target: &str, read_only: bool) -> Self {
        Self {
            source: MountSource::Bind(source),
            target: target.to_string(),
            read_only,
        }
    }

    /// `-v` value for the container CLI.
    pub fn volume_arg(&self) -> String {
        let source = match &self.source {
            MountSource::Bind(path) => path.display().to_string(),
            MountSource::Volume(name) => name.clone(),
        };
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{source}:{}:{mode}", self.target)
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub key: ContainerKey,
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub hardening: HardeningSpec,
    pub fingerprint: String,
    /// Working directory override passed to the entrypoint; `None` means a
    /// per-session scratch directory.
    pub workdir: Option<String>,
}

impl ContainerSpec {
    pub fn kind(&self) -> ContainerKind {
        self.key.kind
    }
}

/// Builds per-kind specs from configuration.
#[derive(Debug, Clone)]
pub struct SpecBuilder {
    prefix: String,
    owner: String,
    image: String,
    tool_volume: String,
    vault: PathBuf,
    transcripts: PathBuf,
    workspaces_root: Option<PathBuf>,
    hardening: HardeningSpec,
}

impl SpecBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            prefix: config.runtime.container_prefix.clone(),
            owner: config.runtime.owner.clone(),
            image: config.runtime.image.clone(),
            tool_volume: config.runtime.tool_volume.clone(),
            vault: config.paths.vault.clone(),
            transcripts: config.paths.transcripts.clone(),
            workspaces_root: config.paths.workspaces_root.clone(),
            hardening: HardeningSpec::from_config(&config.hardening, &config.runtime),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Fingerprint a freshly created container of `kind` would carry.
    pub fn intended_fingerprint(&self, kind: ContainerKind) -> String {
        self.hardening.fingerprint(kind, &self.image)
    }

    /// Per-session container. A workspace-bound session gets its project
    /// directory mounted and used as working directory when a workspaces
    /// root is configured.
    pub fn ephemeral(&self, session_id: &str, workspace_id: Option<&str>) -> ContainerSpec {
        let mut mounts = vec![
            Mount::bind(self.vault.clone(), VAULT_DIR, true),
            Mount::bind(self.transcripts.join(session_id), TRANSCRIPTS_DIR, false),
        ];
        let mut workdir = None;
        if let (Some(root), Some(workspace)) = (&self.workspaces_root, workspace_id) {
            mounts.push(Mount::bind(root.join(workspace), PROJECT_DIR, false));
            workdir = Some(PROJECT_DIR.to_string());
        }
        self.build(ContainerKey::ephemeral(session_id), mounts, workdir)
    }

    /// Long-lived container of a named environment. The working directory is
    /// the environment's own directory, shared by every joining session.
    pub fn named(&self, env: &NamedEnvironment, workspace_dir: PathBuf) -> ContainerSpec {
        let mounts = vec![
            Mount::bind(self.vault.clone(), VAULT_DIR, true),
            Mount::bind(workspace_dir, WORKSPACE_DIR, false),
            Mount::bind(
                self.transcripts.join(format!("env-{}", env.slug)),
                TRANSCRIPTS_DIR,
                false,
            ),
        ];
        self.build(
            ContainerKey::named(&env.slug),
            mounts,
            Some(WORKSPACE_DIR.to_string()),
        )
    }

    pub fn default_shared(&self) -> ContainerSpec {
        let mounts = vec![
            Mount::bind(self.vault.clone(), VAULT_DIR, true),
            Mount {
                source: MountSource::Volume(self.tool_volume.clone()),
                target: TOOLS_DIR.to_string(),
                read_only: true,
            },
        ];
        self.build(ContainerKey::default_shared(), mounts, None)
    }

    fn build(
        &self,
        key: ContainerKey,
        mounts: Vec<Mount>,
        workdir: Option<String>,
    ) -> ContainerSpec {
        let fingerprint = self.intended_fingerprint(key.kind);
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_OWNER.to_string(), self.owner.clone());
        labels.insert(LABEL_KIND.to_string(), key.kind.as_str().to_string());
        labels.insert(LABEL_KEY.to_string(), key.key.clone());
        labels.insert(LABEL_FINGERPRINT.to_string(), fingerprint.clone());

        ContainerSpec {
            name: key.container_name(&self.prefix),
            key,
            image: self.image.clone(),
            labels,
            mounts,
            hardening: self.hardening.clone(),
            fingerprint,
            workdir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn builder() -> SpecBuilder {
        let mut config = Config::default();
        config.paths.vault = PathBuf::from("/srv/vault");
        config.paths.transcripts = PathBuf::from("/srv/transcripts");
        SpecBuilder::new(&config)
    }

    #[test]
    fn test_names_per_kind() {
        assert_eq!(
            ContainerKey::ephemeral("abc").container_name("fx"),
            "fx-sess-abc"
        );
        assert_eq!(ContainerKey::named("proj-x").container_name("fx"), "fx-env-proj-x");
        assert_eq!(ContainerKey::default_shared().container_name("fx"), "fx-default");
    }

    #[test]
    fn test_from_labels_accepts_current_shape() {
        let spec = builder().named(
            &NamedEnvironment {
                slug: "proj-x".into(),
                display_name: "Proj X".into(),
                created_at: Utc::now(),
                host_mount: None,
            },
            PathBuf::from("/srv/envs/proj-x"),
        );
        let parsed = ContainerKey::from_labels("fluux-sandbox", &spec.name, &spec.labels);
        assert_eq!(parsed, Some(ContainerKey::named("proj-x")));
    }

    #[test]
    fn test_from_labels_rejects_deprecated_shapes() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_KIND.to_string(), "agent".to_string());
        labels.insert(LABEL_KEY.to_string(), "a1".to_string());
        assert!(ContainerKey::from_labels("fluux-sandbox", "fluux-sandbox-agent-a1", &labels)
            .is_none());

        // Right kind, old naming scheme
        labels.insert(LABEL_KIND.to_string(), "ephemeral".to_string());
        assert!(ContainerKey::from_labels("fluux-sandbox", "fluux-sandbox-a1", &labels).is_none());

        // Missing key label
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_KIND.to_string(), "default".to_string());
        assert!(ContainerKey::from_labels("fluux-sandbox", "fluux-sandbox-default", &labels)
            .is_none());
    }

    #[test]
    fn test_ephemeral_mounts() {
        let spec = builder().ephemeral("s1", None);
        assert_eq!(spec.name, "fluux-sandbox-sess-s1");
        let args: Vec<String> = spec.mounts.iter().map(Mount::volume_arg).collect();
        assert_eq!(
            args,
            vec!["/srv/vault:/vault:ro", "/srv/transcripts/s1:/transcripts:rw"]
        );
        assert!(spec.workdir.is_none());
        assert_eq!(spec.labels[LABEL_KIND], "ephemeral");
        assert_eq!(spec.labels[LABEL_FINGERPRINT], spec.fingerprint);
    }

    #[test]
    fn test_ephemeral_project_mount_needs_root() {
        let spec = builder().ephemeral("s1", Some("ws1"));
        assert!(spec.workdir.is_none());

        let mut config = Config::default();
        config.paths.workspaces_root = Some(PathBuf::from("/srv/projects"));
        let spec = SpecBuilder::new(&config).ephemeral("s1", Some("ws1"));
        assert_eq!(spec.workdir.as_deref(), Some(PROJECT_DIR));
        let project = spec.mounts.iter().find(|m| m.target == PROJECT_DIR).unwrap();
        assert_eq!(
            project.source,
            MountSource::Bind(PathBuf::from("/srv/projects/ws1"))
        );
    }

    #[test]
    fn test_default_mounts_tool_volume_read_only() {
        let spec = builder().default_shared();
        assert_eq!(spec.name, "fluux-sandbox-default");
        let tools = spec.mounts.iter().find(|m| m.target == TOOLS_DIR).unwrap();
        assert!(tools.read_only);
        assert_eq!(tools.source, MountSource::Volume("fluux-sandbox-tools".into()));
        assert!(spec.mounts.iter().all(|m| m.read_only));
    }

    #[test]
    fn test_mount_layout_matches_built_specs() {
        let b = builder();
        let ephemeral = b.ephemeral("s1", None);
        let layout: Vec<(&str, bool)> = ephemeral
            .mounts
            .iter()
            .map(|m| (m.target.as_str(), m.read_only))
            .collect();
        assert_eq!(layout, ContainerKind::Ephemeral.mount_layout().to_vec());

        let default = b.default_shared();
        let layout: Vec<(&str, bool)> = default
            .mounts
            .iter()
            .map(|m| (m.target.as_str(), m.read_only))
            .collect();
        assert_eq!(layout, ContainerKind::Default.mount_layout().to_vec());
    }
}
