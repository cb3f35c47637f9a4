use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub hardening: HardeningConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Container CLI binary ("docker", "podman")
    #[serde(default = "default_cli")]
    pub cli: String,
    #[serde(default = "default_image")]
    pub image: String,
    /// Prefix of every container name we own
    #[serde(default = "default_prefix")]
    pub container_prefix: String,
    /// Value of the ownership label; containers without it are never touched
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_network")]
    pub network: String,
    /// Read-only tool volume mounted into the default container
    #[serde(default = "default_tool_volume")]
    pub tool_volume: String,
    /// Agent runtime command, run inside the container (or on the host in
    /// direct mode). Reads launch parameters on stdin.
    #[serde(default = "default_agent_command")]
    pub agent_command: Vec<String>,
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
    /// Max concurrent runtime CLI calls
    #[serde(default = "default_worker_pool")]
    pub worker_pool: usize,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Bound on waiting for a new container to report running
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HardeningConfig {
    /// Capabilities added back after `--cap-drop ALL`
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    /// Execs are refused when live processes are within this margin of
    /// `pids_limit`
    #[serde(default = "default_capacity_margin")]
    pub capacity_margin: u32,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_memory_reservation")]
    pub memory_reservation: String,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default = "default_tmp_size")]
    pub tmp_size: String,
    #[serde(default = "default_scratch_size")]
    pub scratch_size: String,
    #[serde(default = "default_run_size")]
    pub run_size: String,
    #[serde(default = "default_nofile")]
    pub nofile: (u64, u64),
    #[serde(default = "default_nproc")]
    pub nproc: (u64, u64),
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Durable state: named environment records and their directories
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Knowledge vault, always mounted read-only
    #[serde(default = "default_vault")]
    pub vault: PathBuf,
    #[serde(default = "default_transcripts")]
    pub transcripts: PathBuf,
    /// Host-only secrets file (flat JSON object)
    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,
    /// User-editable tool-server configuration
    #[serde(default = "default_tool_config")]
    pub tool_config: PathBuf,
    /// Host root of workspace project directories; `None` disables project
    /// mounts for workspace-bound sessions
    #[serde(default)]
    pub workspaces_root: Option<PathBuf>,
    /// Host scratch root for direct-mode sessions
    #[serde(default = "default_host_scratch")]
    pub host_scratch: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CredentialsConfig {
    /// Extra reserved names, on top of the built-in blocklist
    #[serde(default)]
    pub blocklist: Vec<String>,
    /// Key names delivered to externally-originated sessions
    #[serde(default)]
    pub external_allowlist: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Rolling crash window
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Crashes within the window before the escalation is reported
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: usize,
    /// How long a container must run before its crash history is cleared
    #[serde(default = "default_stability_secs")]
    pub stability_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
}

fn default_cli() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "ghcr.io/processone/fluux-agent-runtime:latest".to_string()
}

fn default_prefix() -> String {
    "fluux-sandbox".to_string()
}

fn default_owner() -> String {
    "fluux-sandbox".to_string()
}

fn default_network() -> String {
    "fluux-sandbox-net".to_string()
}

fn default_tool_volume() -> String {
    "fluux-sandbox-tools".to_string()
}

fn default_agent_command() -> Vec<String> {
    vec!["fluux-agent-runtime".to_string(), "--stdio".to_string()]
}

fn default_exec_timeout_secs() -> u64 {
    900
}

fn default_worker_pool() -> usize {
    8
}

fn default_stop_grace_secs() -> u64 {
    10
}

fn default_ready_timeout_secs() -> u64 {
    30
}

fn default_capabilities() -> Vec<String> {
    ["CHOWN", "DAC_OVERRIDE", "FOWNER", "SETGID", "SETUID", "KILL"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn default_pids_limit() -> u32 {
    256
}

fn default_capacity_margin() -> u32 {
    32
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_memory_reservation() -> String {
    "1536m".to_string()
}

fn default_tmp_size() -> String {
    "256m".to_string()
}

fn default_scratch_size() -> String {
    "512m".to_string()
}

fn default_run_size() -> String {
    "16m".to_string()
}

fn default_nofile() -> (u64, u64) {
    (4096, 8192)
}

fn default_nproc() -> (u64, u64) {
    (512, 512)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_vault() -> PathBuf {
    PathBuf::from("./data/vault")
}

fn default_transcripts() -> PathBuf {
    PathBuf::from("./data/transcripts")
}

fn default_credentials_file() -> PathBuf {
    PathBuf::from("./data/credentials.json")
}

fn default_tool_config() -> PathBuf {
    PathBuf::from("./data/tools.json")
}

fn default_host_scratch() -> PathBuf {
    std::env::temp_dir().join("fluux-sandbox")
}

fn default_initial_delay_secs() -> u64 {
    2
}

fn default_max_delay_secs() -> u64 {
    300
}

fn default_window_secs() -> u64 {
    300
}

fn default_escalation_threshold() -> usize {
    3
}

fn default_stability_secs() -> u64 {
    60
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cli: default_cli(),
            image: default_image(),
            container_prefix: default_prefix(),
            owner: default_owner(),
            network: default_network(),
            tool_volume: default_tool_volume(),
            agent_command: default_agent_command(),
            exec_timeout_secs: default_exec_timeout_secs(),
            worker_pool: default_worker_pool(),
            stop_grace_secs: default_stop_grace_secs(),
            ready_timeout_secs: default_ready_timeout_secs(),
        }
    }
}

impl Default for HardeningConfig {
    fn default() -> Self {
        Self {
            capabilities: default_capabilities(),
            pids_limit: default_pids_limit(),
            capacity_margin: default_capacity_margin(),
            memory: default_memory(),
            memory_reservation: default_memory_reservation(),
            cpus: None,
            tmp_size: default_tmp_size(),
            scratch_size: default_scratch_size(),
            run_size: default_run_size(),
            nofile: default_nofile(),
            nproc: default_nproc(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            vault: default_vault(),
            transcripts: default_transcripts(),
            credentials_file: default_credentials_file(),
            tool_config: default_tool_config(),
            workspaces_root: None,
            host_scratch: default_host_scratch(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            window_secs: default_window_secs(),
            escalation_threshold: default_escalation_threshold(),
            stability_secs: default_stability_secs(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${FLUUX_DATA_DIR}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        if config.hardening.capacity_margin >= config.hardening.pids_limit {
            anyhow::bail!(
                "hardening.capacity_margin ({}) must be below hardening.pids_limit ({})",
                config.hardening.capacity_margin,
                config.hardening.pids_limit
            );
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.runtime.cli, "docker");
        assert_eq!(config.runtime.container_prefix, "fluux-sandbox");
        assert_eq!(config.hardening.pids_limit, 256);
        assert_eq!(config.health.escalation_threshold, 3);
        assert_eq!(config.health.window_secs, 300);
        assert!(config.paths.workspaces_root.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
[runtime]
cli = "podman"
image = "localhost/agent:dev"

[hardening]
pids_limit = 128
capacity_margin = 8
nofile = [1024, 2048]

[credentials]
external_allowlist = ["PUBLIC_API_KEY"]
"#,
        )
        .unwrap();
        assert_eq!(config.runtime.cli, "podman");
        assert_eq!(config.runtime.image, "localhost/agent:dev");
        assert_eq!(config.runtime.network, "fluux-sandbox-net");
        assert_eq!(config.hardening.pids_limit, 128);
        assert_eq!(config.hardening.nofile, (1024, 2048));
        assert_eq!(config.hardening.memory, "2g");
        assert_eq!(config.credentials.external_allowlist, vec!["PUBLIC_API_KEY"]);
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("FLUUX_SANDBOX_TEST_IMAGE", "registry.local/runtime:1");
        let config = Config::parse(
            r#"
[runtime]
image = "${FLUUX_SANDBOX_TEST_IMAGE}"
"#,
        )
        .unwrap();
        assert_eq!(config.runtime.image, "registry.local/runtime:1");
    }

    #[test]
    fn test_margin_must_be_below_limit() {
        let err = Config::parse(
            r#"
[hardening]
pids_limit = 16
capacity_margin = 16
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("capacity_margin"));
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let config = Config::parse(include_str!("../config/sandbox.toml")).unwrap();
        let defaults = Config::default();
        assert_eq!(config.runtime.image, defaults.runtime.image);
        assert_eq!(config.runtime.agent_command, defaults.runtime.agent_command);
        assert_eq!(config.hardening.capabilities, defaults.hardening.capabilities);
        assert_eq!(config.hardening.nproc, defaults.hardening.nproc);
        assert_eq!(config.health.max_delay_secs, defaults.health.max_delay_secs);
        assert_eq!(config.reconcile.interval_secs, defaults.reconcile.interval_secs);
    }

    #[test]
    fn test_durations() {
        let config = Config::default();
        assert_eq!(config.runtime.exec_timeout(), Duration::from_secs(900));
        assert_eq!(config.runtime.stop_grace(), Duration::from_secs(10));
    }
}
