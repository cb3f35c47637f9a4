//! Container runtime backends.
//!
//! `DockerCli` drives the `docker` (or `podman`) CLI through
//! `tokio::process`. Management calls share a bounded worker pool so a
//! burst of reconciliation or create requests never floods the host with
//! CLI processes. Exec streams are long-lived and are not counted against
//! the pool.

use std::collections::BTreeMap;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::exec::{spawn_process, ExecProcess, ExecSpec};

use crate::scratch;

use super::spec::{ContainerSpec, LABEL_FINGERPRINT, LABEL_OWNER};

/// Exit code of a container whose init honored the stop signal.
pub const EXIT_SIGTERM: i64 = 143;

/// What the runtime reports about one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub oom_killed: bool,
}

impl ContainerInfo {
    pub fn fingerprint(&self) -> Option<&str> {
        self.labels.get(LABEL_FINGERPRINT).map(String::as_str)
    }

    /// Exited on its own terms: killed for memory, or a non-zero exit
    /// other than the one a graceful stop produces.
    pub fn crashed(&self) -> bool {
        !self.running
            && (self.oom_killed || self.exit_code.is_some_and(|c| c != 0 && c != EXIT_SIGTERM))
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Whether the runtime daemon answers at all.
    async fn is_available(&self) -> bool;

    /// `None` when no container has that name.
    async fn inspect(&self, name: &str) -> SandboxResult<Option<ContainerInfo>>;

    /// Every container, running or not, carrying our ownership label.
    async fn list_owned(&self, owner: &str) -> SandboxResult<Vec<ContainerInfo>>;

    /// Creates and starts a container. Fails if the name is taken.
    async fn create(&self, spec: &ContainerSpec) -> SandboxResult<()>;

    /// Signal, wait up to `grace`, then kill. No-op for unknown names.
    async fn stop(&self, name: &str, grace: Duration) -> SandboxResult<()>;

    /// Force-removes a container. No-op for unknown names.
    async fn remove(&self, name: &str) -> SandboxResult<()>;

    /// Live process count inside the container.
    async fn process_count(&self, name: &str) -> SandboxResult<u32>;

    async fn exec(&self, name: &str, spec: &ExecSpec) -> SandboxResult<ExecProcess>;

    /// Kills the process tree of one exec inside the container. Killing the
    /// local exec client alone leaves it running.
    async fn terminate_exec(&self, name: &str, exec_id: &str) -> SandboxResult<()>;

    async fn network_exists(&self, name: &str) -> SandboxResult<bool>;
    async fn create_network(&self, name: &str) -> SandboxResult<()>;
    async fn volume_exists(&self, name: &str) -> SandboxResult<bool>;
    async fn create_volume(&self, name: &str) -> SandboxResult<()>;
}

// ── Docker CLI ──────────────────────────────────────

/// Partial `docker inspect` document.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    name: String,
    state: InspectState,
    config: InspectConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(rename = "OOMKilled", default)]
    oom_killed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

impl From<InspectEntry> for ContainerInfo {
    fn from(entry: InspectEntry) -> Self {
        Self {
            name: entry.name.trim_start_matches('/').to_string(),
            labels: entry.config.labels.unwrap_or_default(),
            running: entry.state.running,
            exit_code: if entry.state.running {
                None
            } else {
                entry.state.exit_code
            },
            oom_killed: entry.state.oom_killed,
        }
    }
}

fn parse_inspect(stdout: &str) -> SandboxResult<Vec<ContainerInfo>> {
    let entries: Vec<InspectEntry> = serde_json::from_str(stdout)?;
    Ok(entries.into_iter().map(ContainerInfo::from).collect())
}

fn parse_pid_count(stdout: &str) -> Result<u32, std::num::ParseIntError> {
    stdout.trim().parse::<u32>()
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("No such") || stderr.contains("no such")
}

pub struct DockerCli {
    cli: String,
    pool: Arc<Semaphore>,
}

impl DockerCli {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            cli: config.cli.clone(),
            pool: Arc::new(Semaphore::new(config.worker_pool.max(1))),
        }
    }

    /// Runs one management command on the worker pool.
    async fn run(&self, args: &[String]) -> SandboxResult<Output> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|e| SandboxError::RuntimeUnavailable(format!("worker pool closed: {e}")))?;
        debug!("{} {}", self.cli, args.first().map(String::as_str).unwrap_or(""));
        let output = Command::new(&self.cli)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(output)
    }

    /// Like `run`, but a non-zero exit becomes an error.
    async fn run_checked(&self, args: &[String]) -> SandboxResult<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(self.failure(args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn failure(&self, args: &[String], output: &Output) -> SandboxError {
        let sub: Vec<&str> = args.iter().take(2).map(String::as_str).collect();
        SandboxError::Runtime {
            command: format!("{} {}", self.cli, sub.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    /// Runs a command whose "not found" failure means "nothing to do".
    async fn run_idempotent(&self, args: &[String]) -> SandboxResult<bool> {
        let output = self.run(args).await?;
        if output.status.success() {
            return Ok(true);
        }
        if is_not_found(&String::from_utf8_lossy(&output.stderr)) {
            return Ok(false);
        }
        Err(self.failure(args, &output))
    }

    fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];
        for (key, value) in &spec.labels {
            args.extend(["--label".to_string(), format!("{key}={value}")]);
        }
        args.extend(spec.hardening.run_args());
        for mount in &spec.mounts {
            args.extend(["-v".to_string(), mount.volume_arg()]);
        }
        args.push(spec.image.clone());
        args.extend(["sleep".to_string(), "infinity".to_string()]);
        args
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn is_available(&self) -> bool {
        let args = strings(&["version", "--format", "{{.Server.Version}}"]);
        match self.run(&args).await {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                debug!(
                    "{} is not answering: {}",
                    self.cli,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(e) => {
                debug!("{} is not available: {e}", self.cli);
                false
            }
        }
    }

    async fn inspect(&self, name: &str) -> SandboxResult<Option<ContainerInfo>> {
        let args = strings(&["inspect", "--type", "container", name]);
        let output = self.run(&args).await?;
        if !output.status.success() {
            if is_not_found(&String::from_utf8_lossy(&output.stderr)) {
                return Ok(None);
            }
            return Err(self.failure(&args, &output));
        }
        Ok(parse_inspect(&String::from_utf8_lossy(&output.stdout))?
            .into_iter()
            .next())
    }

    async fn list_owned(&self, owner: &str) -> SandboxResult<Vec<ContainerInfo>> {
        let filter = format!("label={LABEL_OWNER}={owner}");
        let args = strings(&["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"]);
        let names: Vec<String> = self
            .run_checked(&args)
            .await?
            .lines()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = strings(&["inspect", "--type", "container"]);
        args.extend(names);
        let output = self.run(&args).await?;
        // A container removed between `ps` and `inspect` makes inspect exit
        // non-zero but still prints the others.
        if !output.status.success() && output.stdout.is_empty() {
            return Err(self.failure(&args, &output));
        }
        parse_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    async fn create(&self, spec: &ContainerSpec) -> SandboxResult<()> {
        info!(
            container = %spec.name,
            kind = %spec.kind(),
            fingerprint = %spec.fingerprint,
            "Creating container"
        );
        self.run_checked(&Self::create_args(spec)).await?;
        Ok(())
    }

    async fn stop(&self, name: &str, grace: Duration) -> SandboxResult<()> {
        let args = strings(&["stop", "-t", &grace.as_secs().to_string(), name]);
        // The CLI enforces the grace period itself; the outer bound only
        // guards against a wedged daemon.
        let bound = grace + Duration::from_secs(5);
        match tokio::time::timeout(bound, self.run_idempotent(&args)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                warn!("Stopping {name} timed out after {}s, killing", bound.as_secs());
                self.run_idempotent(&strings(&["kill", name])).await?;
                Ok(())
            }
        }
    }

    async fn remove(&self, name: &str) -> SandboxResult<()> {
        if self.run_idempotent(&strings(&["rm", "-f", name])).await? {
            debug!("Removed container {name}");
        }
        Ok(())
    }

    async fn process_count(&self, name: &str) -> SandboxResult<u32> {
        // cgroup v2 first, then the v1 pids controller
        let args = strings(&[
            "exec",
            name,
            "sh",
            "-c",
            "cat /sys/fs/cgroup/pids.current 2>/dev/null || cat /sys/fs/cgroup/pids/pids.current",
        ]);
        let stdout = self.run_checked(&args).await?;
        parse_pid_count(&stdout).map_err(|e| SandboxError::Runtime {
            command: format!("{} exec {name}", self.cli),
            stderr: format!("unexpected PID count {:?}: {e}", stdout.trim()),
        })
    }

    async fn exec(&self, name: &str, spec: &ExecSpec) -> SandboxResult<ExecProcess> {
        let mut cmd = Command::new(&self.cli);
        cmd.arg("exec").arg("-i");
        for (key, value) in &spec.env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg(name).args(&spec.argv);
        Ok(spawn_process(cmd, spec.stdin.clone())?)
    }

    async fn terminate_exec(&self, name: &str, exec_id: &str) -> SandboxResult<()> {
        let mut args = strings(&["exec", name]);
        args.extend(scratch::kill_exec_argv(exec_id)?);
        self.run_checked(&args).await?;
        debug!(container = %name, exec = %exec_id, "Terminated exec process tree");
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> SandboxResult<bool> {
        self.run_idempotent(&strings(&["network", "inspect", name]))
            .await
    }

    async fn create_network(&self, name: &str) -> SandboxResult<()> {
        info!("Creating network {name}");
        self.run_checked(&strings(&["network", "create", "--driver", "bridge", name]))
            .await?;
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> SandboxResult<bool> {
        self.run_idempotent(&strings(&["volume", "inspect", name]))
            .await
    }

    async fn create_volume(&self, name: &str) -> SandboxResult<()> {
        info!("Creating volume {name}");
        self.run_checked(&strings(&["volume", "create", name]))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::container::spec::SpecBuilder;

    const INSPECT_JSON: &str = r#"[
        {
            "Name": "/fluux-sandbox-default",
            "State": {"Running": false, "ExitCode": 137, "OOMKilled": true},
            "Config": {"Labels": {"fluux.sandbox.owner": "fluux-sandbox", "fluux.sandbox.fingerprint": "abc"}}
        },
        {
            "Name": "/other",
            "State": {"Running": true, "ExitCode": 0},
            "Config": {"Labels": null}
        }
    ]"#;

    #[test]
    fn test_parse_inspect() {
        let infos = parse_inspect(INSPECT_JSON).unwrap();
        assert_eq!(infos.len(), 2);

        let default = &infos[0];
        assert_eq!(default.name, "fluux-sandbox-default");
        assert!(!default.running);
        assert!(default.oom_killed);
        assert!(default.crashed());
        assert_eq!(default.exit_code, Some(137));
        assert_eq!(default.fingerprint(), Some("abc"));

        let other = &infos[1];
        assert!(other.running);
        assert!(other.labels.is_empty());
        assert_eq!(other.exit_code, None);
        assert!(!other.crashed());
    }

    #[test]
    fn test_clean_exit_is_not_a_crash() {
        let info = ContainerInfo {
            name: "c".into(),
            labels: BTreeMap::new(),
            running: false,
            exit_code: Some(0),
            oom_killed: false,
        };
        assert!(!info.crashed());
    }

    #[test]
    fn test_graceful_stop_is_not_a_crash() {
        let mut info = ContainerInfo {
            name: "c".into(),
            labels: BTreeMap::new(),
            running: false,
            exit_code: Some(EXIT_SIGTERM),
            oom_killed: false,
        };
        assert!(!info.crashed());

        info.exit_code = Some(1);
        assert!(info.crashed());

        info.exit_code = Some(EXIT_SIGTERM);
        info.oom_killed = true;
        assert!(info.crashed());
    }

    #[test]
    fn test_parse_pid_count() {
        assert_eq!(parse_pid_count("17\n").unwrap(), 17);
        assert!(parse_pid_count("max").is_err());
        assert!(parse_pid_count("").is_err());
    }

    #[test]
    fn test_create_args() {
        let spec = SpecBuilder::new(&Config::default()).default_shared();
        let args = DockerCli::create_args(&spec);

        assert_eq!(&args[..4], &["run", "-d", "--name", "fluux-sandbox-default"]);
        assert!(args.contains(&format!("{LABEL_FINGERPRINT}={}", spec.fingerprint)));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"--init".to_string()));
        assert!(args.contains(&"fluux-sandbox-tools:/opt/tools:ro".to_string()));
        assert_eq!(&args[args.len() - 3..], &[spec.image.as_str(), "sleep", "infinity"]);
        // No environment flags: secrets only travel over stdin
        assert!(!args.iter().any(|a| a == "-e" || a == "--env"));
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found("Error: No such container: x"));
        assert!(is_not_found("Error response from daemon: no such volume"));
        assert!(!is_not_found("permission denied"));
    }

    #[tokio::test]
    async fn test_missing_cli_is_unavailable() {
        let config = RuntimeConfig {
            cli: "/nonexistent/fluux-docker".to_string(),
            ..Default::default()
        };
        assert!(!DockerCli::new(&config).is_available().await);
    }
}
