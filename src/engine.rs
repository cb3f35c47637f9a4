//! Orchestrator and administrative facade.
//!
//! `SandboxEngine` owns every component and is the only entry point the
//! rest of the system uses: resolve a session's execution mode, run it
//! (sandboxed or direct) as an event stream, tear down per-session
//! containers, and manage named environments.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::container::lifecycle::ContainerLifecycleManager;
use crate::container::runtime::ContainerRuntime;
use crate::container::spec::{ContainerKey, ContainerSpec, SpecBuilder};
use crate::context::{
    SessionContext, SessionContextInjector, ENV_SESSION_ID, ENV_TRUST_LEVEL,
};
use crate::credentials::CredentialInjector;
use crate::environments::{EnvironmentStore, NamedEnvironment};
use crate::error::{SandboxError, SandboxResult};
use crate::exec::{event_channel, pump_events, spawn_process, EventStream, ExecSpec, LaunchParams};
use crate::health::{HealthMonitor, HealthStatus};
use crate::policy::{ExecutionMode, ExecutionOutcome, ExecutionRequest, PolicyResolver};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::registry::{ContainerRecord, ContainerRegistry};
use crate::scratch;

/// Per-session record consulted by downstream capability filtering.
/// Never carries credentials.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub workspace_id: Option<String>,
    pub named_env: Option<String>,
    /// As sent by the client, before normalization
    pub requested_trust_level: String,
    pub effective_execution_mode: ExecutionMode,
    pub container_name: Option<String>,
    pub warnings: Vec<String>,
}

/// A started session run.
pub struct SessionRun {
    pub outcome: ExecutionOutcome,
    pub events: EventStream,
}

/// Administrative snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub backend: &'static str,
    pub runtime_available: bool,
    pub containers: Vec<ContainerRecord>,
    pub health: Vec<HealthStatus>,
    pub sessions: usize,
}

pub struct SandboxEngine {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    specs: SpecBuilder,
    registry: Arc<ContainerRegistry>,
    health: Arc<HealthMonitor>,
    lifecycle: Arc<ContainerLifecycleManager>,
    reconciler: Reconciler,
    environments: Arc<EnvironmentStore>,
    credentials: Arc<CredentialInjector>,
    context: Arc<SessionContextInjector>,
    sessions: RwLock<HashMap<String, SessionRecord>>,
    runtime_available: AtomicBool,
}

impl SandboxEngine {
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>) -> SandboxResult<Self> {
        let specs = SpecBuilder::new(&config);
        let registry = Arc::new(ContainerRegistry::new());
        let health = Arc::new(HealthMonitor::new(&config.health));
        let lifecycle = Arc::new(ContainerLifecycleManager::new(
            Arc::clone(&runtime),
            Arc::clone(&registry),
            Arc::clone(&health),
            &config,
        ));
        let environments = Arc::new(EnvironmentStore::open(
            &config.paths.data_dir.join("environments"),
        )?);
        let reconciler = Reconciler::new(
            Arc::clone(&lifecycle),
            specs.clone(),
            Arc::clone(&environments),
            &config,
        );
        let credentials = Arc::new(CredentialInjector::new(
            &config.paths.credentials_file,
            &config.credentials,
        ));
        let context = Arc::new(SessionContextInjector::new(&config.paths.tool_config));

        Ok(Self {
            config,
            runtime,
            specs,
            registry,
            health,
            lifecycle,
            reconciler,
            environments,
            credentials,
            context,
            sessions: RwLock::new(HashMap::new()),
            runtime_available: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Re-checks the container runtime and caches the answer for policy
    /// resolution.
    pub async fn probe_runtime(&self) -> bool {
        let available = self.runtime.is_available().await;
        let previous = self.runtime_available.swap(available, Ordering::SeqCst);
        if available != previous {
            if available {
                info!("Container runtime ({}) is available", self.runtime.backend_name());
            } else {
                warn!(
                    "Container runtime ({}) is unavailable, sandboxed sessions will degrade or be refused",
                    self.runtime.backend_name()
                );
            }
        }
        available
    }

    pub fn runtime_available(&self) -> bool {
        self.runtime_available.load(Ordering::SeqCst)
    }

    /// Startup pass: probe the runtime and reconcile if it answers.
    pub async fn startup(&self) -> SandboxResult<ReconcileReport> {
        if !self.probe_runtime().await {
            return Ok(ReconcileReport::default());
        }
        self.reconciler.reconcile(&self.live_sessions()).await
    }

    /// Administrative reconciliation, also run by the daemon's timer.
    pub async fn force_reconcile(&self) -> SandboxResult<ReconcileReport> {
        if !self.probe_runtime().await {
            return Err(SandboxError::RuntimeUnavailable(format!(
                "{} is not answering",
                self.runtime.backend_name()
            )));
        }
        self.reconciler.reconcile(&self.live_sessions()).await
    }

    fn live_sessions(&self) -> HashSet<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Container a sandboxed request runs in: its named environment, a
    /// per-session container for workspace-bound sessions, otherwise the
    /// shared default.
    fn target_spec(&self, request: &ExecutionRequest) -> SandboxResult<ContainerSpec> {
        if let Some(slug) = &request.named_env_slug {
            let env = self.environments.require(slug)?;
            return Ok(self
                .specs
                .named(&env, self.environments.workspace_dir(&env)));
        }
        if let Some(workspace) = &request.workspace_id {
            scratch::validate_session_id(workspace)?;
            return Ok(self
                .specs
                .ephemeral(&request.session_id, Some(workspace)));
        }
        Ok(self.specs.default_shared())
    }

    /// Decides where the session runs and records the outcome.
    pub fn resolve_execution_mode(
        &self,
        request: &ExecutionRequest,
    ) -> SandboxResult<ExecutionOutcome> {
        scratch::validate_session_id(&request.session_id)?;
        let mut outcome = PolicyResolver::resolve(
            &request.requested_trust_level,
            request.session_source,
            self.runtime_available(),
        )?;
        if outcome.effective_mode == ExecutionMode::Sandboxed {
            outcome.container_name = Some(self.target_spec(request)?.name);
        }

        let record = SessionRecord {
            session_id: request.session_id.clone(),
            workspace_id: request.workspace_id.clone(),
            named_env: request.named_env_slug.clone(),
            requested_trust_level: request.requested_trust_level.clone(),
            effective_execution_mode: outcome.effective_mode,
            container_name: outcome.container_name.clone(),
            warnings: outcome.warnings.clone(),
        };
        self.sessions
            .write()
            .insert(request.session_id.clone(), record);
        Ok(outcome)
    }

    pub fn session_record(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Resolves the mode, prepares credentials and tool configuration, and
    /// starts the agent runtime. Events stream until the run completes.
    pub async fn run_session(&self, request: &ExecutionRequest) -> SandboxResult<SessionRun> {
        let outcome = self.resolve_execution_mode(request)?;

        // Both re-read their files when an operator edited them
        let credentials = Arc::clone(&self.credentials);
        let context = Arc::clone(&self.context);
        let source = request.session_source;
        let session = SessionContext {
            session_id: request.session_id.clone(),
            workspace_id: request.workspace_id.clone(),
            environment_id: request.named_env_slug.clone(),
            trust_level: outcome.effective_mode,
        };
        let (credentials, tool_config) = blocking(move || {
            Ok((credentials.for_session(source)?, context.prepare(&session)?))
        })
        .await?;
        info!(
            session = %request.session_id,
            mode = %outcome.effective_mode,
            container = ?outcome.container_name,
            credentials = credentials.len(),
            "Starting session run"
        );

        let mut launch = LaunchParams {
            working_dir: None,
            session_id: request.session_id.clone(),
            workspace_id: request.workspace_id.clone(),
            environment_id: request.named_env_slug.clone(),
            trust_level: outcome.effective_mode,
            credentials,
            tool_config,
            payload: request.payload.clone(),
        };
        let env = vec![
            (ENV_SESSION_ID.to_string(), request.session_id.clone()),
            (ENV_TRUST_LEVEL.to_string(), outcome.effective_mode.to_string()),
        ];

        let events = match outcome.effective_mode {
            ExecutionMode::Sandboxed => {
                let spec = self.target_spec(request)?;
                let handle = self.lifecycle.ensure(&spec).await?;
                launch.working_dir = Some(scratch::effective_workdir(
                    &request.session_id,
                    handle.workdir.as_deref(),
                ));
                let exec_id = scratch::new_exec_id();
                let exec = ExecSpec {
                    argv: scratch::entrypoint_argv(
                        &request.session_id,
                        handle.workdir.as_deref(),
                        &exec_id,
                        &self.config.runtime.agent_command,
                    )?,
                    env,
                    stdin: launch_document(&launch)?,
                    exec_id: Some(exec_id),
                };
                self.lifecycle
                    .exec(&handle, exec, self.config.runtime.exec_timeout())
                    .await?
            }
            ExecutionMode::Direct => {
                let dir = self.host_workdir(request).await?;
                launch.working_dir = Some(dir.display().to_string());
                self.run_direct(dir, env, launch_document(&launch)?)?
            }
        };

        Ok(SessionRun { outcome, events })
    }

    /// Host working directory for a direct run, mirroring what the
    /// container would have used.
    async fn host_workdir(&self, request: &ExecutionRequest) -> SandboxResult<PathBuf> {
        if let Some(slug) = &request.named_env_slug {
            let env = self.environments.require(slug)?;
            let dir = self.environments.workspace_dir(&env);
            tokio::fs::create_dir_all(&dir).await?;
            return Ok(dir);
        }
        if let (Some(root), Some(workspace)) =
            (&self.config.paths.workspaces_root, &request.workspace_id)
        {
            scratch::validate_session_id(workspace)?;
            let dir = root.join(workspace);
            tokio::fs::create_dir_all(&dir).await?;
            return Ok(dir);
        }
        let root = self.config.paths.host_scratch.clone();
        let session_id = request.session_id.clone();
        blocking(move || scratch::prepare_host_scratch(&root, &session_id)).await
    }

    fn run_direct(
        &self,
        dir: PathBuf,
        env: Vec<(String, String)>,
        stdin: Vec<u8>,
    ) -> SandboxResult<EventStream> {
        let Some((program, args)) = self.config.runtime.agent_command.split_first() else {
            return Err(SandboxError::Runtime {
                command: "agent runtime".to_string(),
                stderr: "runtime.agent_command is empty".to_string(),
            });
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&dir).envs(env);
        let process = spawn_process(cmd, stdin)?;

        let timeout = self.config.runtime.exec_timeout();
        let (tx, rx) = event_channel();
        tokio::spawn(async move {
            let class = pump_events(process, timeout, &tx).await;
            debug!(?class, "Direct run finished");
            if let Some(event) = class.error_event(timeout) {
                let _ = tx.send(event).await;
            }
        });
        Ok(rx)
    }

    /// Tears down the session's own container, if it has one. Named and
    /// default containers are never affected.
    pub async fn stop_session_container(&self, session_id: &str) -> SandboxResult<bool> {
        scratch::validate_session_id(session_id)?;
        self.lifecycle
            .remove(&ContainerKey::ephemeral(session_id))
            .await
    }

    /// Session deleted or archived: drop its container and its record.
    pub async fn end_session(&self, session_id: &str) -> SandboxResult<()> {
        self.stop_session_container(session_id).await?;
        self.sessions.write().remove(session_id);
        Ok(())
    }

    /// Creates the record; the container follows lazily on first use.
    pub fn create_named_environment(&self, name: &str) -> SandboxResult<NamedEnvironment> {
        self.environments.create(name, None)
    }

    pub fn create_named_environment_with_mount(
        &self,
        name: &str,
        host_mount: PathBuf,
    ) -> SandboxResult<NamedEnvironment> {
        self.environments.create(name, Some(host_mount))
    }

    /// Removes the environment's container, then its record and managed
    /// directory. Returns false if neither existed.
    pub async fn delete_named_environment(&self, slug: &str) -> SandboxResult<bool> {
        if !crate::environments::is_valid_slug(slug) {
            return Err(SandboxError::InvalidEnvironmentName(slug.to_string()));
        }
        let removed_container = if self.runtime_available() {
            self.lifecycle.remove(&ContainerKey::named(slug)).await?
        } else {
            false
        };
        let environments = Arc::clone(&self.environments);
        let slug = slug.to_string();
        let removed_record = blocking(move || environments.delete(&slug)).await?;
        Ok(removed_container || removed_record)
    }

    pub fn list_named_environments(&self) -> Vec<NamedEnvironment> {
        self.environments.list()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            backend: self.runtime.backend_name(),
            runtime_available: self.runtime_available(),
            containers: self.registry.snapshot(),
            health: self.health.snapshot(Instant::now()),
            sessions: self.sessions.read().len(),
        }
    }

    /// Stops the shared default container. Named containers keep running;
    /// session containers are left for the next startup reconciliation.
    pub async fn shutdown(&self) -> SandboxResult<()> {
        if !self.runtime_available() {
            return Ok(());
        }
        if self.lifecycle.stop(&ContainerKey::default_shared()).await? {
            info!("Default container stopped");
        }
        Ok(())
    }
}

/// Runs filesystem work on the blocking pool.
async fn blocking<T, F>(work: F) -> SandboxResult<T>
where
    F: FnOnce() -> SandboxResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SandboxError::Io(std::io::Error::other(e)))?
}

fn launch_document(launch: &LaunchParams) -> SandboxResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec(launch)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::FakeRuntime;
    use crate::exec::ExecEvent;
    use crate::policy::SessionSource;

    fn engine(dir: &tempfile::TempDir) -> (Arc<FakeRuntime>, SandboxEngine) {
        let mut config = Config::default();
        config.paths.data_dir = dir.path().join("data");
        config.paths.vault = dir.path().join("vault");
        config.paths.transcripts = dir.path().join("transcripts");
        config.paths.credentials_file = dir.path().join("credentials.json");
        config.paths.tool_config = dir.path().join("tools.json");
        config.paths.host_scratch = dir.path().join("scratch");
        let runtime = Arc::new(FakeRuntime::new());
        let engine = SandboxEngine::new(config, runtime.clone()).unwrap();
        (runtime, engine)
    }

    fn request(session: &str, source: SessionSource, trust: &str) -> ExecutionRequest {
        ExecutionRequest {
            session_id: session.to_string(),
            workspace_id: None,
            named_env_slug: None,
            session_source: source,
            requested_trust_level: trust.to_string(),
            payload: serde_json::json!({"prompt": "hi"}),
        }
    }

    #[tokio::test]
    async fn test_sandboxed_run_uses_default_container() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, engine) = engine(&dir);
        engine.startup().await.unwrap();

        let mut run = engine
            .run_session(&request("s1", SessionSource::Local, "sandbox"))
            .await
            .unwrap();
        assert_eq!(run.outcome.effective_mode, ExecutionMode::Sandboxed);
        assert_eq!(
            run.outcome.container_name.as_deref(),
            Some("fluux-sandbox-default")
        );
        assert!(matches!(run.events.recv().await, Some(ExecEvent::Done { .. })));

        let exec = runtime.execs().pop().unwrap();
        assert_eq!(exec.container, "fluux-sandbox-default");
        let launch = exec.launch().unwrap();
        assert_eq!(launch["working_dir"], "/scratch/s1");
        assert_eq!(launch["trust_level"], "sandboxed");
        assert_eq!(launch["payload"]["prompt"], "hi");
        assert_eq!(&exec.argv[4..6], &["s1", ""]);
        // Each exec is tagged so it can be killed inside the container
        let exec_id = exec.exec_id.clone().unwrap();
        assert_eq!(exec.argv[6], exec_id);

        let record = engine.session_record("s1").unwrap();
        assert_eq!(record.requested_trust_level, "sandbox");
        assert_eq!(record.effective_execution_mode, ExecutionMode::Sandboxed);
    }

    #[tokio::test]
    async fn test_workspace_session_gets_ephemeral_container() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, engine) = engine(&dir);
        engine.startup().await.unwrap();

        let mut req = request("s2", SessionSource::Local, "sandboxed");
        req.workspace_id = Some("ws1".to_string());
        let run = engine.run_session(&req).await.unwrap();
        assert_eq!(
            run.outcome.container_name.as_deref(),
            Some("fluux-sandbox-sess-s2")
        );
        assert!(runtime.container("fluux-sandbox-sess-s2").is_some());

        assert!(engine.stop_session_container("s2").await.unwrap());
        assert!(!engine.stop_session_container("s2").await.unwrap());
        assert!(runtime.container("fluux-sandbox-sess-s2").is_none());
        assert!(runtime.container("fluux-sandbox-default").is_some());
    }

    #[tokio::test]
    async fn test_unknown_trust_level_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let (_runtime, engine) = engine(&dir);
        engine.startup().await.unwrap();
        let err = engine
            .run_session(&request("s1", SessionSource::Local, "sandboxd"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::UnknownTrustLevel(_)));
        assert!(engine.session_record("s1").is_none());
    }

    #[tokio::test]
    async fn test_invalid_session_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_runtime, engine) = engine(&dir);
        engine.startup().await.unwrap();
        let err = engine
            .resolve_execution_mode(&request("../etc", SessionSource::Local, "sandboxed"))
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidIdentifier(_)));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_local_fallback_records_effective_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, engine) = engine(&dir);
        runtime.set_available(false);
        engine.startup().await.unwrap();

        let outcome = engine
            .resolve_execution_mode(&request("s1", SessionSource::Local, "sandboxed"))
            .unwrap();
        assert_eq!(outcome.effective_mode, ExecutionMode::Direct);
        assert!(!outcome.warnings.is_empty());
        assert!(outcome.container_name.is_none());

        let record = engine.session_record("s1").unwrap();
        assert_eq!(record.requested_trust_level, "sandboxed");
        assert_eq!(record.effective_execution_mode, ExecutionMode::Direct);

        let err = engine
            .resolve_execution_mode(&request("s2", SessionSource::External, "sandboxed"))
            .unwrap_err();
        assert!(matches!(err, SandboxError::PolicyDenied(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_direct_run_executes_on_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths.data_dir = dir.path().join("data");
        config.paths.host_scratch = dir.path().join("scratch");
        config.paths.credentials_file = dir.path().join("credentials.json");
        config.paths.tool_config = dir.path().join("tools.json");
        config.runtime.agent_command = vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"cat > launch.json; printf '{"type":"delta","text":"%s"}\n' "$(pwd)"; echo '{"type":"done"}'"#
                .to_string(),
        ];
        let engine = SandboxEngine::new(config, Arc::new(FakeRuntime::new())).unwrap();

        let mut run = engine
            .run_session(&request("s9", SessionSource::Local, "direct"))
            .await
            .unwrap();
        assert_eq!(run.outcome.effective_mode, ExecutionMode::Direct);

        let Some(ExecEvent::Delta { text }) = run.events.recv().await else {
            panic!("expected delta");
        };
        assert!(text.ends_with("/scratch/s9"), "{text}");
        assert!(matches!(run.events.recv().await, Some(ExecEvent::Done { .. })));

        let launch = std::fs::read_to_string(dir.path().join("scratch/s9/launch.json")).unwrap();
        let launch: serde_json::Value = serde_json::from_str(&launch).unwrap();
        assert_eq!(launch["trust_level"], "direct");
        assert_eq!(launch["session_id"], "s9");
    }

    #[tokio::test]
    async fn test_named_environment_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, engine) = engine(&dir);
        engine.startup().await.unwrap();

        let env = engine.create_named_environment("Proj X").unwrap();
        assert_eq!(env.slug, "proj-x");
        // Lazy: no container yet
        assert!(runtime.container("fluux-sandbox-env-proj-x").is_none());

        let mut req = request("s1", SessionSource::Local, "sandboxed");
        req.named_env_slug = Some(env.slug.clone());
        engine.run_session(&req).await.unwrap();
        assert!(runtime.container("fluux-sandbox-env-proj-x").unwrap().running);

        // Ending a session leaves the environment container alone
        engine.end_session("s1").await.unwrap();
        assert!(runtime.container("fluux-sandbox-env-proj-x").is_some());

        assert_eq!(engine.list_named_environments().len(), 1);
        assert!(engine.delete_named_environment("proj-x").await.unwrap());
        assert!(!engine.delete_named_environment("proj-x").await.unwrap());
        assert!(runtime.container("fluux-sandbox-env-proj-x").is_none());
        assert!(engine.list_named_environments().is_empty());

        req.named_env_slug = Some("proj-x".to_string());
        let err = engine.run_session(&req).await.err().unwrap();
        assert!(matches!(err, SandboxError::EnvironmentNotFound(_)));
    }

    #[tokio::test]
    async fn test_status_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, engine) = engine(&dir);
        engine.startup().await.unwrap();

        let status = engine.status();
        assert_eq!(status.backend, "fake");
        assert!(status.runtime_available);
        assert_eq!(status.containers.len(), 1);
        assert_eq!(status.containers[0].name, "fluux-sandbox-default");

        engine.shutdown().await.unwrap();
        assert!(!runtime.container("fluux-sandbox-default").unwrap().running);
    }
}
