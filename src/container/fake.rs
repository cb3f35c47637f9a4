//! In-memory container runtime.
//!
//! Simulates containers, bind mounts, process counts and exit codes without
//! a daemon. Used by the test suites and by the daemon's `--dry-run` mode.
//! Exec behavior is scripted through a handler that sees the full
//! invocation, including the bind mounts of the target container, so tests
//! can touch the host side of a mounted directory.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{SandboxError, SandboxResult};
use crate::exec::{ExecProcess, ExecSpec, EXIT_OOM_KILLED};

use super::runtime::{ContainerInfo, ContainerRuntime, EXIT_SIGTERM};
use super::spec::{ContainerSpec, Mount, MountSource, LABEL_OWNER};

/// One recorded `exec` call.
#[derive(Debug, Clone)]
pub struct ExecInvocation {
    pub container: String,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Vec<u8>,
    pub exec_id: Option<String>,
    pub mounts: Vec<Mount>,
}

impl ExecInvocation {
    /// The launch document written to stdin, if it parses.
    pub fn launch(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.stdin).ok()
    }

    /// Host directory bound at `target` in the exec'd container.
    pub fn host_path(&self, target: &str) -> Option<PathBuf> {
        self.mounts.iter().find_map(|m| match &m.source {
            MountSource::Bind(path) if m.target == target => Some(path.clone()),
            _ => None,
        })
    }
}

/// Scripted result of one exec: stdout lines then an exit code. A hanging
/// exec keeps its stream open after the lines until it is killed.
#[derive(Debug, Clone)]
pub struct ScriptedExec {
    pub lines: Vec<String>,
    pub exit_code: i32,
    pub hang: bool,
}

impl ScriptedExec {
    pub fn done() -> Self {
        Self {
            lines: vec![r#"{"type":"done"}"#.to_string()],
            exit_code: 0,
            hang: false,
        }
    }

    pub fn oom() -> Self {
        Self {
            lines: Vec::new(),
            exit_code: EXIT_OOM_KILLED,
            hang: false,
        }
    }

    pub fn hang() -> Self {
        Self {
            lines: vec![r#"{"type":"delta","text":"working"}"#.to_string()],
            exit_code: 0,
            hang: true,
        }
    }
}

type ExecHandler = Arc<dyn Fn(&ExecInvocation) -> ScriptedExec + Send + Sync>;

struct FakeContainer {
    info: ContainerInfo,
    mounts: Vec<Mount>,
    processes: u32,
}

#[derive(Default)]
struct FakeState {
    containers: BTreeMap<String, FakeContainer>,
    networks: BTreeSet<String>,
    volumes: BTreeSet<String>,
    execs: Vec<ExecInvocation>,
    /// (container, exec id) per `terminate_exec` call
    terminations: Vec<(String, String)>,
    fail_next_create: Option<String>,
}

pub struct FakeRuntime {
    state: Mutex<FakeState>,
    handler: Mutex<Option<ExecHandler>>,
    available: AtomicBool,
    create_delay: Mutex<Duration>,
    creates: AtomicUsize,
    stops: AtomicUsize,
    removes: AtomicUsize,
    network_creates: AtomicUsize,
    volume_creates: AtomicUsize,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            handler: Mutex::new(None),
            available: AtomicBool::new(true),
            create_delay: Mutex::new(Duration::ZERO),
            creates: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
            network_creates: AtomicUsize::new(0),
            volume_creates: AtomicUsize::new(0),
        }
    }

    // ── scripting ──────────────────────────────────

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay inside `create`, to widen race windows.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    pub fn fail_next_create(&self, reason: &str) {
        self.state.lock().fail_next_create = Some(reason.to_string());
    }

    pub fn set_exec_handler(
        &self,
        handler: impl Fn(&ExecInvocation) -> ScriptedExec + Send + Sync + 'static,
    ) {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    pub fn set_process_count(&self, name: &str, processes: u32) {
        if let Some(c) = self.state.lock().containers.get_mut(name) {
            c.processes = processes;
        }
    }

    /// Simulates the container dying with `exit_code`.
    pub fn crash(&self, name: &str, exit_code: i64, oom_killed: bool) {
        if let Some(c) = self.state.lock().containers.get_mut(name) {
            c.info.running = false;
            c.info.exit_code = Some(exit_code);
            c.info.oom_killed = oom_killed;
        }
    }

    /// Inserts a container that was not created through `create`, e.g. one
    /// left behind by an older release.
    pub fn insert(&self, info: ContainerInfo) {
        self.state.lock().containers.insert(
            info.name.clone(),
            FakeContainer {
                info,
                mounts: Vec::new(),
                processes: 1,
            },
        );
    }

    // ── observation ────────────────────────────────

    pub fn container(&self, name: &str) -> Option<ContainerInfo> {
        self.state.lock().containers.get(name).map(|c| c.info.clone())
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().containers.keys().cloned().collect()
    }

    pub fn execs(&self) -> Vec<ExecInvocation> {
        self.state.lock().execs.clone()
    }

    pub fn terminations(&self) -> Vec<(String, String)> {
        self.state.lock().terminations.clone()
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn network_create_calls(&self) -> usize {
        self.network_creates.load(Ordering::SeqCst)
    }

    pub fn volume_create_calls(&self) -> usize {
        self.volume_creates.load(Ordering::SeqCst)
    }

    fn unavailable() -> SandboxError {
        SandboxError::RuntimeUnavailable("fake runtime switched off".to_string())
    }

    fn check_available(&self) -> SandboxResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Self::unavailable())
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn backend_name(&self) -> &'static str {
        "fake"
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn inspect(&self, name: &str) -> SandboxResult<Option<ContainerInfo>> {
        self.check_available()?;
        Ok(self.container(name))
    }

    async fn list_owned(&self, owner: &str) -> SandboxResult<Vec<ContainerInfo>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .containers
            .values()
            .filter(|c| c.info.labels.get(LABEL_OWNER).map(String::as_str) == Some(owner))
            .map(|c| c.info.clone())
            .collect())
    }

    async fn create(&self, spec: &ContainerSpec) -> SandboxResult<()> {
        self.check_available()?;
        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.creates.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if let Some(reason) = state.fail_next_create.take() {
            return Err(SandboxError::Runtime {
                command: "fake run".to_string(),
                stderr: reason,
            });
        }
        if state.containers.contains_key(&spec.name) {
            return Err(SandboxError::Runtime {
                command: "fake run".to_string(),
                stderr: format!("Conflict. The container name {:?} is already in use", spec.name),
            });
        }
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                info: ContainerInfo {
                    name: spec.name.clone(),
                    labels: spec.labels.clone(),
                    running: true,
                    exit_code: None,
                    oom_killed: false,
                },
                mounts: spec.mounts.clone(),
                processes: 1,
            },
        );
        Ok(())
    }

    async fn stop(&self, name: &str, _grace: Duration) -> SandboxResult<()> {
        self.check_available()?;
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(c) = self.state.lock().containers.get_mut(name) {
            if c.info.running {
                // What docker reports once init forwards the stop signal
                c.info.running = false;
                c.info.exit_code = Some(EXIT_SIGTERM);
            }
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> SandboxResult<()> {
        self.check_available()?;
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.state.lock().containers.remove(name);
        Ok(())
    }

    async fn process_count(&self, name: &str) -> SandboxResult<u32> {
        self.check_available()?;
        match self.state.lock().containers.get(name) {
            Some(c) if c.info.running => Ok(c.processes),
            _ => Err(SandboxError::Runtime {
                command: "fake stats".to_string(),
                stderr: format!("container {name} is not running"),
            }),
        }
    }

    async fn exec(&self, name: &str, spec: &ExecSpec) -> SandboxResult<ExecProcess> {
        self.check_available()?;
        let invocation = {
            let mut state = self.state.lock();
            let container = match state.containers.get(name) {
                Some(c) if c.info.running => c,
                _ => {
                    return Err(SandboxError::Runtime {
                        command: "fake exec".to_string(),
                        stderr: format!("container {name} is not running"),
                    })
                }
            };
            let invocation = ExecInvocation {
                container: name.to_string(),
                argv: spec.argv.clone(),
                env: spec.env.clone(),
                stdin: spec.stdin.clone(),
                exec_id: spec.exec_id.clone(),
                mounts: container.mounts.clone(),
            };
            state.execs.push(invocation.clone());
            invocation
        };

        let handler = self.handler.lock().clone();
        let scripted = match handler {
            Some(handler) => handler(&invocation),
            None => ScriptedExec::done(),
        };

        let (line_tx, line_rx) = mpsc::channel(scripted.lines.len().max(1));
        for line in scripted.lines {
            // Capacity covers every line, so this never blocks or fails
            let _ = line_tx.try_send(line);
        }
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        if scripted.hang {
            tokio::spawn(async move {
                // Killed, or the process handle was dropped
                let _ = kill_rx.await;
                drop(line_tx);
                let _ = exit_tx.send(None);
            });
        } else {
            drop(line_tx);
            let _ = exit_tx.send(Some(scripted.exit_code));
        }
        Ok(ExecProcess::new(line_rx, exit_rx, kill_tx))
    }

    async fn terminate_exec(&self, name: &str, exec_id: &str) -> SandboxResult<()> {
        self.check_available()?;
        self.state
            .lock()
            .terminations
            .push((name.to_string(), exec_id.to_string()));
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> SandboxResult<bool> {
        self.check_available()?;
        Ok(self.state.lock().networks.contains(name))
    }

    async fn create_network(&self, name: &str) -> SandboxResult<()> {
        self.check_available()?;
        self.network_creates.fetch_add(1, Ordering::SeqCst);
        self.state.lock().networks.insert(name.to_string());
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> SandboxResult<bool> {
        self.check_available()?;
        Ok(self.state.lock().volumes.contains(name))
    }

    async fn create_volume(&self, name: &str) -> SandboxResult<()> {
        self.check_available()?;
        self.volume_creates.fetch_add(1, Ordering::SeqCst);
        self.state.lock().volumes.insert(name.to_string());
        Ok(())
    }
}
