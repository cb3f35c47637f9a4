//! Container lifecycle: get-or-create, exec, stop and remove.
//!
//! Every operation on a key runs under that key's async lock, so
//! concurrent callers for one key serialize while different keys proceed in
//! parallel. The lock is an owned guard: it is released on every exit path,
//! including when the caller's future is dropped mid-operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{SandboxError, SandboxResult};
use crate::exec::{event_channel, pump_events, EventStream, ExecSpec, ExitClass};
use crate::health::HealthMonitor;
use crate::registry::{ContainerRegistry, ContainerState};

use super::runtime::ContainerRuntime;
use super::spec::{ContainerKey, ContainerSpec, MountSource};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

type LockMap = HashMap<ContainerKey, Arc<AsyncMutex<()>>>;

/// Per-key async locks. Entries are pruned when the last holder releases.
#[derive(Default, Clone)]
struct KeyLocks {
    locks: Arc<parking_lot::Mutex<LockMap>>,
}

struct KeyGuard {
    key: ContainerKey,
    locks: Arc<parking_lot::Mutex<LockMap>>,
    _guard: OwnedMutexGuard<()>,
}

impl KeyLocks {
    async fn acquire(&self, key: &ContainerKey) -> KeyGuard {
        let lock = Arc::clone(self.locks.lock().entry(key.clone()).or_default());
        let guard = lock.lock_owned().await;
        KeyGuard {
            key: key.clone(),
            locks: Arc::clone(&self.locks),
            _guard: guard,
        }
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // Two references: the map's and the one inside our own guard.
        // Anything more is a waiter that still needs the entry.
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2)
        {
            locks.remove(&self.key);
        }
    }
}

/// A container ready for exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub key: ContainerKey,
    pub name: String,
    /// Working directory override for execs; `None` means per-session
    /// scratch
    pub workdir: Option<String>,
}

pub struct ContainerLifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<ContainerRegistry>,
    health: Arc<HealthMonitor>,
    locks: KeyLocks,
    prefix: String,
    pids_limit: u32,
    capacity_margin: u32,
    stop_grace: Duration,
    ready_timeout: Duration,
}

impl ContainerLifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<ContainerRegistry>,
        health: Arc<HealthMonitor>,
        config: &Config,
    ) -> Self {
        Self {
            runtime,
            registry,
            health,
            locks: KeyLocks::default(),
            prefix: config.runtime.container_prefix.clone(),
            pids_limit: config.hardening.pids_limit,
            capacity_margin: config.hardening.capacity_margin,
            stop_grace: config.runtime.stop_grace(),
            ready_timeout: config.runtime.ready_timeout(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    pub fn container_name(&self, key: &ContainerKey) -> String {
        key.container_name(&self.prefix)
    }

    /// Idempotent get-or-create. A running container with the intended
    /// fingerprint is reused; a drifted one is replaced; a crashed one is
    /// recreated after its cool-down.
    pub async fn ensure(&self, spec: &ContainerSpec) -> SandboxResult<ContainerHandle> {
        let _lock = self.locks.acquire(&spec.key).await;
        let handle = ContainerHandle {
            key: spec.key.clone(),
            name: spec.name.clone(),
            workdir: spec.workdir.clone(),
        };

        if let Some(ContainerState::CoolingDown { until }) = self.registry.state(&spec.key) {
            self.cool_down(&spec.key, until).await;
            self.runtime.remove(&spec.name).await?;
        } else {
            match self.runtime.inspect(&spec.name).await? {
                Some(info) if info.running => {
                    if info.fingerprint() == Some(spec.fingerprint.as_str()) {
                        self.registry
                            .adopt(&spec.key, &spec.name, info.fingerprint());
                        return Ok(handle);
                    }
                    info!(
                        container = %spec.name,
                        found = ?info.fingerprint(),
                        intended = %spec.fingerprint,
                        "Configuration drift, recreating container"
                    );
                    self.runtime.remove(&spec.name).await?;
                }
                Some(info) => {
                    // Our own stop may still end in a kill after the grace
                    // period; only the registry knows who stopped it
                    let stopped_here = matches!(
                        self.registry.state(&spec.key),
                        Some(ContainerState::Stopping | ContainerState::Stopped)
                    );
                    if info.crashed() && !stopped_here {
                        warn!(
                            container = %spec.name,
                            exit_code = ?info.exit_code,
                            oom_killed = info.oom_killed,
                            "Container exited unexpectedly"
                        );
                        self.registry.set_state(&spec.key, ContainerState::Crashed);
                        let delay = self.health.record_crash(&spec.key, Instant::now());
                        self.cool_down(&spec.key, Instant::now() + delay).await;
                    }
                    self.runtime.remove(&spec.name).await?;
                }
                None => {}
            }
        }

        self.create(spec).await?;
        Ok(handle)
    }

    async fn cool_down(&self, key: &ContainerKey, until: Instant) {
        self.registry
            .set_state(key, ContainerState::CoolingDown { until });
        let remaining = until.saturating_duration_since(Instant::now());
        if !remaining.is_zero() {
            info!(key = %key, "Waiting {}s before recreating", remaining.as_secs());
            tokio::time::sleep(remaining).await;
        }
    }

    /// Creates the container and waits for it to run. The caller holds the
    /// key lock.
    async fn create(&self, spec: &ContainerSpec) -> SandboxResult<()> {
        // Writable bind sources must exist, or the runtime creates them
        // owned by root
        for mount in spec.mounts.iter().filter(|m| !m.read_only) {
            if let MountSource::Bind(path) = &mount.source {
                tokio::fs::create_dir_all(path)
                    .await
                    .map_err(|e| SandboxError::ContainerCreateFailed {
                        name: spec.name.clone(),
                        reason: format!("cannot prepare {}: {e}", path.display()),
                    })?;
            }
        }

        let guard = self.registry.begin_create(&spec.key, &spec.name);
        let result = async {
            self.runtime.create(spec).await?;
            self.wait_ready(&spec.name).await
        }
        .await;

        match result {
            Ok(()) => {
                guard.commit(&spec.fingerprint);
                self.health.record_started(&spec.key, Instant::now());
                info!(container = %spec.name, kind = %spec.kind(), "Container ready");
                Ok(())
            }
            Err(e) => {
                drop(guard);
                if let Err(cleanup) = self.runtime.remove(&spec.name).await {
                    debug!("Cleanup after failed create of {}: {cleanup}", spec.name);
                }
                Err(SandboxError::ContainerCreateFailed {
                    name: spec.name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn wait_ready(&self, name: &str) -> SandboxResult<()> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            match self.runtime.inspect(name).await? {
                Some(info) if info.running => return Ok(()),
                Some(info) if !info.running && info.exit_code.is_some() => {
                    return Err(SandboxError::ContainerCrashed {
                        name: name.to_string(),
                        exit_code: info.exit_code,
                        oom_killed: info.oom_killed,
                    });
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(SandboxError::Runtime {
                    command: "wait for container".to_string(),
                    stderr: format!(
                        "{name} not running after {}s",
                        self.ready_timeout.as_secs()
                    ),
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Starts `spec` inside a running container and streams its events.
    ///
    /// Refused with `ExecRejectedCapacity` when the live process count is
    /// within the safety margin of the container's ceiling. The exit is
    /// classified when the stream ends: a clean exit counts towards
    /// stability, a container that died under the exec enters cool-down,
    /// and a timed out or abandoned exec is killed inside the container.
    pub async fn exec(
        &self,
        handle: &ContainerHandle,
        spec: ExecSpec,
        timeout: Duration,
    ) -> SandboxResult<EventStream> {
        let processes = self
            .runtime
            .process_count(&handle.name)
            .await
            .map_err(|e| SandboxError::ExecTransient(e.to_string()))?;
        if processes.saturating_add(self.capacity_margin) >= self.pids_limit {
            warn!(
                container = %handle.name,
                processes,
                limit = self.pids_limit,
                "Refusing exec, container near its process ceiling"
            );
            return Err(SandboxError::ExecRejectedCapacity {
                name: handle.name.clone(),
                processes,
                limit: self.pids_limit,
            });
        }

        let process = self
            .runtime
            .exec(&handle.name, &spec)
            .await
            .map_err(|e| SandboxError::ExecTransient(e.to_string()))?;

        let (tx, rx) = event_channel();
        let recorder = ExitRecorder {
            key: handle.key.clone(),
            name: handle.name.clone(),
            exec_id: spec.exec_id.clone(),
            runtime: Arc::clone(&self.runtime),
            registry: Arc::clone(&self.registry),
            health: Arc::clone(&self.health),
            locks: self.locks.clone(),
        };

        tokio::spawn(async move {
            let class = pump_events(process, timeout, &tx).await;
            debug!(container = %recorder.name, ?class, "Exec finished");
            recorder.record(class).await;
            if let Some(event) = class.error_event(timeout) {
                let _ = tx.send(event).await;
            }
        });

        Ok(rx)
    }

    /// Graceful stop. Returns false when there was nothing running.
    pub async fn stop(&self, key: &ContainerKey) -> SandboxResult<bool> {
        let _lock = self.locks.acquire(key).await;
        let name = self.container_name(key);
        match self.runtime.inspect(&name).await? {
            Some(info) if info.running => {
                self.registry.set_state(key, ContainerState::Stopping);
                self.runtime.stop(&name, self.stop_grace).await?;
                self.registry.set_state(key, ContainerState::Stopped);
                info!(container = %name, "Container stopped");
                Ok(true)
            }
            Some(_) => {
                self.registry.set_state(key, ContainerState::Stopped);
                Ok(false)
            }
            None => {
                self.registry.remove(key);
                Ok(false)
            }
        }
    }

    /// Stops (if needed) and removes. Returns false when no container
    /// existed.
    pub async fn remove(&self, key: &ContainerKey) -> SandboxResult<bool> {
        let _lock = self.locks.acquire(key).await;
        let name = self.container_name(key);
        let removed = match self.runtime.inspect(&name).await? {
            Some(info) => {
                if info.running {
                    self.registry.set_state(key, ContainerState::Stopping);
                    self.runtime.stop(&name, self.stop_grace).await?;
                }
                self.runtime.remove(&name).await?;
                info!(container = %name, "Container removed");
                true
            }
            None => false,
        };
        self.registry.remove(key);
        self.health.forget(key);
        Ok(removed)
    }

    /// Removes a container by name under its key's lock, without a graceful
    /// stop. Used for deprecated shapes and drift during reconciliation.
    pub async fn force_remove(&self, key: Option<&ContainerKey>, name: &str) -> SandboxResult<()> {
        let _lock = match key {
            Some(key) => Some(self.locks.acquire(key).await),
            None => None,
        };
        self.runtime.remove(name).await?;
        if let Some(key) = key {
            self.registry.remove(key);
        }
        Ok(())
    }

    /// Records a running container found during reconciliation.
    pub async fn adopt(&self, key: &ContainerKey, name: &str, fingerprint: Option<&str>) {
        let _lock = self.locks.acquire(key).await;
        self.registry.adopt(key, name, fingerprint);
    }
}

/// Routes how one exec ended into health and registry state.
struct ExitRecorder {
    key: ContainerKey,
    name: String,
    exec_id: Option<String>,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<ContainerRegistry>,
    health: Arc<HealthMonitor>,
    locks: KeyLocks,
}

impl ExitRecorder {
    async fn record(&self, class: ExitClass) {
        match class {
            ExitClass::Success => self.health.record_success(&self.key, Instant::now()),
            ExitClass::InvalidIdentifier => {
                warn!(container = %self.name, "Entrypoint rejected the session identifier");
            }
            ExitClass::OomKilled => self.check_container(true).await,
            ExitClass::Interrupted => {
                self.terminate().await;
                self.check_container(false).await;
            }
            ExitClass::Failed(_) => self.check_container(false).await,
        }
    }

    /// The local client is gone, but its process tree may still run in the
    /// container.
    async fn terminate(&self) {
        let Some(exec_id) = &self.exec_id else {
            return;
        };
        if let Err(e) = self.runtime.terminate_exec(&self.name, exec_id).await {
            warn!(container = %self.name, exec = %exec_id, "Failed to kill exec in container: {e}");
        }
    }

    /// Decides whether the exec took its container down. Only a dead
    /// container is cooled down and recreated; an exec killed for memory in
    /// a container that still runs only counts towards backoff, so its
    /// siblings keep going.
    async fn check_container(&self, exec_oom_killed: bool) {
        let _lock = self.locks.acquire(&self.key).await;
        // Stopped, removed or already cooling down
        if self.registry.state(&self.key) != Some(ContainerState::Running) {
            return;
        }
        let info = match self.runtime.inspect(&self.name).await {
            Ok(Some(info)) => info,
            Ok(None) => return,
            Err(e) => {
                debug!(container = %self.name, "Cannot inspect after exec: {e}");
                return;
            }
        };

        let container_down = if exec_oom_killed {
            !info.running || info.oom_killed
        } else {
            info.crashed()
        };
        let now = Instant::now();
        if container_down {
            warn!(
                container = %self.name,
                exit_code = ?info.exit_code,
                oom_killed = info.oom_killed,
                "Container died under an exec"
            );
            let delay = self.health.record_crash(&self.key, now);
            self.registry
                .set_state(&self.key, ContainerState::CoolingDown { until: now + delay });
        } else if exec_oom_killed {
            self.health.record_crash(&self.key, now);
            warn!(container = %self.name, "Exec killed for memory, container still running");
        }
    }
}
