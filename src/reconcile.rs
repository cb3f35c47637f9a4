//! Aligns the containers the runtime actually has with the ones we intend
//! to have.
//!
//! Runs at startup, on the periodic timer and on demand. Only containers
//! carrying our ownership label are considered. Removal of a deprecated
//! shape is a hard migration: there is no soft transition period.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::container::lifecycle::ContainerLifecycleManager;
use crate::container::runtime::ContainerInfo;
use crate::container::spec::{ContainerKey, ContainerKind, SpecBuilder};
use crate::environments::EnvironmentStore;
use crate::error::{SandboxError, SandboxResult};

/// What one pass did, by container name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Kind or naming no longer supported
    pub removed_deprecated: Vec<String>,
    /// Ephemeral without a live session, named without an environment
    pub removed_orphans: Vec<String>,
    /// Stale fingerprint, replaced now (named/default) or on next use
    /// (ephemeral)
    pub recreated: Vec<String>,
    pub adopted: Vec<String>,
    pub default_ready: bool,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !(self.removed_deprecated.is_empty()
            && self.removed_orphans.is_empty()
            && self.recreated.is_empty())
    }
}

pub struct Reconciler {
    lifecycle: Arc<ContainerLifecycleManager>,
    specs: SpecBuilder,
    environments: Arc<EnvironmentStore>,
    network: String,
    tool_volume: String,
    infrastructure: OnceCell<()>,
}

impl Reconciler {
    pub fn new(
        lifecycle: Arc<ContainerLifecycleManager>,
        specs: SpecBuilder,
        environments: Arc<EnvironmentStore>,
        config: &Config,
    ) -> Self {
        Self {
            lifecycle,
            specs,
            environments,
            network: config.runtime.network.clone(),
            tool_volume: config.runtime.tool_volume.clone(),
            infrastructure: OnceCell::new(),
        }
    }

    /// Network and tool volume, each created only if absent. Succeeds at
    /// most once per process; a failure is retried on the next call.
    pub async fn ensure_infrastructure(&self) -> SandboxResult<()> {
        self.infrastructure
            .get_or_try_init(|| async {
                let runtime = self.lifecycle.runtime();
                if !runtime.network_exists(&self.network).await? {
                    runtime.create_network(&self.network).await?;
                }
                if !runtime.volume_exists(&self.tool_volume).await? {
                    runtime.create_volume(&self.tool_volume).await?;
                }
                Ok::<(), SandboxError>(())
            })
            .await?;
        Ok(())
    }

    /// One full pass. `live_sessions` are the session ids whose ephemeral
    /// containers must survive.
    pub async fn reconcile(&self, live_sessions: &HashSet<String>) -> SandboxResult<ReconcileReport> {
        self.ensure_infrastructure().await?;

        let mut report = ReconcileReport::default();
        let owned = self
            .lifecycle
            .runtime()
            .list_owned(self.specs.owner())
            .await?;

        for info in owned {
            let name = info.name.clone();
            if let Err(e) = self.reconcile_one(info, live_sessions, &mut report).await {
                warn!("Reconciling {name} failed: {e}");
                report.errors.push(format!("{name}: {e}"));
            }
        }

        match self.lifecycle.ensure(&self.specs.default_shared()).await {
            Ok(_) => report.default_ready = true,
            Err(e) => {
                error!("Default container unavailable: {e}");
                report.errors.push(e.to_string());
            }
        }

        if report.changed() {
            info!(
                deprecated = report.removed_deprecated.len(),
                orphans = report.removed_orphans.len(),
                recreated = report.recreated.len(),
                adopted = report.adopted.len(),
                "Reconciliation changed containers"
            );
        } else {
            info!(adopted = report.adopted.len(), "Reconciliation: nothing to change");
        }
        Ok(report)
    }

    async fn reconcile_one(
        &self,
        info: ContainerInfo,
        live_sessions: &HashSet<String>,
        report: &mut ReconcileReport,
    ) -> SandboxResult<()> {
        let Some(key) = ContainerKey::from_labels(self.specs.prefix(), &info.name, &info.labels)
        else {
            info!(container = %info.name, "Removing container of a deprecated shape");
            self.lifecycle.force_remove(None, &info.name).await?;
            report.removed_deprecated.push(info.name);
            return Ok(());
        };

        let intended = self.specs.intended_fingerprint(key.kind);
        let drifted = info.fingerprint() != Some(intended.as_str());

        match key.kind {
            ContainerKind::Ephemeral => {
                if !live_sessions.contains(&key.key) {
                    info!(container = %info.name, "Removing orphaned session container");
                    self.lifecycle.remove(&key).await?;
                    report.removed_orphans.push(info.name);
                } else if drifted {
                    // Recreated lazily on the session's next exec
                    self.lifecycle.force_remove(Some(&key), &info.name).await?;
                    report.recreated.push(info.name);
                } else if info.running {
                    self.lifecycle
                        .adopt(&key, &info.name, info.fingerprint())
                        .await;
                    report.adopted.push(info.name);
                }
            }
            ContainerKind::Named => {
                let Some(env) = self.environments.get(&key.key).ok().flatten() else {
                    info!(container = %info.name, "Removing container of a deleted environment");
                    self.lifecycle.remove(&key).await?;
                    report.removed_orphans.push(info.name);
                    return Ok(());
                };
                if info.running && !drifted {
                    self.lifecycle
                        .adopt(&key, &info.name, info.fingerprint())
                        .await;
                    report.adopted.push(info.name);
                } else {
                    let spec = self
                        .specs
                        .named(&env, self.environments.workspace_dir(&env));
                    self.lifecycle.ensure(&spec).await?;
                    if drifted {
                        report.recreated.push(info.name);
                    }
                }
            }
            ContainerKind::Default => {
                // Ensured after the loop; only record what happens here
                if info.running && !drifted {
                    report.adopted.push(info.name);
                } else if drifted {
                    report.recreated.push(info.name);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::FakeRuntime;
    use crate::container::runtime::ContainerRuntime;
    use crate::container::spec::{LABEL_FINGERPRINT, LABEL_KEY, LABEL_KIND, LABEL_OWNER};
    use crate::health::HealthMonitor;
    use crate::registry::ContainerRegistry;
    use std::collections::BTreeMap;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
        runtime: Arc<FakeRuntime>,
        environments: Arc<EnvironmentStore>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths.data_dir = dir.path().to_path_buf();
        config.paths.vault = dir.path().join("vault");
        config.paths.transcripts = dir.path().join("transcripts");
        let runtime = Arc::new(FakeRuntime::new());
        let health = Arc::new(HealthMonitor::new(&config.health));
        let lifecycle = Arc::new(ContainerLifecycleManager::new(
            runtime.clone(),
            Arc::new(ContainerRegistry::new()),
            health,
            &config,
        ));
        let environments = Arc::new(EnvironmentStore::open(&dir.path().join("environments")).unwrap());
        let reconciler = Reconciler::new(
            lifecycle,
            SpecBuilder::new(&config),
            environments.clone(),
            &config,
        );
        Fixture {
            _dir: dir,
            config,
            runtime,
            environments,
            reconciler,
        }
    }

    fn owned(name: &str, kind: &str, key: &str, fingerprint: &str) -> ContainerInfo {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_OWNER.to_string(), "fluux-sandbox".to_string());
        labels.insert(LABEL_KIND.to_string(), kind.to_string());
        labels.insert(LABEL_KEY.to_string(), key.to_string());
        labels.insert(LABEL_FINGERPRINT.to_string(), fingerprint.to_string());
        ContainerInfo {
            name: name.to_string(),
            labels,
            running: true,
            exit_code: None,
            oom_killed: false,
        }
    }

    #[tokio::test]
    async fn test_infrastructure_created_once() {
        let f = fixture();
        f.reconciler.ensure_infrastructure().await.unwrap();
        f.reconciler.ensure_infrastructure().await.unwrap();
        f.reconciler.reconcile(&HashSet::new()).await.unwrap();
        assert_eq!(f.runtime.network_create_calls(), 1);
        assert_eq!(f.runtime.volume_create_calls(), 1);
    }

    #[tokio::test]
    async fn test_existing_infrastructure_is_not_recreated() {
        let f = fixture();
        f.runtime.create_network("fluux-sandbox-net").await.unwrap();
        f.runtime.create_volume("fluux-sandbox-tools").await.unwrap();
        f.reconciler.ensure_infrastructure().await.unwrap();
        assert_eq!(f.runtime.network_create_calls(), 1);
        assert_eq!(f.runtime.volume_create_calls(), 1);
    }

    #[tokio::test]
    async fn test_removes_deprecated_and_orphans() {
        let f = fixture();
        let specs = SpecBuilder::new(&f.config);
        let fp = specs.intended_fingerprint(ContainerKind::Ephemeral);

        f.runtime.insert(owned("fluux-sandbox-agent-1", "agent", "1", "x"));
        f.runtime.insert(owned("fluux-sandbox-sess-gone", "ephemeral", "gone", &fp));
        f.runtime.insert(owned("fluux-sandbox-sess-live", "ephemeral", "live", &fp));
        f.runtime.insert(owned(
            "fluux-sandbox-env-deleted",
            "named",
            "deleted",
            &specs.intended_fingerprint(ContainerKind::Named),
        ));
        // Not ours: never touched
        let mut foreign = owned("postgres", "default", "default", "x");
        foreign.labels.remove(LABEL_OWNER);
        f.runtime.insert(foreign);

        let live: HashSet<String> = ["live".to_string()].into_iter().collect();
        let report = f.reconciler.reconcile(&live).await.unwrap();

        assert_eq!(report.removed_deprecated, vec!["fluux-sandbox-agent-1"]);
        let mut orphans = report.removed_orphans.clone();
        orphans.sort();
        assert_eq!(orphans, vec!["fluux-sandbox-env-deleted", "fluux-sandbox-sess-gone"]);
        assert!(report.adopted.contains(&"fluux-sandbox-sess-live".to_string()));
        assert!(report.default_ready);

        let mut names = f.runtime.container_names();
        names.sort();
        assert_eq!(
            names,
            vec!["fluux-sandbox-default", "fluux-sandbox-sess-live", "postgres"]
        );
    }

    #[tokio::test]
    async fn test_named_drift_recreated_matching_untouched() {
        let f = fixture();
        let stale = f.environments.create("stale", None).unwrap();
        let fresh = f.environments.create("fresh", None).unwrap();
        let specs = SpecBuilder::new(&f.config);
        let fp = specs.intended_fingerprint(ContainerKind::Named);

        f.runtime
            .insert(owned("fluux-sandbox-env-stale", "named", &stale.slug, "0000"));
        f.runtime
            .insert(owned("fluux-sandbox-env-fresh", "named", &fresh.slug, &fp));

        let report = f.reconciler.reconcile(&HashSet::new()).await.unwrap();
        assert_eq!(report.recreated, vec!["fluux-sandbox-env-stale"]);
        assert!(report.adopted.contains(&"fluux-sandbox-env-fresh".to_string()));

        let stale_now = f.runtime.container("fluux-sandbox-env-stale").unwrap();
        assert_eq!(stale_now.fingerprint(), Some(fp.as_str()));
        // Only the stale env and the default container were created
        assert_eq!(f.runtime.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_default_adopted_when_current() {
        let f = fixture();
        let spec = SpecBuilder::new(&f.config).default_shared();
        f.runtime.create(&spec).await.unwrap();

        let report = f.reconciler.reconcile(&HashSet::new()).await.unwrap();
        assert_eq!(report.adopted, vec!["fluux-sandbox-default"]);
        assert!(report.recreated.is_empty());
        assert_eq!(f.runtime.create_calls(), 1);
        assert!(!report.changed());
    }
}
