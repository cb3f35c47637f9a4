//! Known containers and their lifecycle state.
//!
//! One explicitly owned registry, populated only by reconciliation and by
//! the lifecycle manager's create/stop/remove calls. Mutations for a key
//! happen under that key's lifecycle lock; reads take a short shared lock
//! and never wait on container operations.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::container::spec::ContainerKey;

/// `absent → creating → running → stopping → stopped → absent`, with
/// `running → crashed → cooling-down → creating` on failure. Absent keys
/// have no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Creating,
    Running,
    Stopping,
    Stopped,
    Crashed,
    CoolingDown { until: Instant },
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Creating => "creating",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
            ContainerState::Crashed => "crashed",
            ContainerState::CoolingDown { .. } => "cooling-down",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ContainerState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerRecord {
    pub key: ContainerKey,
    pub name: String,
    pub state: ContainerState,
    /// Fingerprint label of the running container
    pub fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Found running at reconciliation rather than created by us
    pub adopted: bool,
}

#[derive(Default)]
pub struct ContainerRegistry {
    records: RwLock<HashMap<ContainerKey, ContainerRecord>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ContainerKey) -> Option<ContainerRecord> {
        self.records.read().get(key).cloned()
    }

    pub fn state(&self, key: &ContainerKey) -> Option<ContainerState> {
        self.records.read().get(key).map(|r| r.state)
    }

    /// All records, ordered by key.
    pub fn snapshot(&self) -> Vec<ContainerRecord> {
        let mut records: Vec<ContainerRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Registers a key as being created. Dropping the guard without
    /// `commit` removes the entry again, so a failed or cancelled create
    /// never leaves a stuck `creating` record.
    pub fn begin_create(&self, key: &ContainerKey, name: &str) -> CreatingGuard<'_> {
        self.records.write().insert(
            key.clone(),
            ContainerRecord {
                key: key.clone(),
                name: name.to_string(),
                state: ContainerState::Creating,
                fingerprint: None,
                created_at: Utc::now(),
                adopted: false,
            },
        );
        CreatingGuard {
            registry: self,
            key: key.clone(),
            committed: false,
        }
    }

    /// Records a running container found by inspection.
    pub fn adopt(&self, key: &ContainerKey, name: &str, fingerprint: Option<&str>) {
        let mut records = self.records.write();
        match records.get_mut(key) {
            Some(record) => {
                record.state = ContainerState::Running;
                record.fingerprint = fingerprint.map(String::from);
            }
            None => {
                debug!("Adopting {name} as {key}");
                records.insert(
                    key.clone(),
                    ContainerRecord {
                        key: key.clone(),
                        name: name.to_string(),
                        state: ContainerState::Running,
                        fingerprint: fingerprint.map(String::from),
                        created_at: Utc::now(),
                        adopted: true,
                    },
                );
            }
        }
    }

    /// Updates the state of a known key. Returns false for unknown keys.
    pub fn set_state(&self, key: &ContainerKey, state: ContainerState) -> bool {
        match self.records.write().get_mut(key) {
            Some(record) => {
                record.state = state;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &ContainerKey) -> Option<ContainerRecord> {
        self.records.write().remove(key)
    }
}

pub struct CreatingGuard<'a> {
    registry: &'a ContainerRegistry,
    key: ContainerKey,
    committed: bool,
}

impl CreatingGuard<'_> {
    pub fn commit(mut self, fingerprint: &str) {
        if let Some(record) = self.registry.records.write().get_mut(&self.key) {
            record.state = ContainerState::Running;
            record.fingerprint = Some(fingerprint.to_string());
            record.created_at = Utc::now();
        }
        self.committed = true;
    }
}

impl Drop for CreatingGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut records = self.registry.records.write();
        if records
            .get(&self.key)
            .is_some_and(|r| r.state == ContainerState::Creating)
        {
            debug!("Discarding uncommitted create of {}", self.key);
            records.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::spec::ContainerKind;

    #[test]
    fn test_commit_marks_running() {
        let registry = ContainerRegistry::new();
        let key = ContainerKey::named("proj-x");
        let guard = registry.begin_create(&key, "fx-env-proj-x");
        assert_eq!(registry.state(&key), Some(ContainerState::Creating));
        guard.commit("fp1");

        let record = registry.get(&key).unwrap();
        assert_eq!(record.state, ContainerState::Running);
        assert_eq!(record.fingerprint.as_deref(), Some("fp1"));
        assert!(!record.adopted);
    }

    #[test]
    fn test_dropped_guard_leaves_no_creating_entry() {
        let registry = ContainerRegistry::new();
        let key = ContainerKey::ephemeral("s1");
        {
            let _guard = registry.begin_create(&key, "fx-sess-s1");
        }
        assert!(registry.get(&key).is_none());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_adopt_and_snapshot_order() {
        let registry = ContainerRegistry::new();
        registry.adopt(&ContainerKey::default_shared(), "fx-default", Some("a"));
        registry.adopt(&ContainerKey::named("b"), "fx-env-b", None);
        registry.adopt(&ContainerKey::ephemeral("s1"), "fx-sess-s1", None);

        let kinds: Vec<ContainerKind> = registry.snapshot().iter().map(|r| r.key.kind).collect();
        assert_eq!(
            kinds,
            vec![ContainerKind::Ephemeral, ContainerKind::Named, ContainerKind::Default]
        );
        assert!(registry.get(&ContainerKey::default_shared()).unwrap().adopted);
    }

    #[test]
    fn test_set_state_unknown_key() {
        let registry = ContainerRegistry::new();
        assert!(!registry.set_state(&ContainerKey::named("nope"), ContainerState::Stopped));
    }

    #[test]
    fn test_state_serializes_as_label() {
        let json = serde_json::to_string(&ContainerState::CoolingDown {
            until: Instant::now(),
        })
        .unwrap();
        assert_eq!(json, r#""cooling-down""#);
    }
}
