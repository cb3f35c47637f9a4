use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{SandboxError, SandboxResult};

const MAX_SLUG_LEN: usize = 40;
const RECORD_FILE: &str = "environment.json";
const WORKSPACE_SUBDIR: &str = "workspace";

/// A user-created persistent working space, backed by one long-lived
/// container named after its slug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedEnvironment {
    pub slug: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    /// Host directory bound as the working directory instead of the
    /// managed one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_mount: Option<PathBuf>,
}

/// Derives a slug from a display name: lowercase ASCII letters, digits and
/// single dashes, at most 40 characters.
pub fn slugify(name: &str) -> SandboxResult<String> {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        return Err(SandboxError::InvalidEnvironmentName(name.to_string()));
    }
    Ok(slug)
}

/// Whether `slug` could have come out of `slugify`. Guards every path
/// built from a caller-supplied slug.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && !slug.contains("--")
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn with_suffix(base: &str, n: usize) -> String {
    let suffix = format!("-{n}");
    let keep = MAX_SLUG_LEN.saturating_sub(suffix.len()).min(base.len());
    format!("{}{suffix}", base[..keep].trim_end_matches('-'))
}

/// Durable named-environment records.
///
/// Layout:
///   {root}/{slug}/environment.json   slug, display name, created-at
///   {root}/{slug}/workspace/         working directory, bound at /workspace
///
/// Records are loaded once at open and served from memory; only `create`
/// and `delete` touch the disk.
pub struct EnvironmentStore {
    root: PathBuf,
    records: RwLock<BTreeMap<String, NamedEnvironment>>,
    write_lock: Mutex<()>,
}

impl EnvironmentStore {
    pub fn open(root: &Path) -> SandboxResult<Self> {
        fs::create_dir_all(root)?;
        let records = load_records(root)?;
        info!(
            "Environment store opened at {} ({} environments)",
            root.display(),
            records.len()
        );
        Ok(Self {
            root: root.to_path_buf(),
            records: RwLock::new(records),
            write_lock: Mutex::new(()),
        })
    }

    /// Creates an environment under a fresh slug derived from
    /// `display_name`. A taken slug gets a numeric suffix.
    pub fn create(
        &self,
        display_name: &str,
        host_mount: Option<PathBuf>,
    ) -> SandboxResult<NamedEnvironment> {
        let base = slugify(display_name)?;
        if let Some(mount) = &host_mount {
            if !mount.is_absolute() {
                return Err(SandboxError::InvalidEnvironmentName(format!(
                    "host mount must be an absolute path: {}",
                    mount.display()
                )));
            }
        }

        let _lock = self.write_lock.lock();
        let mut slug = base.clone();
        let mut n = 2;
        // A leftover directory without a record still claims its slug
        while self.records.read().contains_key(&slug) || self.root.join(&slug).exists() {
            slug = with_suffix(&base, n);
            n += 1;
        }

        let env = NamedEnvironment {
            slug,
            display_name: display_name.trim().to_string(),
            created_at: Utc::now(),
            host_mount,
        };
        let dir = self.root.join(&env.slug);
        fs::create_dir_all(&dir)?;
        if env.host_mount.is_none() {
            fs::create_dir_all(dir.join(WORKSPACE_SUBDIR))?;
        }
        write_atomic(&dir.join(RECORD_FILE), &serde_json::to_vec_pretty(&env)?)?;
        self.records.write().insert(env.slug.clone(), env.clone());

        info!(slug = %env.slug, "Created named environment {:?}", env.display_name);
        Ok(env)
    }

    pub fn get(&self, slug: &str) -> SandboxResult<Option<NamedEnvironment>> {
        if !is_valid_slug(slug) {
            return Err(SandboxError::InvalidEnvironmentName(slug.to_string()));
        }
        Ok(self.records.read().get(slug).cloned())
    }

    /// Like `get`, but a missing environment is an error.
    pub fn require(&self, slug: &str) -> SandboxResult<NamedEnvironment> {
        self.get(slug)?
            .ok_or_else(|| SandboxError::EnvironmentNotFound(slug.to_string()))
    }

    /// All environments, oldest first.
    pub fn list(&self) -> Vec<NamedEnvironment> {
        let mut envs: Vec<NamedEnvironment> = self.records.read().values().cloned().collect();
        envs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.slug.cmp(&b.slug)));
        envs
    }

    /// Deletes the record and the managed working directory. A host mount
    /// is never touched. Returns false if the slug was unknown.
    pub fn delete(&self, slug: &str) -> SandboxResult<bool> {
        if !is_valid_slug(slug) {
            return Err(SandboxError::InvalidEnvironmentName(slug.to_string()));
        }
        let _lock = self.write_lock.lock();
        let dir = self.root.join(slug);
        if !dir.exists() {
            self.records.write().remove(slug);
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        self.records.write().remove(slug);
        info!(slug, "Deleted named environment");
        Ok(true)
    }

    /// Host directory used as the environment's working directory.
    pub fn workspace_dir(&self, env: &NamedEnvironment) -> PathBuf {
        match &env.host_mount {
            Some(path) => path.clone(),
            None => self.root.join(&env.slug).join(WORKSPACE_SUBDIR),
        }
    }
}

/// Reads every record under `root`. Unreadable records are skipped.
fn load_records(root: &Path) -> SandboxResult<BTreeMap<String, NamedEnvironment>> {
    let mut records = BTreeMap::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let Some(slug) = entry.file_name().to_str().map(String::from) else {
            continue;
        };
        if !is_valid_slug(&slug) {
            continue;
        }
        let path = entry.path().join(RECORD_FILE);
        let env: NamedEnvironment = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(env) => env,
                Err(e) => {
                    warn!("Skipping environment {slug}: {e}");
                    continue;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!("Skipping environment {slug}: {e}");
                continue;
            }
        };
        if env.slug != slug {
            warn!("Skipping environment {slug}: record names {}", env.slug);
            continue;
        }
        records.insert(slug, env);
    }
    Ok(records)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> SandboxResult<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("proj-x").unwrap(), "proj-x");
        assert_eq!(slugify("  My Project!! 2 ").unwrap(), "my-project-2");
        assert_eq!(slugify("Été à Paris").unwrap(), "t-paris");
        assert_eq!(slugify(&"a".repeat(60)).unwrap().len(), 40);
        assert!(slugify("!!!").is_err());
        assert!(slugify("").is_err());
    }

    #[test]
    fn test_slug_validation() {
        assert!(is_valid_slug("proj-x"));
        assert!(is_valid_slug("a1"));
        for bad in ["", "-a", "a-", "a--b", "A", "../x", "a/b", "a.b"] {
            assert!(!is_valid_slug(bad), "{bad}");
        }
    }

    #[test]
    fn test_create_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::open(dir.path()).unwrap();

        let env = store.create("Proj X", None).unwrap();
        assert_eq!(env.slug, "proj-x");
        assert!(store.workspace_dir(&env).is_dir());
        assert_eq!(store.get("proj-x").unwrap(), Some(env.clone()));

        let list = store.list();
        assert_eq!(list, vec![env]);

        assert!(store.delete("proj-x").unwrap());
        assert!(!store.delete("proj-x").unwrap());
        assert_eq!(store.get("proj-x").unwrap(), None);
        assert!(matches!(
            store.require("proj-x"),
            Err(SandboxError::EnvironmentNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_names_get_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::open(dir.path()).unwrap();
        assert_eq!(store.create("proj x", None).unwrap().slug, "proj-x");
        assert_eq!(store.create("Proj-X", None).unwrap().slug, "proj-x-2");
        assert_eq!(store.create("PROJ X", None).unwrap().slug, "proj-x-3");

        let long = "b".repeat(40);
        assert_eq!(store.create(&long, None).unwrap().slug, long);
        let second = store.create(&long, None).unwrap().slug;
        assert_eq!(second.len(), 40);
        assert!(second.ends_with("-2"));
    }

    #[test]
    fn test_host_mount_is_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::open(dir.path()).unwrap();

        let env = store
            .create("shared", Some(host.path().to_path_buf()))
            .unwrap();
        assert_eq!(store.workspace_dir(&env), host.path());
        assert!(!dir.path().join("shared").join(WORKSPACE_SUBDIR).exists());

        std::fs::write(host.path().join("keep.txt"), "x").unwrap();
        store.delete("shared").unwrap();
        assert!(host.path().join("keep.txt").exists());

        assert!(store.create("rel", Some(PathBuf::from("relative/dir"))).is_err());
    }

    #[test]
    fn test_rejects_path_like_slugs() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.get("../etc"),
            Err(SandboxError::InvalidEnvironmentName(_))
        ));
        assert!(store.delete("..").is_err());
    }

    #[test]
    fn test_reopen_loads_records() {
        let dir = tempfile::tempdir().unwrap();
        let created = {
            let store = EnvironmentStore::open(dir.path()).unwrap();
            store.create("Proj X", None).unwrap()
        };
        // Leftovers that are not environments
        fs::create_dir_all(dir.path().join("orphan")).unwrap();
        fs::create_dir_all(dir.path().join("broken")).unwrap();
        fs::write(dir.path().join("broken").join(RECORD_FILE), "{").unwrap();

        let store = EnvironmentStore::open(dir.path()).unwrap();
        assert_eq!(store.list(), vec![created.clone()]);
        assert_eq!(store.require("proj-x").unwrap(), created);
        // Leftover directories still claim their slug
        assert_eq!(store.create("orphan", None).unwrap().slug, "orphan-2");
    }
}
