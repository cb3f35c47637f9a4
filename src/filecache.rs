//! Parsed-file cache invalidated by modification time.
//!
//! Used for host files that operators edit while the daemon runs
//! (credentials, tool-server configuration): an edit is picked up on the
//! next read, no restart needed.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::error::SandboxResult;

/// Identity of a file version: mtime plus length, so a rewrite within the
/// filesystem's mtime granularity is still noticed when the size changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: SystemTime,
    len: u64,
}

pub struct FileCache<T> {
    path: PathBuf,
    entry: Mutex<Option<(Stamp, Arc<T>)>>,
}

impl<T: Default> FileCache<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entry: Mutex::new(None),
        }
    }

    /// Returns the cached value, re-parsing with `parse` when the file
    /// changed. A missing file yields `T::default()`.
    pub fn get(&self, parse: impl FnOnce(&str) -> SandboxResult<T>) -> SandboxResult<Arc<T>> {
        let stamp = match fs::metadata(&self.path) {
            Ok(meta) => Stamp {
                modified: meta.modified()?,
                len: meta.len(),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *self.entry.lock() = None;
                return Ok(Arc::new(T::default()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut entry = self.entry.lock();
        if let Some((cached, value)) = entry.as_ref() {
            if *cached == stamp {
                return Ok(Arc::clone(value));
            }
        }

        let content = fs::read_to_string(&self.path)?;
        let value = Arc::new(parse(&content)?);
        *entry = Some((stamp, Arc::clone(&value)));
        Ok(value)
    }
}
