//! Per-key mutual exclusion.
//!
//! Cache entries and destination directories are shared mutable resources:
//! a regeneration triggered by a watch event can overlap a run that is still
//! copying files. [`KeyedLocks`] hands out one guard per key (a fingerprint,
//! a destination path) and blocks other acquirers of the same key until the
//! guard is dropped. Different keys never contend.
//!
//! Several generators in one process may share a cache root or a
//! destination, so the stores lock through the process-wide [`global`]
//! registry, keyed by [`path_key`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, LazyLock, Mutex, PoisonError};

static GLOBAL: LazyLock<Arc<KeyedLocks>> = LazyLock::new(KeyedLocks::new);

/// The registry shared by every cache store and reconciler in the process.
pub fn global() -> Arc<KeyedLocks> {
    Arc::clone(&GLOBAL)
}

/// A stable key for `path`, whether or not it exists yet.
///
/// The deepest existing ancestor is canonicalized and the missing tail
/// appended, so `./public/../public/icons` and a symlinked spelling of the
/// same directory map to one key before and after it is created.
pub fn path_key(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut existing = absolute.as_path();
    let mut tail = Vec::new();
    let base = loop {
        if let Ok(canonical) = existing.canonicalize() {
            break canonical;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => break existing.to_path_buf(),
        }
    };
    let key: PathBuf = tail.iter().rev().fold(base, |acc, part| acc.join(part));
    key.to_string_lossy().into_owned()
}

#[derive(Debug, Default)]
pub struct KeyedLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl KeyedLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until `key` is free, then hold it until the guard drops.
    pub fn acquire(self: &Arc<Self>, key: &str) -> KeyGuard {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(key) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(key.to_string());
        KeyGuard {
            locks: Arc::clone(self),
            key: key.to_string(),
        }
    }

    /// Take `key` only if nobody holds it.
    #[cfg(test)]
    pub fn try_acquire(self: &Arc<Self>, key: &str) -> Option<KeyGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(key.to_string()) {
            return None;
        }
        Some(KeyGuard {
            locks: Arc::clone(self),
            key: key.to_string(),
        })
    }

    #[cfg(test)]
    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct KeyGuard {
    locks: Arc<KeyedLocks>,
    key: String,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut held = self
            .locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
        self.locks.released.notify_all();
    }
}
