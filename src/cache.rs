//! Fingerprint-addressed cache of service responses.
//!
//! Calling the generation service is slow and metered, and most rebuilds
//! send exactly the same request. Responses are cached under the SHA-256 of
//! the canonical request so unchanged configurations never hit the network.
//!
//! ## Cache keys
//!
//! The key is a **fingerprint** of the shaped request ([`fingerprint`]).
//! `serde_json::Map` keeps keys sorted, so two configurations that differ
//! only in key order hash identically. The source image is part of the
//! request (inline base64 or URL), so editing it changes the key too.
//!
//! ## Storage
//!
//! ```text
//! <root>/                       e.g. ~/.cache/rfgen
//! └── <fingerprint>/
//!     ├── response.json         descriptor (markup, overlapping tags, files)
//!     ├── files/                generated bundle, mirrors the destination
//!     └── preview/<name>        preview picture, when one was downloaded
//! ```
//!
//! `response.json`'s modification time is the entry's last write time,
//! which TTL expiry is measured against.
//!
//! ## Writes
//!
//! Entries are never written in place. A writer [`stage`](CacheStore::stage)s
//! a temporary directory next to the entries, fills it, and
//! [`commit`](CacheStore::commit)s it with two renames: the old entry moves
//! into an eviction directory, the staged one takes its name. Readers see
//! the old complete entry or the new complete one, never a mix. A staged
//! entry dropped without commit (failed service call) is deleted and leaves
//! the previous entry untouched.
//!
//! Writers for the same fingerprint are serialized through
//! [`CacheStore::lock`]. The lock lives in the process-wide registry and is
//! keyed by the entry's path, so two stores opened on the same root exclude
//! each other.

use crate::config::{CachePolicy, Configuration};
use crate::locks::{self, KeyGuard};
use crate::remote::Descriptor;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use thiserror::Error;

const DESCRIPTOR_FILENAME: &str = "response.json";
const FILES_DIR: &str = "files";
const PREVIEW_DIR: &str = "preview";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache IO error: {0}")]
    Io(#[from] io::Error),
    #[error("cache descriptor error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to move cache entry into place at {path}: {source}")]
    Persist { path: PathBuf, source: io::Error },
}

/// SHA-256 hex digest of the canonical request.
pub fn fingerprint(config: &Configuration) -> String {
    hash_str(&config.canonical_json())
}

/// SHA-256 hex digest of an arbitrary JSON value's canonical form.
pub fn fingerprint_value(value: &serde_json::Value) -> String {
    hash_str(&value.to_string())
}

fn hash_str(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// What an expiry predicate gets to look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStats {
    pub fingerprint: String,
    pub last_write: SystemTime,
    /// Time since `last_write`; zero if the clock went backwards.
    pub age: Duration,
}

/// A complete entry on disk.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub dir: PathBuf,
    pub descriptor: Descriptor,
    pub last_write: SystemTime,
}

impl CacheEntry {
    pub fn files_dir(&self) -> PathBuf {
        self.dir.join(FILES_DIR)
    }

    /// The preview picture, if one was stored with the entry.
    pub fn preview_file(&self) -> Option<PathBuf> {
        let dir = self.dir.join(PREVIEW_DIR);
        let first = fs::read_dir(dir).ok()?.filter_map(Result::ok).next()?;
        Some(first.path())
    }

    pub fn stats(&self) -> EntryStats {
        EntryStats {
            fingerprint: self.fingerprint.clone(),
            last_write: self.last_write,
            age: SystemTime::now()
                .duration_since(self.last_write)
                .unwrap_or_default(),
        }
    }
}

/// Whether `entry` must be refreshed under `policy`.
///
/// A custom predicate is authoritative. A TTL expires once the entry is
/// strictly older than the TTL.
pub fn is_expired(entry: &CacheEntry, policy: &CachePolicy) -> bool {
    match policy {
        CachePolicy::Disabled => true,
        CachePolicy::Forever => false,
        CachePolicy::Ttl(secs) => entry.stats().age > Duration::from_secs(*secs),
        CachePolicy::Custom(predicate) => predicate(&entry.stats()),
    }
}

/// An entry being written. Deleted on drop unless committed.
#[derive(Debug)]
pub struct StagedEntry {
    fingerprint: String,
    dir: TempDir,
}

impl StagedEntry {
    /// Where the generated bundle goes.
    pub fn files_dir(&self) -> PathBuf {
        self.dir.path().join(FILES_DIR)
    }

    /// Where the preview picture goes.
    pub fn preview_dir(&self) -> PathBuf {
        self.dir.path().join(PREVIEW_DIR)
    }
}

/// Cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<user cache dir>/rfgen`, or the system temp dir when there is none.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(env!("CARGO_PKG_NAME"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, fingerprint: &str) -> PathBuf {
        self.root.join(fingerprint)
    }

    /// Exclusive write access to one fingerprint.
    pub fn lock(&self, fingerprint: &str) -> KeyGuard {
        let key = format!("cache:{}", locks::path_key(&self.entry_dir(fingerprint)));
        locks::global().acquire(&key)
    }

    /// Read the entry for `fingerprint`.
    ///
    /// An unreadable descriptor is treated as absent so the next run
    /// regenerates it.
    pub fn lookup(&self, fingerprint: &str) -> Result<Option<CacheEntry>, CacheError> {
        let dir = self.entry_dir(fingerprint);
        let descriptor_path = dir.join(DESCRIPTOR_FILENAME);
        let content = match fs::read_to_string(&descriptor_path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let descriptor: Descriptor = match serde_json::from_str(&content) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                tracing::warn!(
                    "ignoring unreadable cache entry {}: {err}",
                    descriptor_path.display()
                );
                return Ok(None);
            }
        };
        let last_write = fs::metadata(&descriptor_path)?.modified()?;
        Ok(Some(CacheEntry {
            fingerprint: fingerprint.to_string(),
            dir,
            descriptor,
            last_write,
        }))
    }

    /// Start writing a fresh entry for `fingerprint`.
    pub fn stage(&self, fingerprint: &str) -> Result<StagedEntry, CacheError> {
        fs::create_dir_all(&self.root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!(".staging-{fingerprint}-"))
            .tempdir_in(&self.root)?;
        fs::create_dir_all(dir.path().join(FILES_DIR))?;
        fs::create_dir_all(dir.path().join(PREVIEW_DIR))?;
        Ok(StagedEntry {
            fingerprint: fingerprint.to_string(),
            dir,
        })
    }

    /// Write the descriptor and swap the staged entry into place.
    ///
    /// Callers hold [`lock`](Self::lock) for the fingerprint.
    pub fn commit(
        &self,
        staged: StagedEntry,
        descriptor: &Descriptor,
    ) -> Result<CacheEntry, CacheError> {
        let json = serde_json::to_string_pretty(descriptor)?;
        fs::write(staged.dir.path().join(DESCRIPTOR_FILENAME), json)?;

        let target = self.entry_dir(&staged.fingerprint);
        let evicted = tempfile::Builder::new()
            .prefix(".evict-")
            .tempdir_in(&self.root)?;
        if target.exists() {
            fs::rename(&target, evicted.path().join("old")).map_err(|source| {
                CacheError::Persist {
                    path: target.clone(),
                    source,
                }
            })?;
        }

        let staged_path = staged.dir.keep();
        if let Err(source) = fs::rename(&staged_path, &target) {
            // Put the previous entry back rather than leave nothing.
            let old = evicted.path().join("old");
            if old.exists() {
                let _ = fs::rename(&old, &target);
            }
            let _ = fs::remove_dir_all(&staged_path);
            return Err(CacheError::Persist {
                path: target,
                source,
            });
        }
        drop(evicted);

        tracing::debug!("cached response {}", staged.fingerprint);
        self.lookup(&staged.fingerprint)?
            .ok_or_else(|| CacheError::Io(io::Error::from(io::ErrorKind::NotFound)))
    }

    /// Delete the entry for `fingerprint`, if any.
    ///
    /// Callers hold [`lock`](Self::lock) for the fingerprint.
    pub fn evict(&self, fingerprint: &str) -> Result<(), CacheError> {
        match fs::remove_dir_all(self.entry_dir(fingerprint)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
