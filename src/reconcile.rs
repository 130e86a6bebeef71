//! Destination directory reconciliation.
//!
//! The destination always mirrors exactly one complete cache entry. It is
//! rebuilt in a sibling staging directory and swapped into place, so an
//! interrupted copy leaves the previous bundle intact instead of half a new
//! one. The destination path is locked for the whole clear-and-copy, in the
//! process-wide registry, so reconcilers owned by different generators
//! still take turns on a shared destination.

use crate::locks::{self, KeyGuard};
use crate::progress::{ProgressTracker, step_percentage};
use crate::types::Asset;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to read {path}: {source}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[error("destination {0} exists and is not a directory")]
    NotADirectory(PathBuf),
}

/// Copies cache entries into destination directories.
#[derive(Debug, Clone, Default)]
pub struct ArtifactReconciler;

fn lock_dest(dest: &Path) -> KeyGuard {
    locks::global().acquire(&format!("dest:{}", locks::path_key(dest)))
}

fn parent_of(dest: &Path) -> &Path {
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

impl ArtifactReconciler {
    pub fn new() -> Self {
        Self
    }

    /// Replace the contents of `dest` with the files under `files_dir`.
    ///
    /// Returns one [`Asset`] per copied file, at its destination path, in
    /// sorted path order.
    pub fn apply(
        &self,
        files_dir: &Path,
        dest: &Path,
        progress: &ProgressTracker,
    ) -> Result<Vec<Asset>, ReconcileError> {
        let _guard = lock_dest(dest);
        if dest.exists() && !dest.is_dir() {
            return Err(ReconcileError::NotADirectory(dest.to_path_buf()));
        }

        let files = list_files(files_dir)?;
        let parent = parent_of(dest);
        fs::create_dir_all(parent)?;
        let staging = tempfile::Builder::new()
            .prefix(".rfgen-staging-")
            .tempdir_in(parent)?;

        let start = progress.percent();
        let mut assets = Vec::with_capacity(files.len());
        for (index, relative) in files.iter().enumerate() {
            let target = staging.path().join(relative);
            if let Some(dir) = target.parent() {
                fs::create_dir_all(dir)?;
            }
            let size = fs::copy(files_dir.join(relative), &target)?;
            assets.push(Asset {
                path: dest.join(relative),
                size,
            });
            progress.report(
                step_percentage(files.len(), index, start),
                "Copying files",
                &[relative.display().to_string()],
                false,
            );
        }

        swap_into_place(staging, dest)?;
        tracing::debug!("reconciled {} files into {}", assets.len(), dest.display());
        Ok(assets)
    }

    /// Empty `dest`, creating it if needed.
    pub fn clean(&self, dest: &Path) -> Result<(), ReconcileError> {
        let _guard = lock_dest(dest);
        match fs::remove_dir_all(dest) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(dest)?;
        tracing::debug!("cleaned {}", dest.display());
        Ok(())
    }
}

/// Relative paths of every file under `root`, sorted.
fn list_files(root: &Path) -> Result<Vec<PathBuf>, ReconcileError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|source| ReconcileError::Walk {
            path: root.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_file()
            && let Ok(relative) = entry.path().strip_prefix(root)
        {
            files.push(relative.to_path_buf());
        }
    }
    Ok(files)
}

fn swap_into_place(staging: tempfile::TempDir, dest: &Path) -> Result<(), ReconcileError> {
    let evicted = tempfile::Builder::new()
        .prefix(".rfgen-old-")
        .tempdir_in(parent_of(dest))?;
    if dest.exists() {
        fs::rename(dest, evicted.path().join("old"))?;
    }
    let staged = staging.keep();
    if let Err(err) = fs::rename(&staged, dest) {
        let old = evicted.path().join("old");
        if old.exists() {
            let _ = fs::rename(&old, dest);
        }
        let _ = fs::remove_dir_all(&staged);
        return Err(err.into());
    }
    Ok(())
}
