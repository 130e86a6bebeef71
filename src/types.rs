//! Shared types used across the generation pipeline.
//!
//! These flow between the cache, the reconciler, the text patchers, and the
//! result report, and are part of the public [`GenerationReport`](crate::generator::GenerationReport).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A file written (or patched) by a run, reported in the result table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Absolute path of the written file.
    pub path: PathBuf,
    /// Size in bytes at the time it was written.
    pub size: u64,
}

/// Which kind of consumer file a deferred path is being resolved for.
///
/// Passed to icons-path callbacks so they can emit different URLs for
/// HTML pages (served relative to the site root) and manifests (relative to
/// the manifest's own location).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Html,
    Manifest,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::Html => f.write_str("html"),
            FileKind::Manifest => f.write_str("manifest"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_kind_display() {
        assert_eq!(FileKind::Html.to_string(), "html");
        assert_eq!(FileKind::Manifest.to_string(), "manifest");
    }
}
