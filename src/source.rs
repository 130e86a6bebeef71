//! Source image resolution.
//!
//! The master picture is either an explicit path or `http(s)` URL, a glob
//! pattern, or, when nothing is configured, the first file matching
//! `*favicon*.{ico,png,jpeg,jpg,gif,svg}` in the source directory or one of
//! its conventional image sub-directories.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const EXTENSIONS: &[&str] = &["ico", "png", "jpeg", "jpg", "gif", "svg"];
const SUBDIRS: &[&str] = &["img", "image", "images", "favicon", "favicons"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error(
        "No favicons could be found in {cwd} (searched {}). Try explicitly specifying a file path \
         with `src` (or `--src`), or place a file named like `favicon.png` in the project root",
        patterns.join(", ")
    )]
    NotFound { cwd: PathBuf, patterns: Vec<String> },
    #[error("invalid source pattern {pattern:?}: {message}")]
    Glob { pattern: String, message: String },
    #[error("failed to read source image {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Where the master picture comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Url(String),
    File(PathBuf),
}

impl SourceRef {
    /// The `masterPicture` value for the request.
    ///
    /// Local files are sent inline as base64.
    pub fn master_picture(&self) -> Result<Value, SourceError> {
        match self {
            SourceRef::Url(url) => Ok(json!({ "type": "url", "url": url })),
            SourceRef::File(path) => {
                let bytes = fs::read(path).map_err(|source| SourceError::Read {
                    path: path.clone(),
                    source,
                })?;
                Ok(json!({ "type": "inline", "content": STANDARD.encode(bytes) }))
            }
        }
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceRef::Url(url) => f.write_str(url),
            SourceRef::File(path) => write!(f, "{}", path.display()),
        }
    }
}

pub fn is_url(src: &str) -> bool {
    let lower = src.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Patterns searched when no source is configured, in priority order.
pub fn default_patterns() -> Vec<String> {
    let mut patterns: Vec<String> = EXTENSIONS
        .iter()
        .map(|ext| format!("*favicon*.{ext}"))
        .collect();
    for dir in SUBDIRS {
        patterns.extend(EXTENSIONS.iter().map(|ext| format!("{dir}/*favicon*.{ext}")));
    }
    patterns
}

/// Resolve `src` against `cwd`.
pub fn resolve(src: Option<&str>, cwd: &Path) -> Result<SourceRef, SourceError> {
    let patterns = match src {
        Some(src) if is_url(src) => return Ok(SourceRef::Url(src.to_string())),
        Some(src) => {
            let path = cwd.join(src);
            if path.is_file() {
                return Ok(SourceRef::File(path));
            }
            vec![src.to_string()]
        }
        None => default_patterns(),
    };

    first_match(cwd, &patterns)?
        .map(SourceRef::File)
        .ok_or_else(|| SourceError::NotFound {
            cwd: cwd.to_path_buf(),
            patterns,
        })
}

fn first_match(cwd: &Path, patterns: &[String]) -> Result<Option<PathBuf>, SourceError> {
    let base = PathBuf::from(glob::Pattern::escape(&cwd.to_string_lossy()));
    for pattern in patterns {
        let full = base.join(pattern);
        let paths = glob::glob(&full.to_string_lossy()).map_err(|err| SourceError::Glob {
            pattern: pattern.clone(),
            message: err.to_string(),
        })?;
        let mut matches: Vec<PathBuf> = paths.filter_map(Result::ok).filter(|p| p.is_file()).collect();
        matches.sort();
        if let Some(first) = matches.into_iter().next() {
            tracing::debug!("using source image {}", first.display());
            return Ok(Some(first));
        }
    }
    Ok(None)
}
