//! The generation pipeline.
//!
//! [`FaviconGenerator`] owns everything one project needs across runs:
//! options, the configuration resolver, the service client, the cache, the
//! destination reconciler and the progress tracker. A run goes:
//!
//! ```text
//! resolve source + configuration ──▶ fingerprint            20%
//!   ├─ cache hit (not expired) ───┐
//!   └─ stage → service → preview → commit                   50%
//! reconcile destination ◀─────────┘                         70%
//! resolve deferred paths in manifests                       80%
//! inject markup into HTML files                             90%
//! done                                                     100%
//! ```
//!
//! Configuration, source and fingerprint are resolved lazily and kept for
//! the rest of the run; every run starts from scratch so edits to config
//! files or the source image are picked up in watch mode.
//!
//! The fingerprint lock is held from cache lookup through reconciliation,
//! so a destination is never filled while its cache entry is rewritten.
//! Locks are process-wide: generators for different projects that share a
//! cache root or a destination take turns.

use crate::cache::{self, CacheEntry, CacheError, CacheStore};
use crate::config::{ConfigError, ConfigResolver, ConfigSource, Configuration, Options};
use crate::inject::{self, InjectOptions};
use crate::locks;
use crate::progress::{ProgressObserver, ProgressTracker, STEP, step_percentage};
use crate::reconcile::{ArtifactReconciler, ReconcileError};
use crate::remote::{self, Descriptor, GenerationClient, RemoteError, RfgClient};
use crate::source::{self, SourceError, SourceRef};
use crate::tokens::{self, PathResolver};
use crate::types::{Asset, FileKind};
use crate::watch::{WatchError, WatchTarget};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A consumer file that could not be patched. The run continued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub fingerprint: String,
    pub cache_hit: bool,
    pub source: SourceRef,
    pub dest: PathBuf,
    pub descriptor: Descriptor,
    pub assets: Vec<Asset>,
    pub preview: Option<PathBuf>,
    /// HTML files whose content changed.
    pub html_files: Vec<PathBuf>,
    /// Manifests whose deferred paths were resolved.
    pub manifests: Vec<PathBuf>,
    pub failures: Vec<FileFailure>,
}

#[derive(Debug, Clone)]
struct Resolved {
    source: SourceRef,
    config: Configuration,
    fingerprint: String,
}

pub struct FaviconGenerator {
    options: Options,
    root: PathBuf,
    resolver: ConfigResolver,
    client: Box<dyn GenerationClient>,
    cache: CacheStore,
    reconciler: ArtifactReconciler,
    progress: ProgressTracker,
    icons_path: Option<Box<dyn PathResolver + Send>>,
    resolved: Option<Resolved>,
}

impl std::fmt::Debug for FaviconGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaviconGenerator")
            .field("root", &self.root)
            .field("dest", &self.options.dest)
            .field("cache", &self.cache.root())
            .finish_non_exhaustive()
    }
}

impl FaviconGenerator {
    /// A generator for the project at `root`, talking to the real service.
    ///
    /// A relative `cache_dir` is resolved against `root`.
    pub fn new(options: Options, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let client = RfgClient::new(
            Duration::from_secs(options.timeout_secs),
            options.retries,
        )
        .with_debug(options.debug);
        let cache = CacheStore::new(match &options.cache_dir {
            Some(dir) => root.join(dir),
            None => CacheStore::default_root(),
        });
        let resolver = ConfigResolver::new().with_inline(options.config.clone());
        Self {
            options,
            root,
            resolver,
            client: Box::new(client),
            cache,
            reconciler: ArtifactReconciler::new(),
            progress: ProgressTracker::new(),
            icons_path: None,
            resolved: None,
        }
    }

    pub fn with_client(mut self, client: impl GenerationClient + 'static) -> Self {
        self.client = Box::new(client);
        self
    }

    pub fn with_cache(mut self, cache: CacheStore) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_observer(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.progress.add_observer(observer);
        self
    }

    /// Add a configuration layer merged after discovered files.
    pub fn with_config_source(mut self, source: ConfigSource) -> Self {
        self.resolver.add_source(source);
        self
    }

    /// Compute icon paths per reference instead of sending a fixed path.
    pub fn with_icons_path(mut self, resolver: impl PathResolver + Send + 'static) -> Self {
        self.icons_path = Some(Box::new(resolver));
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// The destination directory, resolved against the project root.
    pub fn dest(&self) -> PathBuf {
        self.root.join(&self.options.dest)
    }

    fn src_cwd(&self) -> PathBuf {
        match &self.options.src_cwd {
            Some(dir) => self.root.join(dir),
            None => self.root.clone(),
        }
    }

    fn resolve(&mut self) -> Result<Resolved, GenerateError> {
        if let Some(resolved) = &self.resolved {
            return Ok(resolved.clone());
        }
        let source = source::resolve(self.options.src.as_deref(), &self.src_cwd())?;
        let master_picture = source.master_picture()?;
        self.resolver.discover(&self.root, &self.options.config_files);
        let config = self
            .resolver
            .resolve(master_picture, self.icons_path.is_some())?;
        let fingerprint = cache::fingerprint(&config);
        tracing::debug!("configuration fingerprint {fingerprint}");

        let resolved = Resolved {
            source,
            config,
            fingerprint,
        };
        self.resolved = Some(resolved.clone());
        Ok(resolved)
    }

    /// The resolved source image.
    pub fn source(&mut self) -> Result<SourceRef, GenerateError> {
        Ok(self.resolve()?.source)
    }

    /// The fingerprint of the current configuration.
    pub fn fingerprint(&mut self) -> Result<String, GenerateError> {
        Ok(self.resolve()?.fingerprint)
    }

    /// The local source file to watch.
    pub fn watch_path(&mut self) -> Result<PathBuf, GenerateError> {
        match self.source()? {
            SourceRef::File(path) => Ok(path),
            SourceRef::Url(url) => Err(WatchError::NotAFile(url).into()),
        }
    }

    /// One full run.
    pub fn run(&mut self) -> Result<GenerationReport, GenerateError> {
        self.progress.reset();
        self.resolved = None;
        self.progress.emit("Resolving configuration", &[]);

        let resolved = self.resolve()?;
        self.progress.raise_floor(20.0);
        self.progress
            .emit("Configuration resolved", &[resolved.source.to_string()]);

        let _guard = self.cache.lock(&resolved.fingerprint);
        let (entry, cache_hit) = match self.cache.lookup(&resolved.fingerprint)? {
            Some(entry) if !cache::is_expired(&entry, &self.options.cache) => (entry, true),
            stale => {
                if stale.is_some() {
                    tracing::debug!("cache entry {} expired", resolved.fingerprint);
                }
                (self.refresh(&resolved)?, false)
            }
        };
        self.progress.raise_floor(50.0);
        self.progress.emit(
            if cache_hit {
                "Using cached favicons"
            } else {
                "Favicons generated"
            },
            &[],
        );

        let dest = self.dest();
        let assets = self
            .reconciler
            .apply(&entry.files_dir(), &dest, &self.progress)?;
        self.progress.raise_floor(70.0);
        self.progress
            .emit("Files copied", &[dest.display().to_string()]);

        let mut failures = Vec::new();
        let manifests = self.rewrite_manifests(&dest, &mut failures);
        self.progress.raise_floor(80.0);
        self.progress.emit("Manifests updated", &[]);

        let html_files = self.inject_html(&entry.descriptor, &mut failures);
        self.progress.raise_floor(90.0);
        self.progress.emit("HTML updated", &[]);

        self.progress.raise_floor(100.0);
        self.progress.report(100.0, "Done", &[], true);

        Ok(GenerationReport {
            fingerprint: resolved.fingerprint,
            cache_hit,
            source: resolved.source,
            dest,
            preview: entry.preview_file(),
            descriptor: entry.descriptor,
            assets,
            html_files,
            manifests,
            failures,
        })
    }

    /// Call the service and replace the cache entry. Nothing is persisted
    /// when the call fails.
    fn refresh(&mut self, resolved: &Resolved) -> Result<CacheEntry, GenerateError> {
        self.progress
            .advance(STEP, "Requesting favicons", &[self.options.dest.display().to_string()]);
        let staged = self.cache.stage(&resolved.fingerprint)?;
        let descriptor = self
            .client
            .generate(&resolved.config, &staged.files_dir())?;

        if let Some(url) = &descriptor.preview_picture_url {
            self.progress.advance(STEP, "Downloading preview", &[]);
            let path = remote::preview_path(&staged.preview_dir(), url);
            if let Err(err) = self.client.download_preview(url, &path) {
                let _ = fs::remove_file(&path);
                tracing::warn!("failed to download preview picture: {err}");
            }
        }

        Ok(self.cache.commit(staged, &descriptor)?)
    }

    /// Files in `dest` whose names match the manifest patterns.
    fn manifest_files(&self, dest: &Path) -> Vec<PathBuf> {
        let patterns: Vec<glob::Pattern> = self
            .options
            .manifest_files
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();
        WalkDir::new(dest)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                let name = e.file_name().to_string_lossy();
                patterns.iter().any(|p| p.matches(&name))
            })
            .map(|e| e.into_path())
            .collect()
    }

    fn rewrite_manifests(&self, dest: &Path, failures: &mut Vec<FileFailure>) -> Vec<PathBuf> {
        let Some(resolver) = &self.icons_path else {
            return Vec::new();
        };
        let files = self.manifest_files(dest);
        let start = self.progress.percent();
        let mut rewritten = Vec::new();
        for (index, path) in files.iter().enumerate() {
            let result = fs::read_to_string(path).and_then(|content| {
                if !tokens::has_tokens(&content) {
                    return Ok(false);
                }
                let updated = tokens::rewrite(&content, resolver.as_ref(), path, FileKind::Manifest);
                fs::write(path, updated).map(|()| true)
            });
            match result {
                Ok(true) => rewritten.push(path.clone()),
                Ok(false) => {}
                Err(err) => {
                    tracing::error!("failed to update {}: {err}", path.display());
                    failures.push(FileFailure {
                        path: path.clone(),
                        message: err.to_string(),
                    });
                }
            }
            self.progress.report(
                step_percentage(files.len(), index, start),
                "Updating manifests",
                &[path.display().to_string()],
                false,
            );
        }
        rewritten
    }

    /// Configured HTML files; glob entries are expanded in sorted order.
    pub fn html_targets(&self) -> Vec<PathBuf> {
        let mut targets = Vec::new();
        for entry in &self.options.html_files {
            if entry.contains(['*', '?', '[']) {
                let pattern =
                    PathBuf::from(glob::Pattern::escape(&self.root.to_string_lossy())).join(entry);
                let mut matches: Vec<PathBuf> = match glob::glob(&pattern.to_string_lossy()) {
                    Ok(paths) => paths.filter_map(Result::ok).collect(),
                    Err(err) => {
                        tracing::warn!("invalid HTML pattern {entry:?}: {err}");
                        continue;
                    }
                };
                matches.sort();
                targets.extend(matches);
            } else {
                targets.push(self.root.join(entry));
            }
        }
        let mut seen = HashSet::new();
        targets.retain(|path| seen.insert(locks::path_key(path)));
        targets
    }

    fn inject_html(&self, descriptor: &Descriptor, failures: &mut Vec<FileFailure>) -> Vec<PathBuf> {
        let targets = self.html_targets();
        let options = InjectOptions {
            keep: self.options.keep.clone(),
            remove: descriptor.overlapping_markups.clone(),
        };
        let start = self.progress.percent();
        let mut changed = Vec::new();

        for (index, path) in targets.iter().enumerate() {
            match self.inject_file(path, &descriptor.html_code, &options) {
                Ok(true) => changed.push(path.clone()),
                Ok(false) => {}
                Err(message) => {
                    tracing::error!("failed to inject markup into {}: {message}", path.display());
                    failures.push(FileFailure {
                        path: path.clone(),
                        message,
                    });
                }
            }
            self.progress.report(
                step_percentage(targets.len(), index, start),
                "Injecting markup",
                &[path.display().to_string()],
                false,
            );
        }
        changed
    }

    /// Patch one HTML file. Returns whether its content changed.
    fn inject_file(
        &self,
        path: &Path,
        html_code: &str,
        options: &InjectOptions,
    ) -> Result<bool, String> {
        let _guard = locks::global().acquire(&format!("file:{}", locks::path_key(path)));
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
            fs::write(path, "").map_err(|e| e.to_string())?;
        }
        let content = fs::read_to_string(path).map_err(|e| e.to_string())?;

        let snippet = match &self.icons_path {
            Some(resolver) => tokens::rewrite(html_code, resolver.as_ref(), path, FileKind::Html),
            None => html_code.to_string(),
        };
        let updated = inject::inject(&content, &snippet, options).map_err(|e| e.to_string())?;
        if updated == content {
            return Ok(false);
        }
        fs::write(path, updated).map_err(|e| e.to_string())?;
        Ok(true)
    }

    /// Empty the destination directory.
    pub fn clean(&mut self) -> Result<(), GenerateError> {
        let dest = self.dest();
        self.reconciler.clean(&dest)?;
        self.progress.raise_floor(100.0);
        self.progress
            .report(100.0, "Cleaned", &[dest.display().to_string()], true);
        Ok(())
    }

    /// Drop the cached response for the current configuration, so the next
    /// run calls the service. Returns the evicted fingerprint.
    pub fn evict_cached(&mut self) -> Result<String, GenerateError> {
        self.resolved = None;
        let fingerprint = self.fingerprint()?;
        let _guard = self.cache.lock(&fingerprint);
        self.cache.evict(&fingerprint)?;
        tracing::debug!("evicted cache entry {fingerprint}");
        Ok(fingerprint)
    }
}

impl WatchTarget for FaviconGenerator {
    type Error = GenerateError;

    fn regenerate(&mut self) -> Result<(), GenerateError> {
        let report = self.run()?;
        tracing::info!(
            "regenerated {} files into {}{}",
            report.assets.len(),
            report.dest.display(),
            if report.cache_hit { " (cached)" } else { "" }
        );
        Ok(())
    }

    fn clean(&mut self) -> Result<(), GenerateError> {
        FaviconGenerator::clean(self)
    }
}
