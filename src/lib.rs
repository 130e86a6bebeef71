//! # rfgen
//!
//! Cached favicon bundle generation backed by the
//! [RealFaviconGenerator](https://realfavicongenerator.net) service, wired into
//! a project's build output. Point it at a source image and a generation
//! config; it produces the icon files, keeps a destination directory in sync
//! with them, and injects the returned markup into your HTML.
//!
//! # Architecture: One Pipeline, Re-entered on Change
//!
//! ```text
//! ConfigResolver   rfg.json / rfg.toml / inline  →  canonical request
//! CacheStore       sha256(request)               →  hit: descriptor + files
//!                                                    miss: service call, staged + committed
//! Reconciler       cache entry files             →  dest/ (exact mirror)
//! Injector         descriptor markup             →  HTML files, manifests
//! WatchSession     source image events           →  re-run / clean
//! ```
//!
//! Every run resolves configuration from scratch, so edits to the config
//! files or the source image are picked up without restarting a watcher.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`generator`] | The pipeline: resolve, fingerprint, fetch or reuse, reconcile, patch |
//! | [`config`] | Tool options (`rfgen.toml`), generation config discovery, layering, request shaping |
//! | [`cache`] | Fingerprint-addressed response cache with atomic staged commits |
//! | [`remote`] | The generation service contract and its HTTP client |
//! | [`reconcile`] | Destination directory mirroring with staged swaps |
//! | [`inject`] | Marker-region replacement and `<head>` merge for HTML files |
//! | [`tokens`] | Deferred icons-path token substitution |
//! | [`source`] | Source image resolution: URL, path, glob, default discovery |
//! | [`watch`] | Watch state machine, notify backend, debounced session loop |
//! | [`progress`] | Monotonic progress tracking and observers |
//! | [`locks`] | Process-wide keyed mutual exclusion for shared directories |
//! | [`types`] | Shared types (`Asset`, `FileKind`) |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## The Cache Key Is the Request
//!
//! The fingerprint is the SHA-256 of the canonical service request, master
//! picture included. Two runs that would send byte-identical requests share
//! a cache entry; anything that changes the request (design, settings, the
//! source image bytes, the API key) gets a new one. There is no separate
//! invalidation step.
//!
//! ## Nothing Half-Written
//!
//! Cache entries are built in a staging directory and renamed into place;
//! a failed service call drops the staging directory and leaves the previous
//! entry untouched. The destination directory follows the same pattern, so a
//! reader of `dest/` never sees a mix of two bundles.
//!
//! ## Deferred Icon Paths
//!
//! When the icons path depends on which file references it, the request
//! carries a sentinel token instead of a path. The cache stores the tokens
//! unresolved and they are substituted per file after every run, so one
//! cache entry serves every consumer.

pub mod cache;
pub mod config;
pub mod generator;
pub mod inject;
pub mod locks;
pub mod output;
pub mod progress;
pub mod reconcile;
pub mod remote;
pub mod source;
pub mod tokens;
pub mod types;
pub mod watch;

#[cfg(test)]
pub(crate) mod test_helpers;
