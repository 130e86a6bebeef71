//! Configuration: tool options and the generation request.
//!
//! Two layers live here.
//!
//! ## Tool options (`rfgen.toml`)
//!
//! [`Options`] controls *how* the tool runs: where the bundle goes, which
//! HTML files get patched, caching, watching. Every key is optional and
//! unknown keys are rejected to catch typos early:
//!
//! ```toml
//! dest = "public/favicons"
//! html_files = ["public/index.html"]
//! cache = 86400            # true, false, or TTL in seconds
//!
//! [config.design.desktopBrowser]
//! ```
//!
//! ## Generation configuration
//!
//! The `config` table (plus any discovered `rfg.json` / `rfg.toml` /
//! `.rfgrc` files) describes *what* to generate. [`ConfigResolver`] merges
//! the layers, later wins, at the top level:
//!
//! ```text
//! built-in defaults  →  discovered files (in discovery order)
//!                    →  inline `config` table
//!                    →  masterPicture derived from the source image
//! ```
//!
//! and shapes the result into the request the service expects
//! ([`Configuration`]). Keys are camelCase in user files and snake_case on
//! the wire; `design`, `settings` and `versioning` are converted recursively.
//!
//! Programmatic callers can add layers computed at resolve time through
//! [`ConfigSource::Factory`] instead of files.

use crate::tokens::ICONS_PATH_TOKEN;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable consulted when no `apiKey` is configured.
pub const API_KEY_ENV: &str = "RFG_API_KEY";

/// Options file looked up in the working directory by default.
pub const DEFAULT_OPTIONS_FILE: &str = "rfgen.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("{}", missing_api_key_help())]
    MissingApiKey,
    #[error(
        "one or more \"design\" sections must be provided, e.g. `[config.design.desktopBrowser]`. \
         See https://realfavicongenerator.net/api/non_interactive_api#favicon_design"
    )]
    EmptyDesign,
    #[error("{path} must contain a table/object at the top level")]
    NotAMapping { path: String },
    #[error("configuration source {origin} failed: {message}")]
    Factory { origin: String, message: String },
    #[error("Options validation error: {0}")]
    InvalidOptions(String),
}

fn missing_api_key_help() -> String {
    [
        "An \"apiKey\" is required. Request one at https://realfavicongenerator.net/api",
        "Once you have received it, set it in one of the following ways:",
        "",
        "Environment variable:",
        "",
        &format!("\t{API_KEY_ENV}='REPLACE WITH API KEY'"),
        "",
        "JSON configuration file (rfg.json):",
        "",
        "\t{ \"apiKey\": \"REPLACE WITH API KEY\" }",
        "",
        "TOML configuration file (rfg.toml):",
        "",
        "\tapiKey = \"REPLACE WITH API KEY\"",
        "",
        &format!("Inline in {DEFAULT_OPTIONS_FILE}:"),
        "",
        "\t[config]",
        "\tapiKey = \"REPLACE WITH API KEY\"",
    ]
    .join("\n")
}

// =============================================================================
// Tool options
// =============================================================================

/// How long a cached service response stays valid.
///
/// In option files this is `true` (never expires), `false` (always call the
/// service) or a number of seconds. [`CachePolicy::Custom`] is only
/// available programmatically.
#[derive(Clone, Default)]
pub enum CachePolicy {
    /// Every run calls the service.
    Disabled,
    /// Cached responses never expire.
    #[default]
    Forever,
    /// Expire after this many seconds since the entry was written.
    Ttl(u64),
    /// Caller decides; `true` means expired.
    Custom(std::sync::Arc<dyn Fn(&crate::cache::EntryStats) -> bool + Send + Sync>),
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CachePolicy::Disabled => f.write_str("Disabled"),
            CachePolicy::Forever => f.write_str("Forever"),
            CachePolicy::Ttl(secs) => f.debug_tuple("Ttl").field(secs).finish(),
            CachePolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CacheSetting {
    Enabled(bool),
    Seconds(u64),
}

impl CachePolicy {
    /// Expire after `secs`. Zero seconds disables the cache.
    pub fn ttl(secs: u64) -> Self {
        if secs == 0 {
            CachePolicy::Disabled
        } else {
            CachePolicy::Ttl(secs)
        }
    }
}

impl From<CacheSetting> for CachePolicy {
    fn from(setting: CacheSetting) -> Self {
        match setting {
            CacheSetting::Enabled(true) => CachePolicy::Forever,
            CacheSetting::Enabled(false) => CachePolicy::Disabled,
            CacheSetting::Seconds(secs) => CachePolicy::ttl(secs),
        }
    }
}

impl<'de> Deserialize<'de> for CachePolicy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        CacheSetting::deserialize(deserializer).map(Into::into)
    }
}

/// Watch-mode settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchOptions {
    /// Allow `rfgen watch`. When false the command runs once and exits.
    pub enabled: bool,
    /// Poll the source instead of using native notifications.
    pub poll: bool,
    /// Poll interval in milliseconds (only with `poll = true`).
    pub poll_interval_ms: u64,
    /// Quiet period before a burst of events triggers a run.
    pub debounce_ms: u64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            poll: false,
            poll_interval_ms: 1000,
            debounce_ms: 100,
        }
    }
}

/// Tool options loaded from `rfgen.toml` and CLI flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Cache policy for service responses.
    pub cache: CachePolicy,
    /// Cache root. Defaults to the user cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Inline generation configuration; overrides discovered files.
    pub config: Map<String, Value>,
    /// Glob patterns (relative to the project root) for config discovery.
    pub config_files: Vec<String>,
    /// Echo request/response on service failures; verbose logging.
    pub debug: bool,
    /// Destination directory for the generated bundle.
    pub dest: PathBuf,
    /// Selectors for elements the head merge must never remove.
    pub keep: Vec<String>,
    /// HTML files (paths or glob patterns) to patch with the markup.
    pub html_files: Vec<String>,
    /// Base-name patterns of manifest files in the destination.
    pub manifest_files: Vec<String>,
    /// Source image path, URL, or glob pattern. Discovered when absent.
    pub src: Option<String>,
    /// Directory the source is resolved against. Defaults to the project root.
    pub src_cwd: Option<PathBuf>,
    pub watch: WatchOptions,
    /// Service request timeout.
    pub timeout_secs: u64,
    /// Extra attempts after a transient service failure.
    pub retries: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache: CachePolicy::Forever,
            cache_dir: None,
            config: Map::new(),
            config_files: default_config_files(),
            debug: false,
            dest: PathBuf::from("favicons"),
            keep: Vec::new(),
            html_files: Vec::new(),
            manifest_files: default_manifest_files(),
            src: None,
            src_cwd: None,
            watch: WatchOptions::default(),
            timeout_secs: 60,
            retries: 2,
        }
    }
}

fn default_config_files() -> Vec<String> {
    [
        "rfg.json",
        "rfg.toml",
        "rfg.config.json",
        "rfg.config.toml",
        ".rfgrc",
        ".rfgrc.json",
        ".rfgrc.toml",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_manifest_files() -> Vec<String> {
    [
        "manifest.json",
        "*.webmanifest",
        "browserconfig.xml",
        "ieconfig.xml",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Options {
    /// Load options from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let options: Options = toml::from_str(&content)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dest.as_os_str().is_empty() {
            return Err(ConfigError::InvalidOptions("dest must not be empty".into()));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidOptions(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        for pattern in self.config_files.iter().chain(&self.manifest_files) {
            if let Err(err) = glob::Pattern::new(pattern) {
                return Err(ConfigError::InvalidOptions(format!(
                    "invalid pattern {pattern:?}: {err}"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Generation configuration
// =============================================================================

/// Factory producing a configuration layer at resolve time.
pub type ConfigFactory = Box<dyn Fn() -> Result<Value, String> + Send + Sync>;

/// One layer of generation configuration.
pub enum ConfigSource {
    Mapping { origin: String, value: Value },
    Factory { origin: String, factory: ConfigFactory },
}

impl fmt::Debug for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Mapping { origin, .. } => write!(f, "Mapping({origin})"),
            ConfigSource::Factory { origin, .. } => write!(f, "Factory({origin})"),
        }
    }
}

impl ConfigSource {
    pub fn origin(&self) -> &str {
        match self {
            ConfigSource::Mapping { origin, .. } | ConfigSource::Factory { origin, .. } => origin,
        }
    }

    fn evaluate(&self) -> Result<Map<String, Value>, ConfigError> {
        let value = match self {
            ConfigSource::Mapping { value, .. } => value.clone(),
            ConfigSource::Factory { origin, factory } => {
                factory().map_err(|message| ConfigError::Factory {
                    origin: origin.clone(),
                    message,
                })?
            }
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(ConfigError::NotAMapping {
                path: self.origin().to_string(),
            }),
        }
    }
}

/// Glob `patterns` in `root`, in pattern order, each pattern's matches sorted.
pub fn discover_config_files(root: &Path, patterns: &[String]) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = Vec::new();
    let Some(root) = root.to_str() else {
        return found;
    };
    let root = PathBuf::from(glob::Pattern::escape(root));
    for pattern in patterns {
        let full = root.join(pattern);
        let Some(full) = full.to_str() else {
            continue;
        };
        let mut matches: Vec<PathBuf> = match glob::glob(full) {
            Ok(paths) => paths.filter_map(Result::ok).filter(|p| p.is_file()).collect(),
            Err(err) => {
                tracing::warn!("invalid config pattern {pattern:?}: {err}");
                continue;
            }
        };
        matches.sort();
        for path in matches {
            if !found.contains(&path) {
                found.push(path);
            }
        }
    }
    found
}

/// Read a configuration file as JSON or TOML.
///
/// `.toml` files are TOML, `.json` files JSON; anything else (e.g. `.rfgrc`)
/// is tried as JSON first, then TOML.
pub fn load_config_file(path: &Path) -> Result<Value, ConfigError> {
    let content = fs::read_to_string(path)?;
    let value = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str::<Value>(&content)?,
        Some("json") => serde_json::from_str(&content)?,
        _ => match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(_) => toml::from_str::<Value>(&content)?,
        },
    };
    if !value.is_object() {
        return Err(ConfigError::NotAMapping {
            path: path.display().to_string(),
        });
    }
    Ok(value)
}

/// Shallow merge: keys of `overlay` replace keys of `base`.
pub fn merge_layer(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        base.insert(key, value);
    }
}

/// `desktopBrowser` → `desktop_browser`.
pub fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Recursively convert object keys to snake_case. Values are untouched.
pub fn snake_case_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (snake_case(k), snake_case_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(snake_case_keys).collect()),
        other => other.clone(),
    }
}

/// Keep the first and last 10% of `secret`, mask the rest.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    let keep = chars.len().div_ceil(10);
    if chars.len() <= keep * 2 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..keep].iter().collect();
    let tail: String = chars[chars.len() - keep..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - keep * 2))
}

/// A validated, canonical generation request.
///
/// Serializes with sorted keys (`serde_json::Map` is ordered), which is what
/// [`crate::cache::fingerprint`] hashes.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    request: Value,
}

impl Configuration {
    /// The request body for the service (without the outer envelope).
    pub fn request(&self) -> &Value {
        &self.request
    }

    pub fn api_key(&self) -> &str {
        self.request["api_key"].as_str().unwrap_or_default()
    }

    /// Whether icon paths are deferred to a resolver callback.
    pub fn has_deferred_icons_path(&self) -> bool {
        self.request["files_location"]["path"].as_str() == Some(ICONS_PATH_TOKEN)
    }

    /// Canonical serialization (sorted keys, no whitespace).
    pub fn canonical_json(&self) -> String {
        self.request.to_string()
    }
}

/// Merges configuration layers into a [`Configuration`].
#[derive(Debug)]
pub struct ConfigResolver {
    defaults: Map<String, Value>,
    /// Files found by [`discover`](Self::discover); replaced on every call.
    discovered: Vec<ConfigSource>,
    /// Layers added programmatically; merged after discovered files.
    sources: Vec<ConfigSource>,
    inline: Map<String, Value>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        let mut defaults = Map::new();
        defaults.insert("design".into(), Value::Object(Map::new()));
        Self {
            defaults,
            discovered: Vec::new(),
            sources: Vec::new(),
            inline: Map::new(),
        }
    }
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every file matching `patterns` under `root`, replacing the
    /// results of any earlier discovery.
    ///
    /// Unreadable or malformed files are skipped with a warning; discovery
    /// continues with the rest.
    pub fn discover(&mut self, root: &Path, patterns: &[String]) -> Vec<PathBuf> {
        self.discovered.clear();
        let mut loaded = Vec::new();
        for path in discover_config_files(root, patterns) {
            match load_config_file(&path) {
                Ok(value) => {
                    tracing::debug!("loaded configuration {}", path.display());
                    self.discovered.push(ConfigSource::Mapping {
                        origin: path.display().to_string(),
                        value,
                    });
                    loaded.push(path);
                }
                Err(err) => {
                    tracing::warn!(
                        "skipping configuration file {}: {err}",
                        path.display()
                    );
                }
            }
        }
        loaded
    }

    pub fn add_source(&mut self, source: ConfigSource) {
        self.sources.push(source);
    }

    pub fn with_source(mut self, source: ConfigSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_inline(mut self, inline: Map<String, Value>) -> Self {
        self.inline = inline;
        self
    }

    /// All layers in merge order (inline table excluded).
    pub fn sources(&self) -> impl Iterator<Item = &ConfigSource> {
        self.discovered.iter().chain(&self.sources)
    }

    /// Merge all layers, reading the API key fallback from the environment.
    pub fn resolve(
        &self,
        master_picture: Value,
        deferred_icons_path: bool,
    ) -> Result<Configuration, ConfigError> {
        self.resolve_with_env(master_picture, deferred_icons_path, |name| {
            std::env::var(name).ok()
        })
    }

    /// [`resolve`](Self::resolve) with an explicit environment lookup.
    pub fn resolve_with_env(
        &self,
        master_picture: Value,
        deferred_icons_path: bool,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Configuration, ConfigError> {
        let mut merged = self.defaults.clone();
        for source in self.sources() {
            match source.evaluate() {
                Ok(layer) => merge_layer(&mut merged, layer),
                Err(err @ ConfigError::Factory { .. }) => return Err(err),
                Err(err) => {
                    tracing::warn!("skipping configuration {}: {err}", source.origin());
                }
            }
        }
        merge_layer(&mut merged, self.inline.clone());
        merged.insert("masterPicture".into(), master_picture);

        let api_key = match merged.get("apiKey").and_then(Value::as_str) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => env(API_KEY_ENV)
                .filter(|key| !key.is_empty())
                .ok_or(ConfigError::MissingApiKey)?,
        };

        let design = merged
            .get("design")
            .and_then(Value::as_object)
            .filter(|d| !d.is_empty())
            .ok_or(ConfigError::EmptyDesign)?;

        let mut settings = match merged.get("settings") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        let icons_path = if deferred_icons_path {
            settings.insert("usePathAsIs".into(), Value::Bool(true));
            Some(Value::String(ICONS_PATH_TOKEN.into()))
        } else {
            merged.get("iconsPath").cloned()
        };

        let files_location = match icons_path {
            Some(path) => json!({ "type": "path", "path": path }),
            None => json!({ "type": "root" }),
        };

        let mut request = Map::new();
        request.insert("api_key".into(), Value::String(api_key));
        request.insert("master_picture".into(), merged["masterPicture"].clone());
        request.insert("files_location".into(), files_location);
        request.insert(
            "favicon_design".into(),
            snake_case_keys(&Value::Object(design.clone())),
        );
        request.insert(
            "settings".into(),
            snake_case_keys(&Value::Object(settings)),
        );
        if let Some(versioning) = merged.get("versioning") {
            request.insert("versioning".into(), snake_case_keys(versioning));
        }

        let config = Configuration {
            request: Value::Object(request),
        };
        tracing::debug!(
            "initialized configuration (API key: {})",
            mask_secret(config.api_key())
        );
        Ok(config)
    }
}

/// Returns a fully-commented stock `rfgen.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_options_toml() -> &'static str {
    r##"# rfgen options
# =============
# All settings are optional. Values shown below are the defaults.
# Unknown keys will cause an error.

# Destination directory for the generated favicon bundle. It is cleared and
# repopulated on every run.
dest = "favicons"

# HTML files to patch with the generated markup. Paths or glob patterns.
# Files containing a marker pair get only the region between the markers
# replaced:
#   <!-- RFG start -->
#   <!-- RFG end -->
# ({# RFG start #} and {{-- RFG start --}} also work.) Files without markers
# get the markup merged into <head>. Missing files are created.
html_files = []

# Selectors for elements the <head> merge must never remove,
# e.g. ['link[type="image/svg+xml"]'].
keep = []

# Manifest files in the destination that receive icon path substitution when
# a path callback is configured. Matched against file names.
manifest_files = ["manifest.json", "*.webmanifest", "browserconfig.xml", "ieconfig.xml"]

# Source image: a path, an http(s) URL, or a glob pattern. When omitted,
# *favicon*.{ico,png,jpeg,jpg,gif,svg} is looked up in src_cwd and in its
# img/, image/, images/, favicon/ and favicons/ sub-directories.
# src = "assets/favicon.png"
# src_cwd = "."

# Cache for service responses:
#   true  - never expires
#   false - call the service on every run
#   N     - expire N seconds after the response was cached
cache = true

# Cache root. Defaults to the user cache directory (e.g. ~/.cache/rfgen).
# cache_dir = ".rfgen-cache"

# Generation configuration files looked up in the project root.
config_files = ["rfg.json", "rfg.toml", "rfg.config.json", "rfg.config.toml", ".rfgrc", ".rfgrc.json", ".rfgrc.toml"]

# Print request/response when the service call fails.
debug = false

# Service request timeout, and extra attempts on transient failures.
timeout_secs = 60
retries = 2

# ---------------------------------------------------------------------------
# Watch mode (`rfgen watch`)
# ---------------------------------------------------------------------------
[watch]
enabled = true
poll = false
poll_interval_ms = 1000
debounce_ms = 100

# ---------------------------------------------------------------------------
# Generation configuration (overrides discovered rfg.json / rfg.toml files)
# See https://realfavicongenerator.net/api/non_interactive_api
# ---------------------------------------------------------------------------
[config]
# apiKey = "..."   # or set RFG_API_KEY

[config.design.desktopBrowser]
"##
}
