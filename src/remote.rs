//! The remote generation service.
//!
//! [`GenerationClient`] is the seam between the pipeline and the network:
//! give it a [`Configuration`] and a directory, get back a [`Descriptor`]
//! with the generated files written into that directory. [`RfgClient`] is
//! the real implementation on top of `ureq`; tests substitute an in-memory
//! client.
//!
//! ## Wire format
//!
//! ```text
//! POST https://realfavicongenerator.net/api/favicon
//! { "favicon_generation": { "api_key": …, "master_picture": …, … } }
//!
//! 200 { "favicon_generation_result": {
//!         "result": { "status": "success" },
//!         "favicon": { "files_urls": […], "html_code": "…",
//!                      "overlapping_markups": […] },
//!         "preview_picture_url": "…", "files_location": {…}, "version": "…" } }
//! ```
//!
//! Every URL in `files_urls` is fetched individually into the files
//! directory, in parallel on the rayon pool.
//!
//! ## Transient failures
//!
//! Each HTTP call has a timeout. Transport errors, 429 and 5xx responses are
//! retried up to `retries` extra times with linear backoff. Anything else
//! fails immediately.

use crate::config::{Configuration, mask_secret};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;

pub const API_URL: &str = "https://realfavicongenerator.net/api/favicon";

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },
    #[error("service responded with HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("favicon generation failed: {0}")]
    Api(String),
    #[error("unexpected service response: {0}")]
    Parse(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("{message}\n\nRequest:\n{request}\n\nResponse:\n{response}")]
    Debug {
        message: String,
        request: String,
        response: String,
    },
}

/// What the service produced, as stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Markup to inject into HTML heads.
    pub html_code: String,
    /// Selectors for markup superseded by `html_code`.
    #[serde(default)]
    pub overlapping_markups: Vec<String>,
    /// Generated file names, relative to the files directory.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub preview_picture_url: Option<String>,
    #[serde(default)]
    pub files_location: Option<Value>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Produces a favicon bundle for a configuration.
pub trait GenerationClient: Send + Sync {
    /// Run the generation and write every generated file under `files_dir`.
    fn generate(&self, config: &Configuration, files_dir: &Path)
    -> Result<Descriptor, RemoteError>;

    /// Download the preview picture to `dest`.
    fn download_preview(&self, url: &str, dest: &Path) -> Result<(), RemoteError>;
}

// =============================================================================
// Response parsing
// =============================================================================

#[derive(Deserialize)]
struct Envelope {
    favicon_generation_result: GenerationResult,
}

#[derive(Deserialize)]
struct GenerationResult {
    result: ResultStatus,
    #[serde(default)]
    favicon: Option<FaviconPayload>,
    #[serde(default)]
    preview_picture_url: Option<String>,
    #[serde(default)]
    files_location: Option<Value>,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Deserialize)]
struct ResultStatus {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct FaviconPayload {
    #[serde(default)]
    files_urls: Vec<String>,
    html_code: String,
    #[serde(default)]
    overlapping_markups: Vec<String>,
}

/// A parsed service response: the descriptor plus where to fetch each file.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResponse {
    pub descriptor: Descriptor,
    /// `(file name, url)` in service order.
    pub downloads: Vec<(String, String)>,
}

/// Parse a response body. A non-success status is an [`RemoteError::Api`].
pub fn parse_response(body: &str) -> Result<GenerationResponse, RemoteError> {
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| RemoteError::Parse(e.to_string()))?;
    let result = envelope.favicon_generation_result;

    if result.result.status != "success" {
        return Err(RemoteError::Api(
            result
                .result
                .error_message
                .unwrap_or_else(|| format!("status {:?}", result.result.status)),
        ));
    }
    let favicon = result
        .favicon
        .ok_or_else(|| RemoteError::Parse("missing \"favicon\" section".into()))?;

    let downloads = favicon
        .files_urls
        .into_iter()
        .map(|url| file_name_from_url(&url).map(|name| (name, url)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(GenerationResponse {
        descriptor: Descriptor {
            html_code: favicon.html_code,
            overlapping_markups: favicon.overlapping_markups,
            files: downloads.iter().map(|(name, _)| name.clone()).collect(),
            preview_picture_url: result.preview_picture_url,
            files_location: result.files_location,
            version: result.version,
        },
        downloads,
    })
}

/// Last path segment of `url`, without query or fragment.
pub fn file_name_from_url(url: &str) -> Result<String, RemoteError> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let name = path.rsplit('/').next().unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." || name.contains('\\') {
        return Err(RemoteError::Parse(format!("no file name in URL {url:?}")));
    }
    Ok(name.to_string())
}

/// The request with its API key masked, pretty-printed.
pub fn describe_request(config: &Configuration) -> String {
    let mut request = config.request().clone();
    if let Some(key) = request.get_mut("api_key") {
        *key = Value::String(mask_secret(config.api_key()));
    }
    serde_json::to_string_pretty(&request).unwrap_or_default()
}

// =============================================================================
// HTTP client
// =============================================================================

/// Client for the RealFaviconGenerator non-interactive API.
pub struct RfgClient {
    agent: ureq::Agent,
    endpoint: String,
    retries: u32,
    backoff: Duration,
    debug: bool,
}

impl RfgClient {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(timeout)
                .user_agent(USER_AGENT)
                .build(),
            endpoint: API_URL.to_string(),
            retries,
            backoff: Duration::from_millis(500),
            debug: false,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Attach request and response to failures.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn is_transient(err: &ureq::Error) -> bool {
        match err {
            ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
            ureq::Error::Transport(_) => true,
        }
    }

    fn with_retries<T>(
        &self,
        url: &str,
        mut call: impl FnMut() -> Result<T, ureq::Error>,
    ) -> Result<T, RemoteError> {
        let mut attempt = 0;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.retries && Self::is_transient(&err) => {
                    attempt += 1;
                    tracing::warn!(
                        "request to {url} failed ({err}), retrying ({attempt}/{})",
                        self.retries
                    );
                    thread::sleep(self.backoff * attempt);
                }
                Err(ureq::Error::Status(code, resp)) => {
                    return Err(RemoteError::Status {
                        code,
                        body: resp.into_string().unwrap_or_default(),
                    });
                }
                Err(err) => {
                    return Err(RemoteError::Http {
                        url: url.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    fn fetch_to(&self, url: &str, dest: &Path) -> Result<(), RemoteError> {
        let response = self.with_retries(url, || self.agent.get(url).call())?;
        let mut file = File::create(dest)?;
        if let Err(err) = io::copy(&mut response.into_reader(), &mut file) {
            drop(file);
            let _ = fs::remove_file(dest);
            return Err(err.into());
        }
        Ok(())
    }

    fn request(&self, config: &Configuration) -> Result<GenerationResponse, (RemoteError, String)> {
        let body = json!({ "favicon_generation": config.request() });
        tracing::debug!("posting generation request to {}", self.endpoint);

        let response = self
            .with_retries(&self.endpoint, || {
                self.agent
                    .post(&self.endpoint)
                    .set("Accept", "application/json")
                    .send_json(body.clone())
            })
            .map_err(|err| {
                let echoed = match &err {
                    RemoteError::Status { body, .. } => body.clone(),
                    _ => String::new(),
                };
                (err, echoed)
            })?;

        let text = response
            .into_string()
            .map_err(|err| (RemoteError::Io(err), String::new()))?;
        parse_response(&text).map_err(|err| (err, text))
    }
}

impl GenerationClient for RfgClient {
    fn generate(
        &self,
        config: &Configuration,
        files_dir: &Path,
    ) -> Result<Descriptor, RemoteError> {
        let response = self.request(config).map_err(|(err, body)| {
            if self.debug {
                RemoteError::Debug {
                    message: err.to_string(),
                    request: describe_request(config),
                    response: body,
                }
            } else {
                err
            }
        })?;

        fs::create_dir_all(files_dir)?;
        tracing::debug!("downloading {} generated files", response.downloads.len());
        response
            .downloads
            .par_iter()
            .try_for_each(|(name, url)| self.fetch_to(url, &files_dir.join(name)))?;

        Ok(response.descriptor)
    }

    fn download_preview(&self, url: &str, dest: &Path) -> Result<(), RemoteError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        self.fetch_to(url, dest)
    }
}

/// Where a preview picture from `url` is stored under `preview_dir`.
pub fn preview_path(preview_dir: &Path, url: &str) -> PathBuf {
    let name = file_name_from_url(url).unwrap_or_else(|_| "preview.png".to_string());
    preview_dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigResolver;
    use crate::test_helpers::{HttpReply, serve};
    use tempfile::TempDir;

    fn config() -> Configuration {
        ConfigResolver::new()
            .with_inline(
                json!({ "apiKey": "0123456789abcdefghij", "design": { "desktopBrowser": {} } })
                    .as_object()
                    .unwrap()
                    .clone(),
            )
            .resolve_with_env(json!({ "type": "url", "url": "https://x/y.png" }), false, |_| None)
            .unwrap()
    }

    fn success_body(base: &str) -> String {
        json!({
            "favicon_generation_result": {
                "result": { "status": "success" },
                "favicon": {
                    "package_url": format!("{base}/package.zip"),
                    "files_urls": [format!("{base}/files/favicon.ico"), format!("{base}/files/site.webmanifest?v=2")],
                    "html_code": "<link rel=\"icon\" href=\"/favicon.ico\">",
                    "overlapping_markups": ["link[rel=\"icon\"]"]
                },
                "preview_picture_url": format!("{base}/preview/preview.png"),
                "files_location": { "type": "root" },
                "version": "0.16"
            }
        })
        .to_string()
    }

    // =========================================================================
    // Parsing
    // =========================================================================

    #[test]
    fn parse_success_response() {
        let parsed = parse_response(&success_body("https://rfg.test")).unwrap();
        assert_eq!(parsed.descriptor.files, vec!["favicon.ico", "site.webmanifest"]);
        assert_eq!(parsed.descriptor.overlapping_markups, vec!["link[rel=\"icon\"]"]);
        assert_eq!(parsed.descriptor.version.as_deref(), Some("0.16"));
        assert_eq!(parsed.downloads[1].1, "https://rfg.test/files/site.webmanifest?v=2");
    }

    #[test]
    fn parse_error_status() {
        let body = json!({
            "favicon_generation_result": {
                "result": { "status": "error", "error_message": "Invalid API key" }
            }
        })
        .to_string();
        let err = parse_response(&body).unwrap_err();
        assert!(matches!(err, RemoteError::Api(ref m) if m == "Invalid API key"));
    }

    #[test]
    fn parse_garbage() {
        assert!(matches!(
            parse_response("<html>oops</html>"),
            Err(RemoteError::Parse(_))
        ));
    }

    #[test]
    fn file_names_from_urls() {
        assert_eq!(
            file_name_from_url("https://a/b/c/favicon-32x32.png?v=1#x").unwrap(),
            "favicon-32x32.png"
        );
        assert!(file_name_from_url("https://a/b/").is_err());
        assert!(file_name_from_url("https://a/..").is_err());
    }

    #[test]
    fn described_request_masks_api_key() {
        let text = describe_request(&config());
        assert!(!text.contains("0123456789abcdefghij"));
        assert!(text.contains("01****************ij"));
    }

    // =========================================================================
    // HTTP
    // =========================================================================

    #[test]
    fn generate_downloads_every_file() {
        let server = serve(3, |req| {
            if req.method == "POST" {
                assert!(req.body.contains("\"favicon_generation\""));
                assert!(req.body.contains("\"desktop_browser\""));
                HttpReply::json(200, success_body(&req.base_url))
            } else if req.path.starts_with("/files/favicon.ico") {
                HttpReply::text(200, "ICO")
            } else {
                HttpReply::text(200, "{\"name\":\"app\"}")
            }
        });
        let tmp = TempDir::new().unwrap();
        let client = RfgClient::new(Duration::from_secs(5), 0)
            .with_endpoint(format!("{}/api/favicon", server.base_url));

        let descriptor = client.generate(&config(), tmp.path()).unwrap();

        assert_eq!(descriptor.files.len(), 2);
        assert_eq!(fs::read_to_string(tmp.path().join("favicon.ico")).unwrap(), "ICO");
        assert!(tmp.path().join("site.webmanifest").exists());
        server.join();
    }

    #[test]
    fn transient_failures_are_retried() {
        let server = serve(2, |req| {
            if req.index == 0 {
                HttpReply::text(503, "busy")
            } else {
                HttpReply::json(
                    200,
                    json!({
                        "favicon_generation_result": {
                            "result": { "status": "success" },
                            "favicon": { "files_urls": [], "html_code": "<meta>" }
                        }
                    })
                    .to_string(),
                )
            }
        });
        let tmp = TempDir::new().unwrap();
        let client = RfgClient::new(Duration::from_secs(5), 2)
            .with_backoff(Duration::from_millis(1))
            .with_endpoint(format!("{}/api/favicon", server.base_url));

        let descriptor = client.generate(&config(), tmp.path()).unwrap();
        assert_eq!(descriptor.html_code, "<meta>");
        assert_eq!(server.join().len(), 2);
    }

    #[test]
    fn client_errors_are_not_retried_and_echo_in_debug() {
        let server = serve(1, |_| HttpReply::text(400, "bad request"));
        let tmp = TempDir::new().unwrap();
        let client = RfgClient::new(Duration::from_secs(5), 3)
            .with_backoff(Duration::from_millis(1))
            .with_endpoint(format!("{}/api/favicon", server.base_url))
            .with_debug(true);

        let err = client.generate(&config(), tmp.path()).unwrap_err();
        match err {
            RemoteError::Debug {
                message, response, ..
            } => {
                assert!(message.contains("HTTP 400"));
                assert_eq!(response, "bad request");
            }
            other => panic!("expected debug echo, got {other:?}"),
        }
        assert_eq!(server.join().len(), 1);
    }

    #[test]
    fn preview_paths() {
        let dir = Path::new("/c/preview");
        assert_eq!(
            preview_path(dir, "https://x/p/preview_123.png?a=b"),
            PathBuf::from("/c/preview/preview_123.png")
        );
        assert_eq!(preview_path(dir, "https://x/"), PathBuf::from("/c/preview/preview.png"));
    }
}
