//! Shared test utilities for the rfgen test suite.
//!
//! Provides filesystem fixtures, an in-memory generation client, a progress
//! recorder, a one-shot local HTTP server for exercising the real client,
//! and fakes for the watch session.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let client = MockClient::new(&[("favicon.ico", "ICO")], "<link rel=\"icon\">");
//! let mut generator = FaviconGenerator::new(options, tmp.path()).with_client(client.clone());
//! generator.run().unwrap();
//! assert_eq!(client.calls(), 1);
//! ```

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use serde_json::Value;

use crate::config::Configuration;
use crate::progress::{ProgressError, ProgressEvent, ProgressObserver};
use crate::remote::{Descriptor, GenerationClient, RemoteError};
use crate::watch::{ReconnectStrategy, SessionMessage, WatchBackend, WatchError, WatchTarget};

// =========================================================================
// Filesystem fixtures
// =========================================================================

/// Write `(relative path, content)` pairs under `root`, creating directories.
pub fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (name, content) in files {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

/// A descriptor listing `files` with a one-line markup.
pub fn descriptor_with_files(files: &[&str]) -> Descriptor {
    Descriptor {
        html_code: "<link rel=\"icon\" href=\"/favicon.ico\">".into(),
        overlapping_markups: vec![],
        files: files.iter().map(|f| f.to_string()).collect(),
        preview_picture_url: None,
        files_location: None,
        version: None,
    }
}

// =========================================================================
// Progress
// =========================================================================

/// Records every event; clone the handle from [`events`](Self::events)
/// before handing the observer to a tracker.
#[derive(Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Arc<Mutex<Vec<ProgressEvent>>> {
        Arc::clone(&self.events)
    }
}

impl ProgressObserver for RecordingObserver {
    fn on_progress(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// =========================================================================
// Generation client
// =========================================================================

/// In-memory [`GenerationClient`]. Clones share the call log.
#[derive(Clone, Default)]
pub struct MockClient {
    files: Vec<(String, String)>,
    html_code: String,
    overlapping: Vec<String>,
    preview: Option<String>,
    preview_fails: bool,
    fail: bool,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl MockClient {
    pub fn new(files: &[(&str, &str)], html_code: &str) -> Self {
        Self {
            files: files
                .iter()
                .map(|(n, c)| (n.to_string(), c.to_string()))
                .collect(),
            html_code: html_code.to_string(),
            ..Default::default()
        }
    }

    /// Every call fails with a service error after writing a partial file.
    pub fn failing() -> Self {
        Self {
            files: vec![("partial.png".into(), "x".into())],
            fail: true,
            ..Default::default()
        }
    }

    pub fn with_overlapping(mut self, selectors: &[&str]) -> Self {
        self.overlapping = selectors.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_preview(mut self, url: &str, fails: bool) -> Self {
        self.preview = Some(url.to_string());
        self.preview_fails = fails;
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

impl GenerationClient for MockClient {
    fn generate(
        &self,
        config: &Configuration,
        files_dir: &Path,
    ) -> Result<Descriptor, RemoteError> {
        self.requests.lock().unwrap().push(config.request().clone());
        for (name, content) in &self.files {
            let path = files_dir.join(name);
            std::fs::create_dir_all(path.parent().unwrap())?;
            std::fs::write(path, content)?;
        }
        if self.fail {
            return Err(RemoteError::Api("mock failure".into()));
        }
        Ok(Descriptor {
            html_code: self.html_code.clone(),
            overlapping_markups: self.overlapping.clone(),
            files: self.files.iter().map(|(n, _)| n.clone()).collect(),
            preview_picture_url: self.preview.clone(),
            files_location: None,
            version: Some("mock".into()),
        })
    }

    fn download_preview(&self, url: &str, dest: &Path) -> Result<(), RemoteError> {
        std::fs::create_dir_all(dest.parent().unwrap())?;
        std::fs::write(dest, "PARTIAL")?;
        if self.preview_fails {
            return Err(RemoteError::Http {
                url: url.to_string(),
                message: "connection reset".into(),
            });
        }
        std::fs::write(dest, "PREVIEW")?;
        Ok(())
    }
}

// =========================================================================
// Local HTTP server
// =========================================================================

/// A request as seen by [`serve`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Zero-based position in arrival order.
    pub index: usize,
    pub method: String,
    pub path: String,
    pub body: String,
    /// `http://127.0.0.1:<port>`
    pub base_url: String,
}

pub struct HttpReply {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl HttpReply {
    pub fn json(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.to_string(),
        }
    }
}

pub struct TestServer {
    pub base_url: String,
    handle: JoinHandle<Vec<HttpRequest>>,
}

impl TestServer {
    /// Wait for the server to answer all expected requests.
    pub fn join(self) -> Vec<HttpRequest> {
        self.handle.join().unwrap()
    }
}

/// Answer exactly `expected` requests with `handler`, one connection each.
pub fn serve<F>(expected: usize, handler: F) -> TestServer
where
    F: Fn(&HttpRequest) -> HttpReply + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let base = base_url.clone();
    let handle = thread::spawn(move || {
        let mut seen = Vec::with_capacity(expected);
        for index in 0..expected {
            let (stream, _) = listener.accept().unwrap();
            let request = read_request(&stream, index, &base);
            let reply = handler(&request);
            write_reply(stream, &reply);
            seen.push(request);
        }
        seen
    });
    TestServer { base_url, handle }
}

fn read_request(stream: &TcpStream, index: usize, base_url: &str) -> HttpRequest {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).unwrap();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap();
        }
    }
    let mut body = vec![0; content_length];
    reader.read_exact(&mut body).unwrap();

    HttpRequest {
        index,
        method,
        path,
        body: String::from_utf8_lossy(&body).into_owned(),
        base_url: base_url.to_string(),
    }
}

fn write_reply(mut stream: TcpStream, reply: &HttpReply) {
    let reason = match reply.status {
        200 => "OK",
        400 => "Bad Request",
        503 => "Service Unavailable",
        _ => "Status",
    };
    let head = format!(
        "HTTP/1.1 {} {reason}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        reply.status,
        reply.content_type,
        reply.body.len()
    );
    stream.write_all(head.as_bytes()).unwrap();
    stream.write_all(reply.body.as_bytes()).unwrap();
    stream.flush().unwrap();
}

// =========================================================================
// Watch fakes
// =========================================================================

/// Records attach/detach calls.
#[derive(Debug, Default)]
pub struct FakeBackend {
    pub calls: Vec<(String, PathBuf)>,
}

impl WatchBackend for FakeBackend {
    fn attach(&mut self, path: &Path) -> Result<(), WatchError> {
        self.calls.push(("attach".into(), path.to_path_buf()));
        Ok(())
    }

    fn detach(&mut self, path: &Path) -> Result<(), WatchError> {
        self.calls.push(("detach".into(), path.to_path_buf()));
        Ok(())
    }

    fn reconnect_strategy(&self) -> ReconnectStrategy {
        ReconnectStrategy::ReattachOnRename
    }
}

/// Counts actions. Optionally injects messages while the first run is in
/// progress, and fails every run when `fail` is set.
#[derive(Default)]
pub struct FakeTarget {
    pub regenerations: usize,
    pub cleans: usize,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub fail: bool,
    pub during_first_run: Vec<SessionMessage>,
    pub tx: Option<Sender<SessionMessage>>,
}

impl WatchTarget for FakeTarget {
    type Error = String;

    fn regenerate(&mut self) -> Result<(), String> {
        self.in_flight += 1;
        self.max_in_flight = self.max_in_flight.max(self.in_flight);
        self.regenerations += 1;
        if self.regenerations == 1
            && let Some(tx) = &self.tx
        {
            for message in self.during_first_run.drain(..) {
                tx.send(message).unwrap();
            }
        }
        self.in_flight -= 1;
        if self.fail {
            return Err("generation failed".into());
        }
        Ok(())
    }

    fn clean(&mut self) -> Result<(), String> {
        self.cleans += 1;
        Ok(())
    }
}
