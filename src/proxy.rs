//! Execute PHP route content through the sandbox
//!
//! Each execution writes the route's source to a uniquely named file in the
//! sandbox root, replays the inbound request against it over loopback, relays
//! the response and removes the file again.

use crate::error::{text_error_response, ProxyError};
use crate::pool::ConnectionPool;
use crate::request::InboundRequest;
use crate::response::{full_body, with_cors, HttpResponse};
use crate::sandbox::SandboxManager;
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderName;
use hyper::{HeaderMap, Request, Response};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::timeout;
use tracing::{debug, error, warn};

const PHP_OPEN_TAG: &str = "<?php";

/// Body of every failed script execution; details go to the log only
const EXECUTION_FAILED_BODY: &str = "Error evaluating PHP code";

/// Request headers that are never replayed to the sandbox. The client
/// recomputes framing for the buffered body.
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
];

/// Response headers that are never relayed back
const SKIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
];

pub struct ScriptRunner {
    sandbox: Arc<SandboxManager>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

impl ScriptRunner {
    pub fn new(sandbox: Arc<SandboxManager>, pool: Arc<ConnectionPool>, request_timeout: Duration) -> Self {
        Self {
            sandbox,
            pool,
            request_timeout,
        }
    }

    /// Run `source` against the inbound request. Never fails: errors become a 500.
    pub async fn execute(&self, source: &str, req: &InboundRequest) -> HttpResponse {
        match self.try_execute(source, req).await {
            Ok(response) => response,
            Err(e) => {
                error!(path = %req.path(), error = %e, "Error evaluating PHP code");
                with_cors(text_error_response(e.code(), EXECUTION_FAILED_BODY))
            }
        }
    }

    async fn try_execute(&self, source: &str, req: &InboundRequest) -> Result<HttpResponse, ProxyError> {
        let endpoint = self.sandbox.ensure_running().await?;
        let _running = self.sandbox.begin_execution();

        let script = ScriptFile::create(&endpoint.root, source).await?;
        debug!(file = %script.name(), port = endpoint.port, "Executing script");

        let result = self.forward(endpoint.port, script.name(), req).await;
        script.remove().await;

        match &result {
            Ok(_) => self.sandbox.mark_verified(endpoint.port).await,
            Err(ProxyError::Transport(e)) if e.is_connect() => {
                self.sandbox.invalidate(endpoint.port).await;
            }
            Err(_) => {}
        }

        result
    }

    async fn forward(&self, port: u16, file_name: &str, req: &InboundRequest) -> Result<HttpResponse, ProxyError> {
        let uri = target_uri(port, file_name, req.query());

        let mut builder = Request::builder().method(req.method.clone()).uri(&uri);
        if let Some(headers) = builder.headers_mut() {
            copy_headers(&req.headers, headers, SKIPPED_REQUEST_HEADERS);
        }
        let sandbox_req = builder
            .body(Full::new(req.body.clone()))
            .map_err(|e| ProxyError::Request(e.to_string()))?;

        let exchange = async {
            let response = self.pool.send_request(sandbox_req).await?;
            let (parts, body) = response.into_parts();
            let bytes = body
                .collect()
                .await
                .map_err(ProxyError::ResponseBody)?
                .to_bytes();
            Ok::<_, ProxyError>((parts, bytes))
        };

        let (parts, bytes) = timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| ProxyError::Timeout(self.request_timeout))??;

        let mut response = Response::builder()
            .status(parts.status)
            .body(full_body(bytes))
            .expect("valid response builder");
        copy_headers(&parts.headers, response.headers_mut(), SKIPPED_RESPONSE_HEADERS);

        Ok(with_cors(response))
    }
}

/// A script materialized in the sandbox root for one execution.
/// Removed explicitly after the response, or on drop if the request was cancelled.
pub struct ScriptFile {
    name: String,
    path: PathBuf,
    removed: bool,
}

impl ScriptFile {
    pub async fn create(root: &Path, source: &str) -> Result<Self, ProxyError> {
        let name = script_file_name();
        let path = root.join(&name);

        tokio::fs::write(&path, normalize_source(source))
            .await
            .map_err(|e| ProxyError::ScriptWrite {
                path: path.clone(),
                source: e,
            })?;

        Ok(Self {
            name,
            path,
            removed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) {
        self.removed = true;
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!(file = %self.path.display(), error = %e, "Error deleting temporary PHP file");
        }
    }
}

impl Drop for ScriptFile {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// `<unix millis>-<13 random lowercase alphanumerics>.php`
pub fn script_file_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(13)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!("{}-{}.php", millis, suffix)
}

/// Trim the source and make sure it opens PHP mode
pub fn normalize_source(source: &str) -> String {
    let trimmed = source.trim();
    if trimmed.starts_with(PHP_OPEN_TAG) {
        trimmed.to_string()
    } else {
        format!("{}\n{}", PHP_OPEN_TAG, trimmed)
    }
}

pub fn target_uri(port: u16, file_name: &str, query: Option<&str>) -> String {
    match query.filter(|q| !q.is_empty()) {
        Some(query) => format!("http://127.0.0.1:{}/{}?{}", port, file_name, query),
        None => format!("http://127.0.0.1:{}/{}", port, file_name),
    }
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap, skipped: &[&str]) {
    for (name, value) in from.iter() {
        if is_skipped(name, skipped) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

fn is_skipped(name: &HeaderName, skipped: &[&str]) -> bool {
    skipped.iter().any(|s| name.as_str().eq_ignore_ascii_case(s))
}
