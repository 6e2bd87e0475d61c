//! Static serving of the admin single-page app
//!
//! The admin build is mounted under the admin path. Asset requests are served
//! from the build directory; any other path under the mount gets `index.html`
//! so client-side routing works. The bare mount point redirects to the login view.

use crate::response::{full_body, redirect, text_response, HttpResponse};
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error};

pub struct AdminUi {
    /// Mount point without trailing slash, e.g. "/manager"
    root: String,
    build_dir: PathBuf,
}

impl AdminUi {
    pub fn new(root: impl Into<String>, build_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            build_dir: build_dir.into(),
        }
    }

    /// True for the mount point itself and everything below it
    pub fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.root.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    pub async fn handle(&self, path: &str) -> HttpResponse {
        let rest = path
            .strip_prefix(self.root.as_str())
            .unwrap_or("")
            .trim_start_matches('/');

        if rest.is_empty() {
            return redirect(&format!("{}/#/login", self.root));
        }

        if let Some(asset) = self.asset_path(rest) {
            if let Ok(contents) = tokio::fs::read(&asset).await {
                debug!(asset = %asset.display(), "Serving admin asset");
                return file_response(&asset, contents);
            }
        }

        let index = self.build_dir.join("index.html");
        match tokio::fs::read(&index).await {
            Ok(contents) => file_response(&index, contents),
            Err(e) => {
                error!(index = %index.display(), error = %e, "Admin interface not built");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Admin interface is not available")
            }
        }
    }

    /// Resolve a request path inside the build directory; rejects traversal
    fn asset_path(&self, rest: &str) -> Option<PathBuf> {
        let relative = Path::new(rest);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        let candidate = self.build_dir.join(relative);
        candidate.is_file().then_some(candidate)
    }
}

fn file_response(path: &Path, contents: Vec<u8>) -> HttpResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, guess_content_type(path))
        .body(full_body(contents))
        .expect("valid response builder")
}

/// Guess content type from file extension
fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" | "map" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}
