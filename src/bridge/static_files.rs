use std::io;
use std::path::{Component, Path, PathBuf};

use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::error::{FleetError, Result};

const INDEX_FILE: &str = "index.html";

/// Serves files from `<working_directory>/<bootstrap>`.
#[derive(Debug)]
pub struct StaticFilesBridge {
    working_directory: PathBuf,
    root: Option<PathBuf>,
}

impl StaticFilesBridge {
    pub fn new(working_directory: &Path) -> Self {
        Self {
            working_directory: working_directory.to_path_buf(),
            root: None,
        }
    }

    pub fn bootstrap(&mut self, bootstrap: &str, app_env: &str) -> Result<()> {
        let root = self.working_directory.join(bootstrap);
        if !root.is_dir() {
            return Err(FleetError::Bootstrap(format!(
                "document root {} is not a directory",
                root.display()
            )));
        }
        tracing::debug!(root = %root.display(), app_env, "Serving static files");
        self.root = Some(root);
        Ok(())
    }

    /// Map a request path to a file under the root. `None` if it tries to leave it.
    fn resolve(root: &Path, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        let mut file = root.join(relative);
        if path.ends_with('/') || relative.as_os_str().is_empty() {
            file.push(INDEX_FILE);
        }
        Some(file)
    }

    pub async fn on_request(&self, request: Request) -> Response {
        let Some(root) = &self.root else {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        };
        let Some(file) = Self::resolve(root, request.uri().path()) else {
            return StatusCode::FORBIDDEN.into_response();
        };

        match tokio::fs::read(&file).await {
            Ok(bytes) => ([(header::CONTENT_TYPE, content_type(&file))], bytes).into_response(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => StatusCode::NOT_FOUND.into_response(),
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "Failed to read static file");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

fn content_type(file: &Path) -> &'static str {
    match file.extension().and_then(|ext| ext.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}
