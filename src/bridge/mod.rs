//! Application bridges.
//!
//! A bridge adapts an inbound HTTP request to whatever application a worker hosts. The
//! worker bootstraps it once at startup and then calls [`Bridge::on_request`] for every
//! request that is not the health check. Bootstrap failures are fatal to the worker.

pub mod hello;
pub mod static_files;

use std::path::Path;

use axum::extract::Request;
use axum::response::Response;

use crate::error::{FleetError, Result};

pub use hello::HelloBridge;
pub use static_files::StaticFilesBridge;

#[derive(Debug)]
pub enum Bridge {
    Hello(HelloBridge),
    StaticFiles(StaticFilesBridge),
}

impl Bridge {
    /// Pick a bridge by its configured name.
    pub fn from_name(name: &str, working_directory: &Path) -> Result<Self> {
        match name {
            "hello" => Ok(Bridge::Hello(HelloBridge::default())),
            "static" => Ok(Bridge::StaticFiles(StaticFilesBridge::new(working_directory))),
            other => Err(FleetError::UnknownBridge(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Bridge::Hello(_) => "hello",
            Bridge::StaticFiles(_) => "static",
        }
    }

    pub fn bootstrap(&mut self, bootstrap: &str, app_env: &str) -> Result<()> {
        match self {
            Bridge::Hello(bridge) => bridge.bootstrap(bootstrap, app_env),
            Bridge::StaticFiles(bridge) => bridge.bootstrap(bootstrap, app_env),
        }
    }

    pub async fn on_request(&self, request: Request) -> Response {
        match self {
            Bridge::Hello(bridge) => bridge.on_request(request),
            Bridge::StaticFiles(bridge) => bridge.on_request(request).await,
        }
    }
}
