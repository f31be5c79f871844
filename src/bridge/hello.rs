use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::{FleetError, Result};

/// Answers every request with a greeting naming the application and the path.
#[derive(Debug, Default)]
pub struct HelloBridge {
    greeting: Option<String>,
}

impl HelloBridge {
    pub fn bootstrap(&mut self, bootstrap: &str, app_env: &str) -> Result<()> {
        if bootstrap.is_empty() {
            return Err(FleetError::Bootstrap("empty application name".to_string()));
        }
        self.greeting = Some(format!("Hello from {} ({})", bootstrap, app_env));
        Ok(())
    }

    pub fn on_request(&self, request: Request) -> Response {
        match &self.greeting {
            Some(greeting) => format!("{} at {}\n", greeting, request.uri().path()).into_response(),
            None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        }
    }
}
