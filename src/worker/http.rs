use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::Response,
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;

use crate::bridge::Bridge;
use crate::config::normalize_check_path;
use crate::worker::drain::DrainState;

#[derive(Clone)]
pub struct WorkerHttpState {
    pub bridge: Arc<Bridge>,
    pub drain: Arc<DrainState>,
}

/// The worker's private HTTP surface: the health check at `check_url`, everything else
/// through the bridge.
pub fn router(check_url: &str, state: WorkerHttpState) -> Router {
    Router::new()
        .route(&normalize_check_path(check_url), get(health_check))
        .fallback(forward)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<WorkerHttpState>) -> StatusCode {
    if state.drain.is_shutdown_requested() {
        let failed = state.drain.record_failed_check();
        tracing::debug!(failed_checks = failed, "Health check failed while draining");
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

async fn forward(State(state): State<WorkerHttpState>, request: Request) -> Response {
    let _in_flight = state.drain.begin_request();
    state.bridge.on_request(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(drain: Arc<DrainState>) -> Router {
        let mut bridge = Bridge::Hello(Default::default());
        bridge.bootstrap("demo", "test").unwrap();
        router(
            "check",
            WorkerHttpState {
                bridge: Arc::new(bridge),
                drain,
            },
        )
    }

    fn get(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_check_reflects_drain_flag() {
        let drain = Arc::new(DrainState::default());

        let response = app(drain.clone()).oneshot(get("/check")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(drain.failed_checks(), 0);

        drain.request_shutdown();
        for _ in 0..2 {
            let response = app(drain.clone()).oneshot(get("/check")).await.unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
        assert_eq!(drain.failed_checks(), 2);
    }

    #[tokio::test]
    async fn other_paths_go_to_the_bridge() {
        let drain = Arc::new(DrainState::default());
        drain.request_shutdown();

        let response = app(drain.clone()).oneshot(get("/orders/7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Hello from demo (test) at /orders/7\n");

        assert!(!drain.is_processing());
        assert_eq!(drain.failed_checks(), 0);
    }
}
