//! Agent API router.

use crate::handlers;
use axum::routing::{get, post};
use axum::Router;
use kctldbg_config::Config;
use kctldbg_runtime::containerd::progress::PullTracker;
use std::sync::Arc;

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// Agent configuration.
    pub config: Arc<Config>,
    /// Cross-session pull tracker.
    pub tracker: Arc<PullTracker>,
}

/// Creates the agent router with both endpoints.
#[must_use]
pub fn create_router(config: Arc<Config>, tracker: Arc<PullTracker>) -> Router {
    let state = AppState { config, tracker };

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/api/v1/debug", post(handlers::debug))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> Router {
        create_router(Arc::new(Config::default()), Arc::new(PullTracker::new()))
    }

    #[tokio::test]
    async fn test_healthz() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"I'm OK!");
    }

    #[tokio::test]
    async fn test_debug_rejects_unsupported_scheme_before_upgrade() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/debug?container=cri-o%3A%2F%2Fabc&image=busybox&command=%5B%22sh%22%5D")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8_lossy(&body);
        assert!(body.contains("docker and containerd"));
        // Colons are stripped from pre-upgrade error bodies.
        assert!(!body.contains(':'));
    }

    #[tokio::test]
    async fn test_debug_without_upgrade_headers_is_400() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/debug?container=docker%3A%2F%2Fabc&image=busybox&command=%5B%22sh%22%5D")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
