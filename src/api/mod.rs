pub mod error;
pub mod health;
pub mod response;
pub mod routes;
pub mod status;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::node::NetworkingNode;

/// Shared state of the admin surface
#[derive(Debug, Clone)]
pub struct AppState {
    pub node: Arc<NetworkingNode>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(node: Arc<NetworkingNode>) -> Self {
        Self {
            node,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness_check))
        .route("/health/ready", get(health::readiness_check))
        .route("/api/v1/status", get(status::get_status))
        .route(
            "/api/v1/routes/:node_id",
            get(routes::get_route).delete(routes::delete_route),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(64 * 1024))
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .layer(TraceLayer::new_for_http())
}
