use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{error::ApiError, response::ApiResponse, AppState};
use crate::node::NodeStatus;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    timestamp: DateTime<Utc>,
    node: NodeStatus,
    system: SystemInfo,
}

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    uptime_seconds: u64,
    version: String,
}

/// GET /api/v1/status
///
/// Node id, routes, registered actions, pending correlations and the
/// forwarding counters.
pub async fn get_status(
    State(state): State<AppState>,
) -> Result<ApiResponse<SystemStatus>, ApiError> {
    if state.node.is_shutting_down() {
        return Err(ApiError::ServiceUnavailable(format!(
            "node {} is shutting down",
            state.node.id()
        )));
    }

    let started = std::time::Instant::now();
    let status = SystemStatus {
        timestamp: Utc::now(),
        node: state.node.status(),
        system: SystemInfo {
            uptime_seconds: state.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };
    Ok(ApiResponse::success(status).with_duration(started.elapsed().as_millis() as u64))
}
