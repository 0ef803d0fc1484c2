use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    dispatcher: ComponentHealth,
    correlations: ComponentHealth,
}

/// Health status of a component
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ComponentHealth {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            status: "healthy".to_string(),
            detail: Some(detail.into()),
            error: None,
        }
    }

    fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: "unhealthy".to_string(),
            detail: None,
            error: Some(error.into()),
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let node = &state.node;

    let dispatcher = if node.is_shutting_down() {
        ComponentHealth::unhealthy("shutting down")
    } else {
        ComponentHealth::healthy(format!(
            "{} actions handled",
            node.dispatcher().handled_actions().len()
        ))
    };
    let correlations = ComponentHealth::healthy(format!(
        "{} pending",
        node.correlations().pending_count()
    ));

    let all_healthy = dispatcher.is_healthy() && correlations.is_healthy();
    let response = HealthResponse {
        status: if all_healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: chrono::Utc::now(),
        checks: HealthChecks {
            dispatcher,
            correlations,
        },
    };

    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response))
}

/// GET /health/ready
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.node.is_shutting_down() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

/// GET /health/live
pub async fn liveness_check() -> impl IntoResponse {
    StatusCode::OK
}
