use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{error::ApiError, response::ApiResponse, AppState};
use crate::ocpp::NetworkingNodeId;

#[derive(Debug, Deserialize, Validate)]
pub struct PeerPath {
    #[validate(length(min = 1, max = 48))]
    node_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    node_id: String,
    /// `direct` for a connected peer, `uplink` when only the uplink can reach it
    via: &'static str,
}

/// GET /api/v1/routes/:node_id
pub async fn get_route(
    State(state): State<AppState>,
    Path(path): Path<PeerPath>,
) -> Result<ApiResponse<RouteInfo>, ApiError> {
    path.validate()?;
    let peer = NetworkingNodeId::new(path.node_id);

    let via = if state.node.has_route(&peer) {
        "direct"
    } else if state.node.route(Some(&peer)).is_ok() {
        "uplink"
    } else {
        return Err(ApiError::NotFound(format!("route to {peer}")));
    };

    Ok(ApiResponse::success(RouteInfo {
        node_id: peer.to_string(),
        via,
    }))
}

/// DELETE /api/v1/routes/:node_id
///
/// Forgets a connected peer; requests towards it fall back to the uplink.
pub async fn delete_route(
    State(state): State<AppState>,
    Path(path): Path<PeerPath>,
) -> Result<ApiResponse<RouteInfo>, ApiError> {
    path.validate()?;
    let peer = NetworkingNodeId::new(path.node_id);

    if !state.node.disconnect(&peer) {
        return Err(ApiError::NotFound(format!("route to {peer}")));
    }
    Ok(ApiResponse::success(RouteInfo {
        node_id: peer.to_string(),
        via: "direct",
    }))
}
