//! Admin HTTP surface of a running node

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use ocpp_node::api::{router, AppState};
use ocpp_node::dispatch::Dispatcher;
use ocpp_node::forwarding::{ForwardingEngine, ForwardingResult};
use ocpp_node::node::{builtin, ChannelSink, NetworkingNode, NodeOptions, NodeRole};
use ocpp_node::ocpp::MessageCatalog;
use serde_json::Value;
use tower::ServiceExt;

fn node() -> Arc<NetworkingNode> {
    let dispatcher = builtin::register(
        Dispatcher::builder("NN01".into(), Arc::new(MessageCatalog::standard())),
        NodeRole::NetworkingNode,
    );
    let forwarding = ForwardingEngine::builder("NN01".into()).default_result(ForwardingResult::Drop);
    NetworkingNode::new(dispatcher.build(), forwarding.build(), NodeOptions::default())
}

async fn get(node: &Arc<NetworkingNode>, uri: &str) -> (StatusCode, Value) {
    call(node, "GET", uri).await
}

async fn call(node: &Arc<NetworkingNode>, method: &str, uri: &str) -> (StatusCode, Value) {
    let app = router(AppState::new(node.clone()), Duration::from_secs(5));
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_health_reports_components() {
    let node = node();
    let (status, body) = get(&node, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["correlations"]["detail"], "0 pending");

    let (status, _) = get(&node, "/health/live").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get(&node, "/health/ready").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_status_describes_node() {
    let node = node();
    let (sink, _rx) = ChannelSink::new();
    node.connect("CS001".into(), Arc::new(sink));

    let (status, body) = get(&node, "/api/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["duration_ms"].is_u64());

    let node_status = &body["data"]["node"];
    assert_eq!(node_status["nodeId"], "NN01");
    assert_eq!(node_status["routes"], serde_json::json!(["CS001"]));
    assert_eq!(node_status["hasUplink"], false);
    assert_eq!(node_status["defaultForwarding"], "DROP");
    assert!(node_status["handledActions"]
        .as_array()
        .unwrap()
        .iter()
        .any(|action| action == "Heartbeat"));
}

#[tokio::test]
async fn test_shutting_down_node_is_unavailable() {
    let node = node();
    node.shutdown();

    let (status, body) = get(&node, "/api/v1/status").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "ServiceUnavailable");
    assert_eq!(body["details"], "node NN01 is shutting down");

    let (status, body) = get(&node, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");

    let (status, _) = get(&node, "/health/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (status, _) = get(&node(), "/api/v1/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_route_lookup_and_removal() {
    let node = node();
    let (sink, _rx) = ChannelSink::new();
    node.connect("CS001".into(), Arc::new(sink));

    let (status, body) = get(&node, "/api/v1/routes/CS001").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["via"], "direct");

    let (status, body) = get(&node, "/api/v1/routes/CS404").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NotFound");

    let (status, _) = call(&node, "DELETE", "/api/v1/routes/CS001").await;
    assert_eq!(status, StatusCode::OK);
    assert!(node.status().routes.is_empty());

    let (status, _) = call(&node, "DELETE", "/api/v1/routes/CS001").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_route_lookup_falls_back_to_uplink() {
    let node = node();
    let (uplink, _rx) = ChannelSink::new();
    node.set_uplink(Arc::new(uplink));

    let (status, body) = get(&node, "/api/v1/routes/CSMS").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["via"], "uplink");
    assert_eq!(body["data"]["nodeId"], "CSMS");
}

#[tokio::test]
async fn test_overlong_node_id_is_rejected() {
    let uri = format!("/api/v1/routes/{}", "X".repeat(49));
    let (status, body) = get(&node(), &uri).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");
}
