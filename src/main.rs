use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ocpp_node::{api, config, dispatch, forwarding, node, ocpp, telemetry};
use config::Config;
use node::NetworkingNode;
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cfg = Config::load()?;
    init_tracing(&cfg.logging);
    let node_id = ocpp::NetworkingNodeId::new(cfg.node.id.clone());

    let dispatcher = node::builtin::register(
        dispatch::Dispatcher::builder(node_id.clone(), Arc::new(ocpp::MessageCatalog::standard())),
        cfg.node.role,
    )
    .signatures(cfg.signatures.policy()?)
    .build();
    let forwarding = forwarding::ForwardingEngine::builder(node_id)
        .default_result(cfg.forwarding.default_result)
        .build();
    let node = NetworkingNode::new(dispatcher, forwarding, cfg.correlation.node_options());
    let sweeper = node.spawn_sweeper(cfg.correlation.sweep_interval());

    let app = api::router(
        api::AppState::new(node.clone()),
        Duration::from_secs(cfg.server.request_timeout_secs),
    );
    let addr = cfg.server.socket_addr()?;

    if cfg.server.host == "0.0.0.0" {
        warn!("admin API binding to 0.0.0.0 - it will be reachable from the network");
    }

    info!(
        %addr,
        node_id = %node.id(),
        role = %cfg.node.role,
        default_forwarding = %cfg.forwarding.default_result,
        "starting OCPP node"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    node.shutdown();
    sweeper.await?;
    warn!("shutdown complete");
    Ok(())
}
