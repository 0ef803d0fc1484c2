//! "Filtered" notifications, emitted after every forwarding decision

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::warn;

use super::ForwardingResult;
use crate::ocpp::{NetworkPath, NetworkingNodeId, RequestId};

/// Who made the decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum DecisionSource {
    Filter,
    FilterError,
    Default,
    LoopGuard,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardingEvent {
    pub timestamp: DateTime<Utc>,
    pub request_id: RequestId,
    pub action: String,
    pub destination: Option<NetworkingNodeId>,
    pub network_path: NetworkPath,
    pub result: ForwardingResult,
    pub reason: Option<String>,
    pub source: DecisionSource,
}

#[async_trait]
pub trait ForwardingObserver: Send + Sync {
    async fn on_decision(&self, event: &ForwardingEvent) -> anyhow::Result<()>;
}

pub(crate) async fn notify(observers: &[Arc<dyn ForwardingObserver>], event: ForwardingEvent) {
    if observers.is_empty() {
        return;
    }

    let event = Arc::new(event);
    let tasks = observers.iter().cloned().map(|observer| {
        let event = event.clone();
        tokio::spawn(async move { observer.on_decision(&event).await })
    });

    for result in join_all(tasks).await {
        let error = match result {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        warn!(request_id = %event.request_id, error = %error, "forwarding observer failed");
    }
}
