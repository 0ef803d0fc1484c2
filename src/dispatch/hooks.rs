//! Observer notifications for the dispatch state machine
//!
//! Observers are diagnostic only: they run concurrently, their failures and
//! panics are logged and never change what the peer receives.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::warn;

use crate::ocpp::{NetworkingNodeId, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum DispatchStage {
    RequestReceived,
    RequestValidated,
    ResponseChosen,
    ResponseSent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    pub stage: DispatchStage,
    pub timestamp: DateTime<Utc>,
    pub request_id: RequestId,
    pub action: String,
    pub source: Option<NetworkingNodeId>,
    /// Outcome kind, from `ResponseChosen` on
    pub outcome: Option<&'static str>,
}

#[async_trait]
pub trait DispatchObserver: Send + Sync {
    async fn on_event(&self, event: &DispatchEvent) -> anyhow::Result<()>;
}

/// Deliver `event` to every observer and wait for all of them.
pub async fn notify(observers: &[Arc<dyn DispatchObserver>], event: DispatchEvent) {
    if observers.is_empty() {
        return;
    }

    let event = Arc::new(event);
    let tasks = observers.iter().cloned().map(|observer| {
        let event = event.clone();
        tokio::spawn(async move { observer.on_event(&event).await })
    });

    for result in join_all(tasks).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                stage = %event.stage,
                request_id = %event.request_id,
                error = %e,
                "dispatch observer failed"
            ),
            Err(e) => warn!(
                stage = %event.stage,
                request_id = %event.request_id,
                error = %e,
                "dispatch observer panicked"
            ),
        }
    }
}
