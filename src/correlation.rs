//! Correlation table
//!
//! Outstanding requests keyed by RequestId. Every entry reaches exactly one
//! terminal outcome (an answer or a timeout) and is removed when it does;
//! whoever removes the entry fires its completion slot. An entry registered
//! on a connection only accepts answers arriving on that connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::node::ConnectionId;
use crate::ocpp::{NetworkingNodeId, RequestId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("request id {0} is already outstanding")]
    DuplicateRequestId(RequestId),
}

/// Terminal outcome of one pending request
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelationOutcome {
    /// Response or error envelope carrying the request's id
    Answered(Envelope),
    TimedOut { after: Duration },
}

#[derive(Debug)]
pub struct PendingCorrelation {
    pub action: String,
    pub destination: Option<NetworkingNodeId>,
    /// Connection the request left on; `None` accepts answers from anywhere
    pub peer: Option<ConnectionId>,
    pub registered_at: Instant,
    pub deadline: Instant,
    completion: oneshot::Sender<CorrelationOutcome>,
}

impl PendingCorrelation {
    fn complete(self, request_id: &RequestId, outcome: CorrelationOutcome) {
        if self.completion.send(outcome).is_err() {
            debug!(request_id = %request_id, action = %self.action, "completion handle already dropped");
        }
    }
}

/// Shared table of outstanding requests; clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct CorrelationTable {
    pending: Arc<Mutex<HashMap<RequestId, PendingCorrelation>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        request_id: RequestId,
        action: impl Into<String>,
        destination: Option<NetworkingNodeId>,
        timeout: Duration,
    ) -> Result<CompletionHandle, CorrelationError> {
        self.insert(None, request_id, action.into(), destination, timeout)
    }

    /// Register a request sent on `peer`; only answers from `peer` resolve it.
    pub fn register_on(
        &self,
        peer: ConnectionId,
        request_id: RequestId,
        action: impl Into<String>,
        destination: Option<NetworkingNodeId>,
        timeout: Duration,
    ) -> Result<CompletionHandle, CorrelationError> {
        self.insert(Some(peer), request_id, action.into(), destination, timeout)
    }

    fn insert(
        &self,
        peer: Option<ConnectionId>,
        request_id: RequestId,
        action: String,
        destination: Option<NetworkingNodeId>,
        timeout: Duration,
    ) -> Result<CompletionHandle, CorrelationError> {
        let now = Instant::now();
        let deadline = now + timeout;
        let (tx, rx) = oneshot::channel();

        let mut pending = self.pending.lock();
        if pending.contains_key(&request_id) {
            return Err(CorrelationError::DuplicateRequestId(request_id));
        }
        pending.insert(
            request_id.clone(),
            PendingCorrelation {
                action,
                destination,
                peer,
                registered_at: now,
                deadline,
                completion: tx,
            },
        );
        drop(pending);

        Ok(CompletionHandle {
            request_id,
            deadline,
            timeout,
            receiver: rx,
            table: self.clone(),
        })
    }

    /// Hand a response or error envelope to whoever registered its RequestId,
    /// whatever connection it was registered on.
    ///
    /// Returns `false` (and logs) when the id is not outstanding, which covers
    /// late answers after a timeout and duplicate answers.
    pub fn resolve(&self, envelope: Envelope) -> bool {
        self.complete_with(None, envelope)
    }

    /// Like [`CorrelationTable::resolve`] for an answer received on `peer`.
    /// Answers to a request sent on another connection are ignored and leave
    /// the entry pending.
    pub fn resolve_from(&self, peer: ConnectionId, envelope: Envelope) -> bool {
        self.complete_with(Some(peer), envelope)
    }

    fn complete_with(&self, arrived_on: Option<ConnectionId>, envelope: Envelope) -> bool {
        if envelope.is_request() {
            warn!(kind = envelope.kind(), request_id = %envelope.request_id(), "requests cannot resolve a correlation");
            return false;
        }

        let request_id = envelope.request_id().clone();
        let entry = {
            let mut pending = self.pending.lock();
            match (pending.get(&request_id).and_then(|e| e.peer), arrived_on) {
                (Some(expected), Some(actual)) if expected != actual => {
                    warn!(
                        request_id = %request_id,
                        kind = envelope.kind(),
                        expected = %expected,
                        arrived_on = %actual,
                        "answer arrived on the wrong connection, ignoring"
                    );
                    return false;
                }
                _ => pending.remove(&request_id),
            }
        };
        match entry {
            Some(entry) => {
                debug!(
                    request_id = %request_id,
                    action = %entry.action,
                    kind = envelope.kind(),
                    elapsed_ms = entry.registered_at.elapsed().as_millis() as u64,
                    "correlation resolved"
                );
                entry.complete(&request_id, CorrelationOutcome::Answered(envelope));
                true
            }
            None => {
                info!(request_id = %request_id, kind = envelope.kind(), "no pending request for answer, ignoring");
                false
            }
        }
    }

    /// Time out every entry whose deadline is at or before `now`.
    pub fn expire_older_than(&self, now: Instant) -> Vec<RequestId> {
        let expired: Vec<(RequestId, PendingCorrelation)> = {
            let mut pending = self.pending.lock();
            let overdue: Vec<RequestId> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            overdue
                .into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        expired
            .into_iter()
            .map(|(request_id, entry)| {
                let after = now.saturating_duration_since(entry.registered_at);
                warn!(
                    request_id = %request_id,
                    action = %entry.action,
                    after_ms = after.as_millis() as u64,
                    "request timed out"
                );
                entry.complete(&request_id, CorrelationOutcome::TimedOut { after });
                request_id
            })
            .collect()
    }

    fn expire_one(&self, request_id: &RequestId, now: Instant) {
        let entry = self.pending.lock().remove(request_id);
        if let Some(entry) = entry {
            let after = now.saturating_duration_since(entry.registered_at);
            warn!(request_id = %request_id, action = %entry.action, after_ms = after.as_millis() as u64, "request timed out");
            entry.complete(request_id, CorrelationOutcome::TimedOut { after });
        }
    }

    /// Forget a registration whose request never left this node.
    pub fn abandon(&self, request_id: &RequestId) -> bool {
        self.pending.lock().remove(request_id).is_some()
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.pending.lock().contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Receiving side of one registration
#[derive(Debug)]
pub struct CompletionHandle {
    request_id: RequestId,
    deadline: Instant,
    timeout: Duration,
    receiver: oneshot::Receiver<CorrelationOutcome>,
    table: CorrelationTable,
}

impl CompletionHandle {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Wait for the terminal outcome. The handle expires its own entry at the
    /// deadline so callers never depend on the sweeper's cadence.
    pub async fn wait(mut self) -> CorrelationOutcome {
        tokio::select! {
            outcome = &mut self.receiver => {
                return outcome.unwrap_or(CorrelationOutcome::TimedOut { after: self.timeout });
            }
            _ = tokio::time::sleep_until(self.deadline) => {}
        }

        self.table.expire_one(&self.request_id, Instant::now());
        (&mut self.receiver)
            .await
            .unwrap_or(CorrelationOutcome::TimedOut { after: self.timeout })
    }
}

/// Periodically expire abandoned correlations until `shutdown` fires.
pub fn spawn_expiry_sweeper(
    table: CorrelationTable,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("correlation sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let expired = table.expire_older_than(Instant::now());
                    if !expired.is_empty() {
                        debug!(count = expired.len(), pending = table.pending_count(), "swept expired correlations");
                    }
                }
            }
        }
    })
}
