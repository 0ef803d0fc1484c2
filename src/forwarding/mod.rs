//! Forwarding decision engine
//!
//! A message addressed to another node gets exactly one [`ForwardingDecision`].
//! Filters run concurrently with the same first-answer-in-registration-order
//! rule as request handlers. A DROP always carries the response the origin
//! will receive (supplied by the filter or synthesized as
//! `Filtered("Default handler")`); a FORWARD never does.

pub mod hooks;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::dispatch::{deferred, first_answer, Invocation, Outcome, DEFAULT_HANDLER};
use crate::envelope::Envelope;
use crate::ocpp::{NetworkingNodeId, OcppRequest};

pub use hooks::{DecisionSource, ForwardingEvent, ForwardingObserver};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ForwardingResult {
    #[default]
    Forward,
    Drop,
}

/// What a filter answers for one message
#[derive(Debug, Clone, PartialEq)]
pub struct FilterVerdict {
    pub result: ForwardingResult,
    /// Answer sent back to the origin on DROP
    pub response: Option<Outcome<Value>>,
    pub reason: Option<String>,
}

impl FilterVerdict {
    pub fn forward() -> Self {
        Self {
            result: ForwardingResult::Forward,
            response: None,
            reason: None,
        }
    }

    pub fn drop(reason: impl Into<String>) -> Self {
        Self {
            result: ForwardingResult::Drop,
            response: None,
            reason: Some(reason.into()),
        }
    }

    pub fn with_response(mut self, response: Outcome<Value>) -> Self {
        self.response = Some(response);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForwardingDecision {
    Forward {
        request: Envelope,
        reason: Option<String>,
    },
    Drop {
        request: Envelope,
        response: Outcome<Value>,
        reason: String,
    },
}

impl ForwardingDecision {
    pub fn result(&self) -> ForwardingResult {
        match self {
            Self::Forward { .. } => ForwardingResult::Forward,
            Self::Drop { .. } => ForwardingResult::Drop,
        }
    }

    pub fn request(&self) -> &Envelope {
        match self {
            Self::Forward { request, .. } | Self::Drop { request, .. } => request,
        }
    }

    pub fn drop_response(&self) -> Option<&Outcome<Value>> {
        match self {
            Self::Forward { .. } => None,
            Self::Drop { response, .. } => Some(response),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Forward { reason, .. } => reason.as_deref(),
            Self::Drop { reason, .. } => Some(reason),
        }
    }
}

/// Message information handed to filters
#[derive(Debug, Clone)]
pub struct ForwardContext {
    pub node_id: NetworkingNodeId,
    pub action: String,
    pub destination: Option<NetworkingNodeId>,
    pub cancel: CancellationToken,
}

type Filter = Arc<dyn Fn(ForwardContext, Envelope) -> Invocation<FilterVerdict> + Send + Sync>;

struct RegisteredFilter {
    /// `None` applies to every action
    action: Option<String>,
    filter: Filter,
}

#[derive(Debug, Default)]
pub struct ForwardingStats {
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl ForwardingStats {
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct ForwardingEngineBuilder {
    node_id: NetworkingNodeId,
    default_result: ForwardingResult,
    filters: Vec<RegisteredFilter>,
    observers: Vec<Arc<dyn ForwardingObserver>>,
}

impl ForwardingEngineBuilder {
    pub fn default_result(mut self, result: ForwardingResult) -> Self {
        self.default_result = result;
        self
    }

    /// Filter consulted for every message.
    pub fn filter<F, Fut>(self, filter: F) -> Self
    where
        F: Fn(ForwardContext, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<FilterVerdict>>> + Send + 'static,
    {
        self.push(None, filter)
    }

    /// Filter consulted only for `action`.
    pub fn filter_action<F, Fut>(self, action: impl Into<String>, filter: F) -> Self
    where
        F: Fn(ForwardContext, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<FilterVerdict>>> + Send + 'static,
    {
        self.push(Some(action.into()), filter)
    }

    /// Typed filter for `T::ACTION` JSON requests.
    pub fn filter_typed<T, F, Fut>(self, filter: F) -> Self
    where
        T: OcppRequest,
        F: Fn(ForwardContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<FilterVerdict>>> + Send + 'static,
    {
        let filter = Arc::new(filter);
        self.filter_action(T::ACTION, move |ctx, envelope| {
            call_typed::<T, F, Fut>(filter.clone(), ctx, envelope)
        })
    }

    fn push<F, Fut>(mut self, action: Option<String>, filter: F) -> Self
    where
        F: Fn(ForwardContext, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<FilterVerdict>>> + Send + 'static,
    {
        let filter = Arc::new(filter);
        let filter: Filter = Arc::new(move |ctx: ForwardContext, envelope: Envelope| {
            deferred(&filter, ctx, envelope)
        });
        self.filters.push(RegisteredFilter { action, filter });
        self
    }

    pub fn observe(mut self, observer: impl ForwardingObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn build(self) -> ForwardingEngine {
        ForwardingEngine {
            node_id: self.node_id,
            default_result: self.default_result,
            filters: self.filters,
            observers: self.observers,
            stats: ForwardingStats::default(),
        }
    }
}

async fn call_typed<T, F, Fut>(
    filter: Arc<F>,
    ctx: ForwardContext,
    envelope: Envelope,
) -> anyhow::Result<Option<FilterVerdict>>
where
    T: OcppRequest,
    F: Fn(ForwardContext, T) -> Fut,
    Fut: Future<Output = anyhow::Result<Option<FilterVerdict>>>,
{
    match envelope {
        Envelope::JsonRequest(request) => {
            let typed: T = serde_json::from_value(request.payload)?;
            filter(ctx, typed).await
        }
        _ => Ok(None),
    }
}

pub struct ForwardingEngine {
    node_id: NetworkingNodeId,
    default_result: ForwardingResult,
    filters: Vec<RegisteredFilter>,
    observers: Vec<Arc<dyn ForwardingObserver>>,
    stats: ForwardingStats,
}

impl std::fmt::Debug for ForwardingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingEngine")
            .field("node_id", &self.node_id)
            .field("default_result", &self.default_result)
            .field("filters", &self.filters.len())
            .field("stats", &self.stats)
            .finish()
    }
}

fn action_of(envelope: &Envelope) -> Option<&str> {
    match envelope {
        Envelope::JsonRequest(m) => Some(&m.action),
        Envelope::BinaryRequest(m) => Some(&m.action),
        _ => None,
    }
}

impl ForwardingEngine {
    pub fn builder(node_id: NetworkingNodeId) -> ForwardingEngineBuilder {
        ForwardingEngineBuilder {
            node_id,
            default_result: ForwardingResult::Forward,
            filters: Vec::new(),
            observers: Vec::new(),
        }
    }

    pub fn default_result(&self) -> ForwardingResult {
        self.default_result
    }

    pub fn stats(&self) -> &ForwardingStats {
        &self.stats
    }

    /// Decide FORWARD or DROP for one request addressed to another node.
    pub async fn process(&self, request: Envelope, cancel: CancellationToken) -> ForwardingDecision {
        let action = action_of(&request).unwrap_or_default().to_string();
        let request_id = request.request_id().clone();

        let (decision, source) = if request.network_path().contains(&self.node_id) {
            (
                ForwardingDecision::Drop {
                    response: Outcome::filtered("Routing loop"),
                    reason: format!("{} already on the network path", self.node_id),
                    request,
                },
                DecisionSource::LoopGuard,
            )
        } else {
            self.run_filters(request, &action, cancel).await
        };

        match &decision {
            ForwardingDecision::Forward { .. } => self.stats.forwarded.fetch_add(1, Ordering::Relaxed),
            ForwardingDecision::Drop { .. } => self.stats.dropped.fetch_add(1, Ordering::Relaxed),
        };

        let event = ForwardingEvent {
            timestamp: Utc::now(),
            request_id,
            action,
            destination: decision.request().destination().cloned(),
            network_path: decision.request().network_path().clone(),
            result: decision.result(),
            reason: decision.reason().map(str::to_string),
            source,
        };
        info!(
            request_id = %event.request_id,
            action = %event.action,
            destination = ?event.destination.as_ref().map(|d| d.to_string()),
            hops = %event.network_path,
            result = %event.result,
            source = %event.source,
            reason = ?event.reason,
            "forwarding decision"
        );
        hooks::notify(&self.observers, event).await;

        decision
    }

    async fn run_filters(
        &self,
        request: Envelope,
        action: &str,
        cancel: CancellationToken,
    ) -> (ForwardingDecision, DecisionSource) {
        let ctx = ForwardContext {
            node_id: self.node_id.clone(),
            action: action.to_string(),
            destination: request.destination().cloned(),
            cancel,
        };
        let invocations: Vec<Invocation<FilterVerdict>> = self
            .filters
            .iter()
            .filter(|f| f.action.as_deref().map_or(true, |a| a == action))
            .map(|f| (f.filter)(ctx.clone(), request.clone()))
            .collect();

        match first_answer(action, request.request_id(), invocations).await {
            Some(Outcome::Response(verdict)) => {
                let decision = match verdict.result {
                    ForwardingResult::Forward => ForwardingDecision::Forward {
                        request,
                        reason: verdict.reason,
                    },
                    ForwardingResult::Drop => ForwardingDecision::Drop {
                        request,
                        response: verdict
                            .response
                            .unwrap_or_else(|| Outcome::filtered(DEFAULT_HANDLER)),
                        reason: verdict.reason.unwrap_or_else(|| DEFAULT_HANDLER.to_string()),
                    },
                };
                (decision, DecisionSource::Filter)
            }
            Some(failure) => (
                ForwardingDecision::Drop {
                    request,
                    reason: format!("filter failed: {}", failure.kind()),
                    response: failure.map(|_| Value::Null),
                },
                DecisionSource::FilterError,
            ),
            None => {
                let decision = match self.default_result {
                    ForwardingResult::Forward => ForwardingDecision::Forward {
                        request,
                        reason: None,
                    },
                    ForwardingResult::Drop => ForwardingDecision::Drop {
                        request,
                        response: Outcome::filtered(DEFAULT_HANDLER),
                        reason: DEFAULT_HANDLER.to_string(),
                    },
                };
                (decision, DecisionSource::Default)
            }
        }
    }
}
