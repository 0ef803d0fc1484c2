//! Networking node
//!
//! Ties the envelope codec, the routing table, the dispatcher, the forwarding
//! engine and the correlation table together. Requests addressed to this
//! node are dispatched locally; requests for other nodes are verified, run
//! through the forwarding engine and either relayed (with this node appended
//! to the network path and the payload re-signed) or answered with the drop
//! response. A relayed CALL leaves under a RequestId of this node's choosing
//! so ids from different origins never collide upstream; its answer is
//! accepted only from the connection it was relayed on and travels back,
//! under the origin's id, on the connection the request arrived on.

pub mod builtin;
pub mod sink;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::correlation::{self, CompletionHandle, CorrelationOutcome, CorrelationTable};
use crate::dispatch::{Dispatcher, Outcome};
use crate::envelope::{
    BinaryRequestMessage, BinaryResponseMessage, Envelope, ErrorMessage, JsonRequestMessage,
    JsonResponseMessage, WireFrame,
};
use crate::forwarding::{ForwardingDecision, ForwardingEngine, ForwardingResult};
use crate::ocpp::{ErrorCode, NetworkPath, NetworkingNodeId, OcppRequest, RequestId};
use crate::signatures;

pub use builtin::NodeRole;
pub use sink::{ChannelSink, ConnectionId, FrameSink, MessageSink};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no route towards {0}")]
    NoRoute(NetworkingNodeId),

    #[error("no uplink configured")]
    NoUplink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeOptions {
    /// Default wait for requests this node originates
    pub request_timeout: Duration,
    /// Wait for answers to requests relayed on behalf of another node
    pub relay_timeout: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            relay_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot reported by the admin API
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: String,
    pub pending_correlations: usize,
    pub routes: Vec<String>,
    pub has_uplink: bool,
    pub handled_actions: Vec<String>,
    pub default_forwarding: ForwardingResult,
    pub forwarded: u64,
    pub dropped: u64,
}

pub struct NetworkingNode {
    id: NetworkingNodeId,
    dispatcher: Arc<Dispatcher>,
    forwarding: Arc<ForwardingEngine>,
    correlations: CorrelationTable,
    routes: RwLock<HashMap<NetworkingNodeId, Arc<dyn MessageSink>>>,
    uplink: RwLock<Option<Arc<dyn MessageSink>>>,
    options: NodeOptions,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for NetworkingNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkingNode")
            .field("id", &self.id)
            .field("routes", &self.routes.read().len())
            .field("pending", &self.correlations.pending_count())
            .field("options", &self.options)
            .finish()
    }
}

impl NetworkingNode {
    pub fn new(dispatcher: Dispatcher, forwarding: ForwardingEngine, options: NodeOptions) -> Arc<Self> {
        Arc::new(Self {
            id: dispatcher.node_id().clone(),
            dispatcher: Arc::new(dispatcher),
            forwarding: Arc::new(forwarding),
            correlations: CorrelationTable::new(),
            routes: RwLock::new(HashMap::new()),
            uplink: RwLock::new(None),
            options,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &NetworkingNodeId {
        &self.id
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn forwarding(&self) -> &ForwardingEngine {
        &self.forwarding
    }

    pub fn correlations(&self) -> &CorrelationTable {
        &self.correlations
    }

    pub fn options(&self) -> NodeOptions {
        self.options
    }

    /// Route messages addressed to `peer` through `sink`.
    pub fn connect(&self, peer: NetworkingNodeId, sink: Arc<dyn MessageSink>) {
        info!(node = %self.id, peer = %peer, "route added");
        self.routes.write().insert(peer, sink);
    }

    pub fn disconnect(&self, peer: &NetworkingNodeId) -> bool {
        let removed = self.routes.write().remove(peer).is_some();
        if removed {
            info!(node = %self.id, peer = %peer, "route removed");
        }
        removed
    }

    pub fn has_route(&self, peer: &NetworkingNodeId) -> bool {
        self.routes.read().contains_key(peer)
    }

    /// Route used for destinations without an explicit entry.
    pub fn set_uplink(&self, sink: Arc<dyn MessageSink>) {
        *self.uplink.write() = Some(sink);
    }

    pub fn route(&self, destination: Option<&NetworkingNodeId>) -> Result<Arc<dyn MessageSink>, RoutingError> {
        if let Some(sink) = destination.and_then(|d| self.routes.read().get(d).cloned()) {
            return Ok(sink);
        }
        match (self.uplink.read().clone(), destination) {
            (Some(uplink), _) => Ok(uplink),
            (None, Some(destination)) => Err(RoutingError::NoRoute(destination.clone())),
            (None, None) => Err(RoutingError::NoUplink),
        }
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        correlation::spawn_expiry_sweeper(self.correlations.clone(), every, self.shutdown.child_token())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel in-flight handlers and stop the sweeper.
    pub fn shutdown(&self) {
        info!(node = %self.id, pending = self.correlations.pending_count(), "networking node shutting down");
        self.shutdown.cancel();
    }

    pub fn status(&self) -> NodeStatus {
        let mut routes: Vec<String> = self.routes.read().keys().map(ToString::to_string).collect();
        routes.sort();
        NodeStatus {
            node_id: self.id.to_string(),
            pending_correlations: self.correlations.pending_count(),
            routes,
            has_uplink: self.uplink.read().is_some(),
            handled_actions: self.dispatcher.handled_actions(),
            default_forwarding: self.forwarding.default_result(),
            forwarded: self.forwarding.stats().forwarded(),
            dropped: self.forwarding.stats().dropped(),
        }
    }

    /// Handle one inbound frame on its own task.
    pub fn spawn_frame(self: &Arc<Self>, from: Arc<dyn MessageSink>, frame: WireFrame) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move { node.handle_frame(from, frame).await })
    }

    pub async fn handle_frame(self: &Arc<Self>, from: Arc<dyn MessageSink>, frame: WireFrame) {
        match Envelope::decode(&frame) {
            Ok(envelope) => self.handle_envelope(from, envelope).await,
            Err(e) => {
                warn!(node = %self.id, error = %e, "undecodable frame");
                let error = e.to_request_error();
                let reply = match frame {
                    WireFrame::Text(_) => Envelope::JsonRequestError(error),
                    WireFrame::Binary(_) => Envelope::BinaryRequestError(error),
                };
                self.send_to(from.as_ref(), reply).await;
            }
        }
    }

    pub async fn handle_envelope(self: &Arc<Self>, from: Arc<dyn MessageSink>, envelope: Envelope) {
        if !envelope.is_request() {
            self.correlations.resolve_from(from.connection_id(), envelope);
            return;
        }

        let local = envelope.destination().map_or(true, |d| d == &self.id);
        if !local {
            self.forward(from, envelope).await;
            return;
        }

        let cancel = self.shutdown.child_token();
        match envelope {
            Envelope::JsonRequest(request) => {
                self.dispatcher.dispatch(request, from.as_ref(), cancel).await;
            }
            Envelope::BinaryRequest(request) => {
                self.dispatcher
                    .dispatch_binary(request, from.as_ref(), cancel)
                    .await;
            }
            _ => {}
        }
    }

    async fn forward(self: &Arc<Self>, from: Arc<dyn MessageSink>, request: Envelope) {
        let policy = self.dispatcher.signature_policy();
        if let Err(e) = signatures::verify_envelope(policy.as_ref(), &request).await {
            warn!(
                node = %self.id,
                request_id = %request.request_id(),
                hops = %request.network_path(),
                error = %e,
                "not forwarding message with invalid signature"
            );
            let outcome = Outcome::SignatureError {
                reason: e.to_string(),
            };
            self.answer_origin(from.as_ref(), &request, outcome).await;
            return;
        }

        match self.forwarding.process(request, self.shutdown.child_token()).await {
            ForwardingDecision::Forward { request, .. } => self.relay(from, request).await,
            ForwardingDecision::Drop {
                request, response, ..
            } => self.answer_origin(from.as_ref(), &request, response).await,
        }
    }

    async fn relay(self: &Arc<Self>, from: Arc<dyn MessageSink>, request: Envelope) {
        let request_id = request.request_id().clone();
        let destination = request.destination().cloned();

        let route = match self.route(destination.as_ref()) {
            Ok(route) => route,
            Err(e) => {
                warn!(node = %self.id, request_id = %request_id, error = %e, "cannot relay");
                let outcome = Outcome::rejected(ErrorCode::GenericError, e.to_string());
                self.answer_origin(from.as_ref(), &request, outcome).await;
                return;
            }
        };

        let (action, expects_response) = match &request {
            Envelope::JsonRequest(m) => (m.action.clone(), m.expects_response),
            Envelope::BinaryRequest(m) => (m.action.clone(), true),
            _ => return,
        };

        // SEND is never answered, so it keeps the origin's id
        let relay_id = if expects_response {
            RequestId::new_random()
        } else {
            request_id.clone()
        };
        let policy = self.dispatcher.signature_policy();
        let relayed = request.relayed_by(&self.id).with_request_id(relay_id.clone());
        let relayed = match signatures::sign_envelope(policy.as_ref(), relayed).await {
            Ok(relayed) => relayed,
            Err(e) => {
                warn!(node = %self.id, request_id = %request_id, error = %e, "re-signing relayed message failed");
                let outcome = Outcome::exception(format!("re-signing failed: {e}"));
                self.answer_origin(from.as_ref(), &request, outcome).await;
                return;
            }
        };

        if !expects_response {
            if let Err(e) = route.send(relayed).await {
                warn!(node = %self.id, request_id = %request_id, error = %e, "relaying SEND failed");
            }
            return;
        }

        let handle = match self.correlations.register_on(
            route.connection_id(),
            relay_id.clone(),
            action.as_str(),
            destination.clone(),
            self.options.relay_timeout,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(node = %self.id, request_id = %request_id, error = %e, "cannot track relayed request");
                let outcome = Outcome::rejected(ErrorCode::GenericError, e.to_string());
                self.answer_origin(from.as_ref(), &request, outcome).await;
                return;
            }
        };

        let node = Arc::clone(self);
        let origin = request.clone();
        tokio::spawn(async move { node.relay_answer(from, origin, handle).await });

        debug!(
            node = %self.id,
            request_id = %request_id,
            relay_id = %relay_id,
            action = %action,
            hops = %relayed.network_path(),
            "relaying request"
        );
        if let Err(e) = route.send(relayed).await {
            warn!(node = %self.id, request_id = %request_id, error = %e, "relaying request failed");
            let description = format!(
                "Forwarding to {} failed: {e}",
                destination.as_ref().map_or("uplink".to_string(), ToString::to_string)
            );
            let error = ErrorMessage::answering(&relay_id, request.network_path(), ErrorCode::GenericError, description);
            let error = if request.is_binary() {
                Envelope::BinaryRequestError(error)
            } else {
                Envelope::JsonRequestError(error)
            };
            self.correlations.resolve(error);
        }
    }

    /// Deliver the answer to a relayed request, or the timeout, to its origin.
    async fn relay_answer(self: Arc<Self>, from: Arc<dyn MessageSink>, request: Envelope, handle: CompletionHandle) {
        let answer = match handle.wait().await {
            CorrelationOutcome::Answered(answer) => answer,
            CorrelationOutcome::TimedOut { after } => {
                self.answer_origin(from.as_ref(), &request, Outcome::Timeout { after })
                    .await;
                return;
            }
        };

        let policy = self.dispatcher.signature_policy();
        if let Err(e) = signatures::verify_envelope(policy.as_ref(), &answer).await {
            warn!(node = %self.id, request_id = %answer.request_id(), error = %e, "relayed answer has an invalid signature");
            let outcome = Outcome::SignatureError {
                reason: e.to_string(),
            };
            self.answer_origin(from.as_ref(), &request, outcome).await;
            return;
        }

        let answer = answer
            .relayed_by(&self.id)
            .with_request_id(request.request_id().clone());
        match signatures::sign_envelope(policy.as_ref(), answer).await {
            Ok(answer) => self.send_to(from.as_ref(), answer).await,
            Err(e) => {
                let outcome = Outcome::exception(format!("re-signing failed: {e}"));
                self.answer_origin(from.as_ref(), &request, outcome).await;
            }
        }
    }

    /// Answer `request` on this node's behalf (drop responses, relay failures).
    async fn answer_origin(&self, from: &dyn MessageSink, request: &Envelope, outcome: Outcome<Value>) {
        let path = NetworkPath::from_source(self.id.clone());
        let reply = match request {
            Envelope::JsonRequest(r) if !r.expects_response => {
                debug!(node = %self.id, request_id = %r.request_id, outcome = outcome.kind(), "SEND not answered");
                return;
            }
            Envelope::JsonRequest(r) => match outcome.as_reply(&r.request_id, &r.network_path) {
                Ok(payload) => Envelope::JsonResponse(
                    JsonResponseMessage::answering(r, payload.clone()).with_path(path),
                ),
                Err(error) => Envelope::JsonRequestError(error.with_path(path)),
            },
            Envelope::BinaryRequest(r) => {
                let outcome = outcome.and_then(|payload| match serde_json::to_vec(&payload) {
                    Ok(bytes) => Outcome::Response(bytes),
                    Err(e) => Outcome::exception(format!("encoding the answer failed: {e}")),
                });
                binary_answer(r, outcome, path)
            }
            _ => return,
        };

        let policy = self.dispatcher.signature_policy();
        let reply = match signatures::sign_envelope(policy.as_ref(), reply.clone()).await {
            Ok(signed) => signed,
            Err(e) => {
                warn!(node = %self.id, request_id = %reply.request_id(), error = %e, "signing the answer failed, sending it unsigned");
                reply
            }
        };
        self.send_to(from, reply).await;
    }

    async fn send_to(&self, sink: &dyn MessageSink, envelope: Envelope) {
        let request_id = envelope.request_id().clone();
        let kind = envelope.kind();
        if let Err(e) = sink.send(envelope).await {
            warn!(node = %self.id, request_id = %request_id, kind, error = %e, "failed to send");
        }
    }

    /// Send a typed request and wait for its outcome.
    ///
    /// `destination` of `None` sends a plain (unrouted) request on the uplink.
    pub async fn send_request<T: OcppRequest>(
        &self,
        destination: Option<NetworkingNodeId>,
        request: &T,
        timeout: Option<Duration>,
    ) -> Outcome<T::Response> {
        let payload = match serde_json::to_value(request) {
            Ok(payload) => payload,
            Err(e) => return Outcome::exception(e),
        };
        let message = self.addressed(
            JsonRequestMessage::new(RequestId::new_random(), T::ACTION, payload),
            destination,
        );

        self.call(Envelope::JsonRequest(message), timeout)
            .await
            .and_then(|answer| match answer {
                Envelope::JsonResponse(response) => match response.parse_payload::<T::Response>(T::ACTION) {
                    Ok(parsed) => Outcome::Response(parsed),
                    Err(e) => {
                        let error = e.to_request_error();
                        Outcome::Rejected {
                            code: error.error_code,
                            description: error.description,
                            details: error.details,
                        }
                    }
                },
                other => answer_error(other),
            })
    }

    /// Send a typed SEND message; nothing comes back.
    pub async fn send_unconfirmed<T: OcppRequest>(
        &self,
        destination: Option<NetworkingNodeId>,
        request: &T,
    ) -> anyhow::Result<()> {
        let message = self.addressed(
            JsonRequestMessage::send(RequestId::new_random(), T::ACTION, serde_json::to_value(request)?),
            destination,
        );
        let route = self.route(message.destination.as_ref())?;
        let policy = self.dispatcher.signature_policy();
        let envelope = signatures::sign_envelope(policy.as_ref(), Envelope::JsonRequest(message)).await?;
        route.send(envelope).await
    }

    pub async fn send_binary(
        &self,
        destination: Option<NetworkingNodeId>,
        action: &str,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Outcome<Vec<u8>> {
        let mut message = BinaryRequestMessage::new(RequestId::new_random(), action, payload);
        if let Some(destination) = destination {
            message = message
                .to(destination)
                .with_path(NetworkPath::from_source(self.id.clone()));
        }

        self.call(Envelope::BinaryRequest(message), timeout)
            .await
            .and_then(|answer| match answer {
                Envelope::BinaryResponse(response) => Outcome::Response(response.payload),
                other => answer_error(other),
            })
    }

    fn addressed(&self, message: JsonRequestMessage, destination: Option<NetworkingNodeId>) -> JsonRequestMessage {
        match destination {
            Some(destination) => message
                .to(destination)
                .with_path(NetworkPath::from_source(self.id.clone())),
            None => message,
        }
    }

    /// Sign, register, transmit and wait; yields the raw answer envelope.
    async fn call(&self, request: Envelope, timeout: Option<Duration>) -> Outcome<Envelope> {
        let request_id = request.request_id().clone();
        let destination = request.destination().cloned();
        let action = match &request {
            Envelope::JsonRequest(m) => m.action.clone(),
            Envelope::BinaryRequest(m) => m.action.clone(),
            other => return Outcome::exception(format!("{} is not a request", other.kind())),
        };

        let route = match self.route(destination.as_ref()) {
            Ok(route) => route,
            Err(e) => return Outcome::rejected(ErrorCode::GenericError, e.to_string()),
        };

        let policy = self.dispatcher.signature_policy();
        let request = match signatures::sign_envelope(policy.as_ref(), request).await {
            Ok(request) => request,
            Err(e) => return Outcome::exception(format!("signing failed: {e}")),
        };

        let timeout = timeout.unwrap_or(self.options.request_timeout);
        let handle = match self.correlations.register_on(
            route.connection_id(),
            request_id.clone(),
            action.as_str(),
            destination,
            timeout,
        ) {
            Ok(handle) => handle,
            Err(e) => return Outcome::rejected(ErrorCode::GenericError, e.to_string()),
        };

        debug!(node = %self.id, request_id = %request_id, action = %action, "sending request");
        if let Err(e) = route.send(request).await {
            self.correlations.abandon(&request_id);
            return Outcome::exception(format!("sending failed: {e}"));
        }

        match handle.wait().await {
            CorrelationOutcome::Answered(answer) => {
                match signatures::verify_envelope(policy.as_ref(), &answer).await {
                    Ok(()) => Outcome::Response(answer),
                    Err(e) => {
                        warn!(node = %self.id, request_id = %request_id, error = %e, "answer has an invalid signature");
                        Outcome::SignatureError {
                            reason: e.to_string(),
                        }
                    }
                }
            }
            CorrelationOutcome::TimedOut { after } => Outcome::Timeout { after },
        }
    }
}

/// Binary answer from this node to `request`.
fn binary_answer(request: &BinaryRequestMessage, outcome: Outcome<Vec<u8>>, path: NetworkPath) -> Envelope {
    match outcome.as_reply(&request.request_id, &request.network_path) {
        Ok(payload) => {
            let mut response = BinaryResponseMessage::answering(request, payload.clone());
            response.network_path = path;
            Envelope::BinaryResponse(response)
        }
        Err(error) => Envelope::BinaryRequestError(error.with_path(path)),
    }
}

fn answer_error<R>(answer: Envelope) -> Outcome<R> {
    match answer {
        Envelope::JsonRequestError(e)
        | Envelope::JsonResponseError(e)
        | Envelope::BinaryRequestError(e)
        | Envelope::BinaryResponseError(e) => Outcome::from(&e),
        other => Outcome::exception(format!("unexpected answer of kind {}", other.kind())),
    }
}
