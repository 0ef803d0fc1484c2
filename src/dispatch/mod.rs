//! Dispatch / fan-out engine
//!
//! One parsed request goes through
//! `Received -> SignatureChecked -> HandlersInvoked -> ResponseChosen -> Signed -> Sent`.
//! Every handler registered for the action runs concurrently; the dispatcher
//! waits for all of them and answers with the first non-`None` result in
//! registration order. A CALL is answered exactly once whatever happens.

pub mod fanout;
pub mod hooks;
pub mod outcome;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::{
    BinaryRequestMessage, BinaryResponseMessage, DecodeError, Envelope, JsonRequestMessage,
    JsonResponseMessage,
};
use crate::node::MessageSink;
use crate::ocpp::{ErrorCode, MessageCatalog, NetworkPath, NetworkingNodeId, OcppRequest, RequestId};
use crate::signatures::{self, SignaturePolicy, Unsigned};

pub use fanout::{deferred, first_answer, Invocation};
pub use hooks::{DispatchEvent, DispatchObserver, DispatchStage};
pub use outcome::{Outcome, DEFAULT_HANDLER};

/// Per-request information handed to every handler
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub action: String,
    pub source: Option<NetworkingNodeId>,
    pub network_path: NetworkPath,
    /// Handlers should return promptly once this fires; they are never aborted.
    pub cancel: CancellationToken,
}

impl RequestContext {
    fn new(request_id: &RequestId, action: &str, path: &NetworkPath, cancel: CancellationToken) -> Self {
        Self {
            request_id: request_id.clone(),
            action: action.to_string(),
            source: path.source().cloned(),
            network_path: path.clone(),
            cancel,
        }
    }
}

type JsonHandler = Arc<dyn Fn(RequestContext, Value) -> Invocation<Value> + Send + Sync>;
type BinaryHandler = Arc<dyn Fn(RequestContext, Vec<u8>) -> Invocation<Vec<u8>> + Send + Sync>;

/// A request run through every stage except sending
#[derive(Debug, Clone, PartialEq)]
pub struct Processed<R> {
    pub outcome: Outcome<R>,
    /// `None` for SEND messages
    pub reply: Option<Envelope>,
}

pub struct DispatcherBuilder {
    node_id: NetworkingNodeId,
    catalog: Arc<MessageCatalog>,
    json_handlers: HashMap<String, Vec<JsonHandler>>,
    binary_handlers: HashMap<String, Vec<BinaryHandler>>,
    observers: Vec<Arc<dyn DispatchObserver>>,
    signatures: Arc<dyn SignaturePolicy>,
}

impl DispatcherBuilder {
    /// Typed handler for `T::ACTION`; `Ok(None)` means "not answering".
    pub fn on<T, F, Fut>(self, handler: F) -> Self
    where
        T: OcppRequest,
        F: Fn(RequestContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<T::Response>>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_json(T::ACTION, move |ctx, payload| {
            call_typed::<T, F, Fut>(handler.clone(), ctx, payload)
        })
    }

    /// Untyped handler working on the raw payload.
    pub fn on_json<F, Fut>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: JsonHandler = Arc::new(move |ctx: RequestContext, payload: Value| {
            deferred(&handler, ctx, payload)
        });
        self.json_handlers
            .entry(action.into())
            .or_default()
            .push(erased);
        self
    }

    pub fn on_binary<F, Fut>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RequestContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Vec<u8>>>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: BinaryHandler = Arc::new(move |ctx: RequestContext, payload: Vec<u8>| {
            deferred(&handler, ctx, payload)
        });
        self.binary_handlers
            .entry(action.into())
            .or_default()
            .push(erased);
        self
    }

    pub fn observe(mut self, observer: impl DispatchObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn signatures(mut self, policy: Arc<dyn SignaturePolicy>) -> Self {
        self.signatures = policy;
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            node_id: self.node_id,
            catalog: self.catalog,
            json_handlers: self.json_handlers,
            binary_handlers: self.binary_handlers,
            observers: self.observers,
            signatures: self.signatures,
        }
    }
}

async fn call_typed<T, F, Fut>(
    handler: Arc<F>,
    ctx: RequestContext,
    payload: Value,
) -> anyhow::Result<Option<Value>>
where
    T: OcppRequest,
    F: Fn(RequestContext, T) -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T::Response>>>,
{
    let request: T = serde_json::from_value(payload)?;
    match handler(ctx, request).await? {
        Some(response) => Ok(Some(serde_json::to_value(response)?)),
        None => Ok(None),
    }
}

/// Handler registry, fixed at build time, plus the state machine driving it
pub struct Dispatcher {
    node_id: NetworkingNodeId,
    catalog: Arc<MessageCatalog>,
    json_handlers: HashMap<String, Vec<JsonHandler>>,
    binary_handlers: HashMap<String, Vec<BinaryHandler>>,
    observers: Vec<Arc<dyn DispatchObserver>>,
    signatures: Arc<dyn SignaturePolicy>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("node_id", &self.node_id)
            .field("actions", &self.handled_actions())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl Dispatcher {
    pub fn builder(node_id: NetworkingNodeId, catalog: Arc<MessageCatalog>) -> DispatcherBuilder {
        DispatcherBuilder {
            node_id,
            catalog,
            json_handlers: HashMap::new(),
            binary_handlers: HashMap::new(),
            observers: Vec::new(),
            signatures: Arc::new(Unsigned),
        }
    }

    pub fn node_id(&self) -> &NetworkingNodeId {
        &self.node_id
    }

    pub fn catalog(&self) -> &MessageCatalog {
        &self.catalog
    }

    pub fn signature_policy(&self) -> Arc<dyn SignaturePolicy> {
        self.signatures.clone()
    }

    /// Actions with at least one handler, sorted.
    pub fn handled_actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self
            .json_handlers
            .keys()
            .chain(self.binary_handlers.keys())
            .cloned()
            .collect();
        actions.sort();
        actions.dedup();
        actions
    }

    pub fn handler_count(&self, action: &str) -> usize {
        self.json_handlers.get(action).map_or(0, Vec::len)
            + self.binary_handlers.get(action).map_or(0, Vec::len)
    }

    async fn emit(&self, stage: DispatchStage, ctx: &RequestContext, outcome: Option<&'static str>) {
        hooks::notify(
            &self.observers,
            DispatchEvent {
                stage,
                timestamp: Utc::now(),
                request_id: ctx.request_id.clone(),
                action: ctx.action.clone(),
                source: ctx.source.clone(),
                outcome,
            },
        )
        .await;
    }

    /// Path stamped on replies: this node for routed requests, empty otherwise.
    fn reply_path(&self, routed: bool) -> NetworkPath {
        if routed {
            NetworkPath::from_source(self.node_id.clone())
        } else {
            NetworkPath::empty()
        }
    }

    /// Run a JSON request through every stage except sending.
    pub async fn process(&self, request: &JsonRequestMessage, cancel: CancellationToken) -> Processed<Value> {
        let ctx = RequestContext::new(&request.request_id, &request.action, &request.network_path, cancel);
        self.emit(DispatchStage::RequestReceived, &ctx, None).await;

        let outcome = self.choose_json(request, &ctx).await;
        self.emit(DispatchStage::ResponseChosen, &ctx, Some(outcome.kind()))
            .await;

        if !request.expects_response {
            debug!(request_id = %ctx.request_id, action = %ctx.action, outcome = outcome.kind(), "SEND processed, no reply");
            return Processed { outcome, reply: None };
        }

        match signatures::sign_envelope(self.signatures.as_ref(), self.json_reply(request, &outcome)).await {
            Ok(reply) => Processed {
                outcome,
                reply: Some(reply),
            },
            Err(e) => {
                warn!(request_id = %ctx.request_id, action = %ctx.action, error = %e, "signing the response failed");
                let outcome = Outcome::exception(format!("response signing failed: {e}"));
                let reply = self.json_reply(request, &outcome);
                Processed {
                    outcome,
                    reply: Some(reply),
                }
            }
        }
    }

    async fn choose_json(&self, request: &JsonRequestMessage, ctx: &RequestContext) -> Outcome<Value> {
        let handlers = self.json_handlers.get(&request.action);
        let entry = self.catalog.get(&request.action);

        if entry.is_none() && handlers.is_none() {
            info!(request_id = %ctx.request_id, action = %ctx.action, "unknown action");
            return Outcome::rejected(
                ErrorCode::NotImplemented,
                format!("Unknown action '{}'", request.action),
            );
        }

        if let Some(Err(reason)) = entry.map(|e| e.validate_request(&request.payload)) {
            let error = DecodeError::could_not_parse(
                Some(request.request_id.clone()),
                Some(request.action.clone()),
                reason,
            )
            .to_request_error();
            info!(request_id = %ctx.request_id, action = %ctx.action, reason = %error.details["reason"], "payload rejected");
            return Outcome::Rejected {
                code: error.error_code,
                description: error.description,
                details: error.details,
            };
        }

        let envelope = Envelope::JsonRequest(request.clone());
        if let Err(e) = signatures::verify_envelope(self.signatures.as_ref(), &envelope).await {
            return Outcome::SignatureError {
                reason: e.to_string(),
            };
        }
        self.emit(DispatchStage::RequestValidated, ctx, None).await;

        let invocations: Vec<Invocation<Value>> = handlers
            .into_iter()
            .flatten()
            .map(|handler| handler(ctx.clone(), request.payload.clone()))
            .collect();
        let registered = invocations.len();

        match first_answer(&request.action, &request.request_id, invocations).await {
            Some(outcome) => outcome,
            None if registered == 0 => {
                Outcome::failed(format!("No handler registered for '{}'", request.action))
            }
            None => Outcome::failed(format!(
                "None of the {registered} handlers for '{}' answered",
                request.action
            )),
        }
    }

    fn json_reply(&self, request: &JsonRequestMessage, outcome: &Outcome<Value>) -> Envelope {
        let path = self.reply_path(request.is_routed());
        match outcome.as_reply(&request.request_id, &request.network_path) {
            Ok(payload) => Envelope::JsonResponse(
                JsonResponseMessage::answering(request, payload.clone()).with_path(path),
            ),
            Err(error) => Envelope::JsonRequestError(error.with_path(path)),
        }
    }

    /// Process `request` and send its reply (if any) through `reply_to`.
    pub async fn dispatch(
        &self,
        request: JsonRequestMessage,
        reply_to: &dyn MessageSink,
        cancel: CancellationToken,
    ) -> Outcome<Value> {
        let processed = self.process(&request, cancel.clone()).await;
        if let Some(reply) = processed.reply {
            let ctx = RequestContext::new(&request.request_id, &request.action, &request.network_path, cancel);
            self.send_reply(&ctx, reply, reply_to).await;
        }
        processed.outcome
    }

    /// Binary counterpart of [`Dispatcher::process`]. Binary envelopes carry no
    /// envelope-level signatures, so the signature stages are skipped.
    pub async fn process_binary(
        &self,
        request: &BinaryRequestMessage,
        cancel: CancellationToken,
    ) -> Processed<Vec<u8>> {
        let ctx = RequestContext::new(&request.request_id, &request.action, &request.network_path, cancel);
        self.emit(DispatchStage::RequestReceived, &ctx, None).await;

        let handlers = self.binary_handlers.get(&request.action);
        let known = handlers.is_some()
            || self
                .catalog
                .get(&request.action)
                .is_some_and(|entry| entry.binary);

        let outcome = if known {
            self.emit(DispatchStage::RequestValidated, &ctx, None).await;
            let invocations: Vec<Invocation<Vec<u8>>> = handlers
                .into_iter()
                .flatten()
                .map(|handler| handler(ctx.clone(), request.payload.clone()))
                .collect();
            first_answer(&request.action, &request.request_id, invocations)
                .await
                .unwrap_or_else(|| Outcome::failed(format!("No handler answered '{}'", request.action)))
        } else {
            info!(request_id = %ctx.request_id, action = %ctx.action, "unknown binary action");
            Outcome::rejected(
                ErrorCode::NotImplemented,
                format!("Unknown binary action '{}'", request.action),
            )
        };
        self.emit(DispatchStage::ResponseChosen, &ctx, Some(outcome.kind()))
            .await;

        let routed = request.destination.is_some() || !request.network_path.is_empty();
        let path = self.reply_path(routed);
        let reply = match outcome.as_reply(&request.request_id, &request.network_path) {
            Ok(payload) => {
                let mut response = BinaryResponseMessage::answering(request, payload.clone());
                response.network_path = path;
                Envelope::BinaryResponse(response)
            }
            Err(error) => Envelope::BinaryRequestError(error.with_path(path)),
        };

        Processed {
            outcome,
            reply: Some(reply),
        }
    }

    pub async fn dispatch_binary(
        &self,
        request: BinaryRequestMessage,
        reply_to: &dyn MessageSink,
        cancel: CancellationToken,
    ) -> Outcome<Vec<u8>> {
        let processed = self.process_binary(&request, cancel.clone()).await;
        if let Some(reply) = processed.reply {
            let ctx = RequestContext::new(&request.request_id, &request.action, &request.network_path, cancel);
            self.send_reply(&ctx, reply, reply_to).await;
        }
        processed.outcome
    }

    async fn send_reply(&self, ctx: &RequestContext, reply: Envelope, reply_to: &dyn MessageSink) {
        let kind = reply.kind();
        if let Err(e) = reply_to.send(reply).await {
            warn!(request_id = %ctx.request_id, action = %ctx.action, error = %e, "failed to send reply");
            return;
        }
        self.emit(DispatchStage::ResponseSent, ctx, Some(kind)).await;
    }
}
