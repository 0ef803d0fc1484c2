//! Envelope codec
//!
//! An envelope wraps one message payload with its RequestId, optional
//! destination, the network path it has travelled and (inside the payload)
//! its signatures. Envelopes are built at the sending boundary, consumed once
//! at the receiving boundary and never mutated in between; relaying produces
//! a new envelope.

pub mod error;
pub mod json;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::binary::{self, BinaryError, BinaryFormat};
use crate::ocpp::{ErrorCode, NetworkPath, NetworkingNodeId, RequestId, Signature};

pub use error::DecodeError;

/// Raw WebSocket frame contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Every envelope kind the protocol exchanges
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    JsonRequest(JsonRequestMessage),
    JsonResponse(JsonResponseMessage),
    JsonRequestError(ErrorMessage),
    JsonResponseError(ErrorMessage),
    BinaryRequest(BinaryRequestMessage),
    BinaryResponse(BinaryResponseMessage),
    BinaryRequestError(ErrorMessage),
    BinaryResponseError(ErrorMessage),
}

impl Envelope {
    /// Decode a frame as received from the transport.
    pub fn decode(frame: &WireFrame) -> Result<Self, DecodeError> {
        match frame {
            WireFrame::Text(text) => json::decode(text),
            WireFrame::Binary(bytes) => Ok(binary::decode_envelope(bytes)?),
        }
    }

    /// Encode for the transport; binary kinds use the Extensible layout.
    pub fn encode(&self) -> Result<WireFrame, BinaryError> {
        self.encode_with(BinaryFormat::Extensible)
    }

    pub fn encode_with(&self, format: BinaryFormat) -> Result<WireFrame, BinaryError> {
        match json::encode(self) {
            Some(text) => Ok(WireFrame::Text(text)),
            None => Ok(WireFrame::Binary(binary::encode_envelope(self, format)?)),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::JsonRequest(m) => &m.request_id,
            Self::JsonResponse(m) => &m.request_id,
            Self::BinaryRequest(m) => &m.request_id,
            Self::BinaryResponse(m) => &m.request_id,
            Self::JsonRequestError(m)
            | Self::JsonResponseError(m)
            | Self::BinaryRequestError(m)
            | Self::BinaryResponseError(m) => &m.request_id,
        }
    }

    pub fn destination(&self) -> Option<&NetworkingNodeId> {
        match self {
            Self::JsonRequest(m) => m.destination.as_ref(),
            Self::JsonResponse(m) => m.destination.as_ref(),
            Self::BinaryRequest(m) => m.destination.as_ref(),
            Self::BinaryResponse(m) => m.destination.as_ref(),
            Self::JsonRequestError(m)
            | Self::JsonResponseError(m)
            | Self::BinaryRequestError(m)
            | Self::BinaryResponseError(m) => m.destination.as_ref(),
        }
    }

    pub fn network_path(&self) -> &NetworkPath {
        match self {
            Self::JsonRequest(m) => &m.network_path,
            Self::JsonResponse(m) => &m.network_path,
            Self::BinaryRequest(m) => &m.network_path,
            Self::BinaryResponse(m) => &m.network_path,
            Self::JsonRequestError(m)
            | Self::JsonResponseError(m)
            | Self::BinaryRequestError(m)
            | Self::BinaryResponseError(m) => &m.network_path,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            Self::BinaryRequest(_)
                | Self::BinaryResponse(_)
                | Self::BinaryRequestError(_)
                | Self::BinaryResponseError(_)
        )
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Self::JsonRequest(_) | Self::BinaryRequest(_))
    }

    /// Short kind label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JsonRequest(_) => "JSONRequest",
            Self::JsonResponse(_) => "JSONResponse",
            Self::JsonRequestError(_) => "JSONRequestError",
            Self::JsonResponseError(_) => "JSONResponseError",
            Self::BinaryRequest(_) => "BinaryRequest",
            Self::BinaryResponse(_) => "BinaryResponse",
            Self::BinaryRequestError(_) => "BinaryRequestError",
            Self::BinaryResponseError(_) => "BinaryResponseError",
        }
    }

    /// Signatures attached to a JSON payload; binary envelopes carry none.
    pub fn signatures(&self) -> Vec<Signature> {
        match self {
            Self::JsonRequest(m) => payload_signatures(&m.payload),
            Self::JsonResponse(m) => payload_signatures(&m.payload),
            _ => Vec::new(),
        }
    }

    /// Same message relayed by `node` towards its destination.
    #[must_use]
    pub fn relayed_by(&self, node: &NetworkingNodeId) -> Self {
        let mut relayed = self.clone();
        match &mut relayed {
            Self::JsonRequest(m) => m.network_path = m.network_path.with_hop(node.clone()),
            Self::JsonResponse(m) => m.network_path = m.network_path.with_hop(node.clone()),
            Self::BinaryRequest(m) => m.network_path = m.network_path.with_hop(node.clone()),
            Self::BinaryResponse(m) => m.network_path = m.network_path.with_hop(node.clone()),
            Self::JsonRequestError(m)
            | Self::JsonResponseError(m)
            | Self::BinaryRequestError(m)
            | Self::BinaryResponseError(m) => {
                m.network_path = m.network_path.with_hop(node.clone())
            }
        }
        relayed
    }

    /// Same message under another RequestId.
    #[must_use]
    pub fn with_request_id(&self, request_id: RequestId) -> Self {
        let mut renamed = self.clone();
        match &mut renamed {
            Self::JsonRequest(m) => m.request_id = request_id,
            Self::JsonResponse(m) => m.request_id = request_id,
            Self::BinaryRequest(m) => m.request_id = request_id,
            Self::BinaryResponse(m) => m.request_id = request_id,
            Self::JsonRequestError(m)
            | Self::JsonResponseError(m)
            | Self::BinaryRequestError(m)
            | Self::BinaryResponseError(m) => m.request_id = request_id,
        }
        renamed
    }
}

pub(crate) fn payload_signatures(payload: &Value) -> Vec<Signature> {
    payload
        .get("signatures")
        .and_then(|s| serde_json::from_value(s.clone()).ok())
        .unwrap_or_default()
}

/// CALL (or SEND when `expects_response` is false)
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRequestMessage {
    pub request_id: RequestId,
    pub destination: Option<NetworkingNodeId>,
    pub network_path: NetworkPath,
    pub action: String,
    pub payload: Value,
    pub expects_response: bool,
}

impl JsonRequestMessage {
    pub fn new(request_id: RequestId, action: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id,
            destination: None,
            network_path: NetworkPath::empty(),
            action: action.into(),
            payload,
            expects_response: true,
        }
    }

    /// Unconfirmed SEND message.
    pub fn send(request_id: RequestId, action: impl Into<String>, payload: Value) -> Self {
        Self {
            expects_response: false,
            ..Self::new(request_id, action, payload)
        }
    }

    pub fn to(mut self, destination: NetworkingNodeId) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }

    /// Whether the request uses the networking-node routing layout.
    pub fn is_routed(&self) -> bool {
        self.destination.is_some() || !self.network_path.is_empty()
    }

    /// TryParse step of the message catalog: typed payload or `CouldNotParse`.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        T::deserialize(&self.payload).map_err(|e| {
            DecodeError::could_not_parse(
                Some(self.request_id.clone()),
                Some(self.action.clone()),
                e.to_string(),
            )
        })
    }
}

/// CALLRESULT
#[derive(Debug, Clone, PartialEq)]
pub struct JsonResponseMessage {
    pub request_id: RequestId,
    pub destination: Option<NetworkingNodeId>,
    pub network_path: NetworkPath,
    pub payload: Value,
}

impl JsonResponseMessage {
    /// Response routed back to the request's origin.
    pub fn answering(request: &JsonRequestMessage, payload: Value) -> Self {
        Self {
            request_id: request.request_id.clone(),
            destination: request.network_path.source().cloned(),
            network_path: NetworkPath::empty(),
            payload,
        }
    }

    pub fn with_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }

    pub fn parse_payload<T: DeserializeOwned>(&self, action: &str) -> Result<T, DecodeError> {
        T::deserialize(&self.payload).map_err(|e| {
            DecodeError::could_not_parse(
                Some(self.request_id.clone()),
                Some(action.to_string()),
                e.to_string(),
            )
        })
    }
}

/// CALLERROR / CALLRESULTERROR body, shared by the JSON and binary kinds
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    pub request_id: RequestId,
    pub destination: Option<NetworkingNodeId>,
    pub network_path: NetworkPath,
    pub error_code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl ErrorMessage {
    pub fn new(request_id: RequestId, error_code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            request_id,
            destination: None,
            network_path: NetworkPath::empty(),
            error_code,
            description: description.into(),
            details: Value::Object(Map::new()),
        }
    }

    /// Error routed back to the origin of `request`.
    pub fn answering(
        request_id: &RequestId,
        request_path: &NetworkPath,
        error_code: ErrorCode,
        description: impl Into<String>,
    ) -> Self {
        Self {
            destination: request_path.source().cloned(),
            ..Self::new(request_id.clone(), error_code, description)
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRequestMessage {
    pub request_id: RequestId,
    pub destination: Option<NetworkingNodeId>,
    pub network_path: NetworkPath,
    pub action: String,
    pub payload: Vec<u8>,
}

impl BinaryRequestMessage {
    pub fn new(request_id: RequestId, action: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            destination: None,
            network_path: NetworkPath::empty(),
            action: action.into(),
            payload,
        }
    }

    pub fn to(mut self, destination: NetworkingNodeId) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryResponseMessage {
    pub request_id: RequestId,
    pub destination: Option<NetworkingNodeId>,
    pub network_path: NetworkPath,
    pub payload: Vec<u8>,
}

impl BinaryResponseMessage {
    pub fn answering(request: &BinaryRequestMessage, payload: Vec<u8>) -> Self {
        Self {
            request_id: request.request_id.clone(),
            destination: request.network_path.source().cloned(),
            network_path: NetworkPath::empty(),
            payload,
        }
    }
}
