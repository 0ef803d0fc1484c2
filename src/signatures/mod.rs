//! Message signature policy
//!
//! Signatures travel inside the payload's `signatures` array and cover the
//! canonical rendering of `{networkPath, payload, requestId}` with the
//! `signatures` member removed and object keys sorted at every depth. The
//! network path is part of the signed content, so a node that relays a
//! message re-verifies it on ingress and re-signs it on egress.

pub mod ed25519;

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::Envelope;
use crate::ocpp::{NetworkPath, RequestId, Signature};

pub use ed25519::{DirectionalKeys, Ed25519Policy, SigningKey};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("message carries no signature")]
    MissingSignature,

    #[error("signature key {0} is not trusted")]
    UnknownKey(String),

    #[error("signature by {key_id} is not valid hex: {reason}")]
    InvalidEncoding { key_id: String, reason: String },

    #[error("signature by {0} does not verify")]
    VerificationFailed(String),

    #[error("invalid key material for {key_id}: {reason}")]
    InvalidKey { key_id: String, reason: String },
}

/// Which key set applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Direction {
    Request,
    Response,
}

/// How strictly inbound signatures are checked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    #[default]
    Ignore,
    VerifyIfPresent,
    Require,
}

/// The part of an envelope a signature covers
#[derive(Debug, Clone, Copy)]
pub struct SignedContent<'a> {
    pub request_id: &'a RequestId,
    pub network_path: &'a NetworkPath,
    pub payload: &'a Value,
}

impl<'a> SignedContent<'a> {
    pub fn of(envelope: &'a Envelope) -> Option<(Direction, Self)> {
        match envelope {
            Envelope::JsonRequest(m) => Some((
                Direction::Request,
                Self {
                    request_id: &m.request_id,
                    network_path: &m.network_path,
                    payload: &m.payload,
                },
            )),
            Envelope::JsonResponse(m) => Some((
                Direction::Response,
                Self {
                    request_id: &m.request_id,
                    network_path: &m.network_path,
                    payload: &m.payload,
                },
            )),
            _ => None,
        }
    }

    pub fn signatures(&self) -> Vec<Signature> {
        crate::envelope::payload_signatures(self.payload)
    }

    /// Bytes fed to the signature algorithm.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut payload = self.payload.clone();
        if let Value::Object(map) = &mut payload {
            map.remove("signatures");
        }

        let hops: Vec<Value> = self
            .network_path
            .hops()
            .iter()
            .map(|hop| Value::String(hop.to_string()))
            .collect();

        let mut content = Map::new();
        content.insert("networkPath".to_string(), Value::Array(hops));
        content.insert("payload".to_string(), payload);
        content.insert(
            "requestId".to_string(),
            Value::String(self.request_id.to_string()),
        );

        canonicalize(&Value::Object(content)).to_string().into_bytes()
    }
}

/// Rebuild `value` with object keys sorted recursively.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Verification and signing, chosen per direction.
#[async_trait]
pub trait SignaturePolicy: Send + Sync + Debug {
    async fn verify(
        &self,
        direction: Direction,
        content: SignedContent<'_>,
    ) -> Result<(), SignatureError>;

    /// Signatures to attach; an empty list leaves the payload untouched.
    async fn sign(
        &self,
        direction: Direction,
        content: SignedContent<'_>,
    ) -> Result<Vec<Signature>, SignatureError>;
}

/// Accepts everything and signs nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsigned;

#[async_trait]
impl SignaturePolicy for Unsigned {
    async fn verify(&self, _: Direction, _: SignedContent<'_>) -> Result<(), SignatureError> {
        Ok(())
    }

    async fn sign(&self, _: Direction, _: SignedContent<'_>) -> Result<Vec<Signature>, SignatureError> {
        Ok(Vec::new())
    }
}

/// Verify a JSON request or response; other kinds carry no signatures.
pub async fn verify_envelope(
    policy: &dyn SignaturePolicy,
    envelope: &Envelope,
) -> Result<(), SignatureError> {
    match SignedContent::of(envelope) {
        Some((direction, content)) => policy.verify(direction, content).await,
        None => Ok(()),
    }
}

/// Replace the payload signatures of a JSON request or response with the
/// policy's own.
pub async fn sign_envelope(
    policy: &dyn SignaturePolicy,
    mut envelope: Envelope,
) -> Result<Envelope, SignatureError> {
    let signatures = match SignedContent::of(&envelope) {
        Some((direction, content)) => policy.sign(direction, content).await?,
        None => return Ok(envelope),
    };
    if signatures.is_empty() {
        return Ok(envelope);
    }

    let payload = match &mut envelope {
        Envelope::JsonRequest(m) => &mut m.payload,
        Envelope::JsonResponse(m) => &mut m.payload,
        _ => return Ok(envelope),
    };
    if let Value::Object(map) = payload {
        let rendered = signatures
            .into_iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SignatureError::InvalidEncoding {
                key_id: String::new(),
                reason: e.to_string(),
            })?;
        map.insert("signatures".to_string(), Value::Array(rendered));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::JsonRequestMessage;
    use serde_json::json;

    #[test]
    fn test_canonical_bytes_ignore_key_order_and_signatures() {
        let path = NetworkPath::from_source("CS001".into());
        let id = RequestId::from("r-1");
        let a = json!({"b": 1, "a": {"y": 2, "x": 1}});
        let b = json!({"a": {"x": 1, "y": 2}, "b": 1, "signatures": [{"keyId": "k", "value": "00"}]});

        let left = SignedContent { request_id: &id, network_path: &path, payload: &a };
        let right = SignedContent { request_id: &id, network_path: &path, payload: &b };
        assert_eq!(left.canonical_bytes(), right.canonical_bytes());
        assert_eq!(
            String::from_utf8(left.canonical_bytes()).unwrap(),
            r#"{"networkPath":["CS001"],"payload":{"a":{"x":1,"y":2},"b":1},"requestId":"r-1"}"#
        );
    }

    #[test]
    fn test_canonical_bytes_cover_the_path() {
        let id = RequestId::from("r-2");
        let payload = json!({});
        let one = NetworkPath::from_source("CS001".into());
        let two = one.with_hop("NN01".into());
        let a = SignedContent { request_id: &id, network_path: &one, payload: &payload };
        let b = SignedContent { request_id: &id, network_path: &two, payload: &payload };
        assert_ne!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[tokio::test]
    async fn test_unsigned_policy_passes_through() {
        let envelope = Envelope::JsonRequest(JsonRequestMessage::new(
            "r-3".into(),
            "Heartbeat",
            json!({"signatures": [{"keyId": "upstream", "value": "ab"}]}),
        ));
        assert!(verify_envelope(&Unsigned, &envelope).await.is_ok());
        let signed = sign_envelope(&Unsigned, envelope.clone()).await.unwrap();
        assert_eq!(signed, envelope);
    }
}
