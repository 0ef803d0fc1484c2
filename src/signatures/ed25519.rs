//! Ed25519 key ring policy backed by `ring`

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use ring::signature::{self, KeyPair, UnparsedPublicKey};
use tracing::{debug, warn};

use super::{Direction, SignatureError, SignaturePolicy, SignedContent, VerificationMode};
use crate::ocpp::Signature;

pub const SIGNING_METHOD: &str = "Ed25519";
pub const ENCODING_METHOD: &str = "hex";

/// Private signing key with the id verifiers know it by
pub struct SigningKey {
    key_id: String,
    pair: signature::Ed25519KeyPair,
}

impl SigningKey {
    /// Build from a 32-byte hex seed.
    pub fn from_seed_hex(key_id: impl Into<String>, seed_hex: &str) -> Result<Self, SignatureError> {
        let key_id = key_id.into();
        let seed = hex::decode(seed_hex.trim()).map_err(|e| SignatureError::InvalidKey {
            key_id: key_id.clone(),
            reason: e.to_string(),
        })?;
        let pair = signature::Ed25519KeyPair::from_seed_unchecked(&seed).map_err(|e| {
            SignatureError::InvalidKey {
                key_id: key_id.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self { key_id, pair })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key(&self) -> &[u8] {
        self.pair.public_key().as_ref()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            key_id: self.key_id.clone(),
            value: hex::encode(self.pair.sign(message).as_ref()),
            signing_method: Some(SIGNING_METHOD.to_string()),
            encoding_method: Some(ENCODING_METHOD.to_string()),
            name: None,
            description: None,
            timestamp: None,
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Key material and strictness for one direction
#[derive(Debug, Clone, Default)]
pub struct DirectionalKeys {
    pub mode: VerificationMode,
    pub signing_key: Option<Arc<SigningKey>>,
    trusted: HashMap<String, Vec<u8>>,
}

impl DirectionalKeys {
    pub fn new(mode: VerificationMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn with_signing_key(mut self, key: Arc<SigningKey>) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn trust(mut self, key_id: impl Into<String>, public_key: Vec<u8>) -> Self {
        self.trusted.insert(key_id.into(), public_key);
        self
    }

    pub fn trust_hex(self, key_id: impl Into<String>, public_key_hex: &str) -> Result<Self, SignatureError> {
        let key_id = key_id.into();
        let bytes = hex::decode(public_key_hex.trim()).map_err(|e| SignatureError::InvalidKey {
            key_id: key_id.clone(),
            reason: e.to_string(),
        })?;
        if bytes.len() != 32 {
            return Err(SignatureError::InvalidKey {
                key_id,
                reason: format!("expected 32 bytes, got {}", bytes.len()),
            });
        }
        Ok(self.trust(key_id, bytes))
    }

    fn verify(&self, content: &SignedContent<'_>) -> Result<(), SignatureError> {
        if self.mode == VerificationMode::Ignore {
            return Ok(());
        }

        let signatures = content.signatures();
        if signatures.is_empty() {
            return match self.mode {
                VerificationMode::Require => Err(SignatureError::MissingSignature),
                _ => Ok(()),
            };
        }

        let message = content.canonical_bytes();
        for sig in &signatures {
            let public_key = self
                .trusted
                .get(&sig.key_id)
                .ok_or_else(|| SignatureError::UnknownKey(sig.key_id.clone()))?;
            let raw = hex::decode(&sig.value).map_err(|e| SignatureError::InvalidEncoding {
                key_id: sig.key_id.clone(),
                reason: e.to_string(),
            })?;
            UnparsedPublicKey::new(&signature::ED25519, public_key)
                .verify(&message, &raw)
                .map_err(|_| SignatureError::VerificationFailed(sig.key_id.clone()))?;
        }
        Ok(())
    }
}

/// Ed25519 signatures with separate key sets for requests and responses
#[derive(Debug, Clone, Default)]
pub struct Ed25519Policy {
    pub requests: DirectionalKeys,
    pub responses: DirectionalKeys,
}

impl Ed25519Policy {
    pub fn new(requests: DirectionalKeys, responses: DirectionalKeys) -> Self {
        Self { requests, responses }
    }

    fn keys(&self, direction: Direction) -> &DirectionalKeys {
        match direction {
            Direction::Request => &self.requests,
            Direction::Response => &self.responses,
        }
    }
}

#[async_trait]
impl SignaturePolicy for Ed25519Policy {
    async fn verify(
        &self,
        direction: Direction,
        content: SignedContent<'_>,
    ) -> Result<(), SignatureError> {
        let result = self.keys(direction).verify(&content);
        match &result {
            Ok(()) => debug!(request_id = %content.request_id, %direction, "signatures accepted"),
            Err(e) => warn!(request_id = %content.request_id, %direction, error = %e, "signature check failed"),
        }
        result
    }

    async fn sign(
        &self,
        direction: Direction,
        content: SignedContent<'_>,
    ) -> Result<Vec<Signature>, SignatureError> {
        Ok(self
            .keys(direction)
            .signing_key
            .as_ref()
            .map(|key| vec![key.sign(&content.canonical_bytes())])
            .unwrap_or_default())
    }
}
