//! Action name -> message codec table
//!
//! Built once at startup; lookups never reflect over types at runtime.

use serde_json::Value;
use std::collections::BTreeMap;

use super::messages::{
    BinaryDataTransferRequest, BootNotificationRequest, DataTransferRequest, GetCrlRequest,
    HeartbeatRequest, OcppRequest,
};

type Validator = fn(&Value) -> Result<(), String>;

/// Codec entry for one action
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub action: &'static str,
    pub binary: bool,
    validate_request: Validator,
    validate_response: Validator,
}

impl CatalogEntry {
    pub fn validate_request(&self, payload: &Value) -> Result<(), String> {
        (self.validate_request)(payload)
    }

    pub fn validate_response(&self, payload: &Value) -> Result<(), String> {
        (self.validate_response)(payload)
    }
}

fn validate_as<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<(), String> {
    T::deserialize(payload)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

fn accept_any(_payload: &Value) -> Result<(), String> {
    Ok(())
}

/// Registry of the actions this node can parse
#[derive(Debug, Clone, Default)]
pub struct MessageCatalog {
    entries: BTreeMap<&'static str, CatalogEntry>,
}

impl MessageCatalog {
    pub fn builder() -> MessageCatalogBuilder {
        MessageCatalogBuilder::default()
    }

    /// Catalog of every message type defined in [`super::messages`].
    pub fn standard() -> Self {
        Self::builder()
            .register::<HeartbeatRequest>()
            .register::<BootNotificationRequest>()
            .register::<GetCrlRequest>()
            .register::<DataTransferRequest>()
            .register_binary(BinaryDataTransferRequest::ACTION)
            .build()
    }

    pub fn get(&self, action: &str) -> Option<&CatalogEntry> {
        self.entries.get(action)
    }

    pub fn contains(&self, action: &str) -> bool {
        self.entries.contains_key(action)
    }

    pub fn actions(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct MessageCatalogBuilder {
    entries: BTreeMap<&'static str, CatalogEntry>,
}

impl MessageCatalogBuilder {
    pub fn register<T: OcppRequest>(mut self) -> Self {
        self.entries.insert(
            T::ACTION,
            CatalogEntry {
                action: T::ACTION,
                binary: false,
                validate_request: validate_as::<T>,
                validate_response: validate_as::<T::Response>,
            },
        );
        self
    }

    /// Binary payloads are opaque to the catalog; only the action is recorded.
    pub fn register_binary(mut self, action: &'static str) -> Self {
        self.entries.insert(
            action,
            CatalogEntry {
                action,
                binary: true,
                validate_request: accept_any,
                validate_response: accept_any,
            },
        );
        self
    }

    pub fn build(self) -> MessageCatalog {
        MessageCatalog {
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_standard_catalog_lists_actions() {
        let catalog = MessageCatalog::standard();
        assert!(catalog.contains("GetCRL"));
        assert!(catalog.contains("BinaryDataTransfer"));
        assert!(!catalog.contains("RemoteStartTransaction"));
        assert_eq!(catalog.len(), 5);
    }

    #[test]
    fn test_entry_validates_payload_shape() {
        let catalog = MessageCatalog::standard();
        let entry = catalog.get("GetCRL").unwrap();

        assert!(entry
            .validate_response(&json!({"requestId": 7, "status": "Accepted"}))
            .is_ok());
        let err = entry.validate_response(&json!({"status": "Maybe"})).unwrap_err();
        assert!(err.contains("unknown variant") || err.contains("missing field"));
        assert!(entry.validate_request(&json!({})).is_err());
    }
}
