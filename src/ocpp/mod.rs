//! OCPP 2.1 protocol primitives
//!
//! This module holds the version-specific vocabulary the rest of the crate
//! builds on: message type ids, RPC error codes, request/node identifiers,
//! network paths and the message catalog.
//!
//! # Architecture
//! - JSON-over-WebSocket frames (OCPP-J) with the networking-node routing extension
//! - CALL / CALLRESULT / CALLERROR / CALLRESULTERROR / SEND message pattern
//! - Typed messages registered in a catalog keyed by action name

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub mod catalog;
pub mod common;
pub mod messages;
pub mod types;

pub use catalog::{CatalogEntry, MessageCatalog, MessageCatalogBuilder};
pub use common::{CustomData, Signature, StatusInfo};
pub use messages::{OcppRequest, OcppResponse};
pub use types::{NetworkPath, NetworkingNodeId, RequestId};

/// OCPP-J message type id (first element of every frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
    CallResultError = 5,
    Send = 6,
}

impl MessageType {
    pub fn from_id(id: u64) -> Option<Self> {
        match id {
            2 => Some(Self::Call),
            3 => Some(Self::CallResult),
            4 => Some(Self::CallError),
            5 => Some(Self::CallResultError),
            6 => Some(Self::Send),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

/// OCPP 2.1 RPC framework error codes
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl ErrorCode {
    /// Lenient parse used on inbound error frames; unknown codes collapse to `GenericError`.
    pub fn parse_lenient(code: &str) -> Self {
        code.parse().unwrap_or(Self::GenericError)
    }
}
