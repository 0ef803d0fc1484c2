use serde_json::json;
use thiserror::Error;

use super::ErrorMessage;
use crate::binary::BinaryError;
use crate::ocpp::{ErrorCode, NetworkPath, RequestId};

/// Failure to turn wire bytes into an envelope or typed payload.
///
/// Neither variant is retried; both are answered with a request-error
/// referencing the original RequestId (or `"-1"` when it was unreadable).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    /// Malformed frame, missing mandatory field or payload failing its schema
    #[error("could not parse {}: {reason}", .action.as_deref().unwrap_or("message"))]
    CouldNotParse {
        request_id: Option<RequestId>,
        action: Option<String>,
        reason: String,
    },

    /// The parser itself blew up (invalid JSON text, truncated binary record)
    #[error("formation violation: {exception}")]
    FormationViolation {
        request_id: Option<RequestId>,
        action: Option<String>,
        exception: String,
    },
}

impl DecodeError {
    pub fn could_not_parse(
        request_id: Option<RequestId>,
        action: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::CouldNotParse {
            request_id,
            action,
            reason: reason.into(),
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::CouldNotParse { request_id, .. } | Self::FormationViolation { request_id, .. } => {
                request_id.as_ref()
            }
        }
    }

    pub fn action(&self) -> Option<&str> {
        match self {
            Self::CouldNotParse { action, .. } | Self::FormationViolation { action, .. } => {
                action.as_deref()
            }
        }
    }

    /// Request-error frame answering the message that failed to decode.
    pub fn to_request_error(&self) -> ErrorMessage {
        let request_id = self.request_id().cloned().unwrap_or_else(RequestId::unreadable);
        let (description, details) = match self {
            Self::CouldNotParse { action, reason, .. } => (
                format!(
                    "Processing the given '{}' request could not be parsed!",
                    action.as_deref().unwrap_or("unknown")
                ),
                json!({ "reason": reason }),
            ),
            Self::FormationViolation { exception, .. } => (
                format!("Processing the given request led to an exception: {exception}"),
                json!({ "exception": exception }),
            ),
        };

        ErrorMessage {
            request_id,
            destination: None,
            network_path: NetworkPath::empty(),
            error_code: ErrorCode::FormatViolation,
            description,
            details,
        }
    }
}

impl From<BinaryError> for DecodeError {
    fn from(error: BinaryError) -> Self {
        let (request_id, action, cause) = match error {
            BinaryError::InRequest {
                request_id,
                action,
                source,
            } => (Some(request_id), action, *source),
            other => (None, None, other),
        };
        match cause {
            BinaryError::Truncated { .. } => Self::FormationViolation {
                request_id,
                action,
                exception: cause.to_string(),
            },
            _ => Self::CouldNotParse {
                request_id,
                action,
                reason: cause.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreadable_request_id_maps_to_minus_one() {
        let error = DecodeError::FormationViolation {
            request_id: None,
            action: None,
            exception: "EOF while parsing".to_string(),
        };
        let reply = error.to_request_error();
        assert_eq!(reply.request_id.as_str(), "-1");
        assert_eq!(reply.error_code, ErrorCode::FormatViolation);
        assert_eq!(reply.details["exception"], "EOF while parsing");
    }

    #[test]
    fn test_binary_error_inside_request_keeps_its_id() {
        let error = BinaryError::MissingField("action").in_request(&"b-9".into(), None);
        let decode = DecodeError::from(error);
        assert_eq!(decode.request_id(), Some(&RequestId::from("b-9")));
        assert_eq!(decode.to_string(), "could not parse message: missing field action");

        let unlabelled = DecodeError::from(BinaryError::MissingField("request id"));
        assert_eq!(unlabelled.to_request_error().request_id.as_str(), "-1");
    }

    #[test]
    fn test_could_not_parse_keeps_request_id() {
        let error = DecodeError::could_not_parse(
            Some("42".into()),
            Some("GetCRL".to_string()),
            "missing field `status`",
        );
        let reply = error.to_request_error();
        assert_eq!(reply.request_id.as_str(), "42");
        assert!(reply.description.contains("'GetCRL'"));
        assert_eq!(error.to_string(), "could not parse GetCRL: missing field `status`");
    }
}
