use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::envelope::ErrorMessage;
use crate::ocpp::{ErrorCode, NetworkPath, RequestId};

/// Reason attached to drop responses the forwarding engine synthesizes itself.
pub const DEFAULT_HANDLER: &str = "Default handler";

/// The single answer chosen for one request
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<R> {
    Response(R),
    /// No handler produced an answer.
    Failed { reason: String },
    SignatureError { reason: String },
    ExceptionOccurred { exception: String },
    /// Dropped by a forwarding filter.
    Filtered { reason: String },
    Timeout { after: Duration },
    /// Protocol-level refusal raised locally (unknown action, bad payload).
    Rejected {
        code: ErrorCode,
        description: String,
        details: Value,
    },
    /// The peer answered with a CALLERROR.
    RemoteError {
        code: ErrorCode,
        description: String,
        details: Value,
    },
}

impl<R> Outcome<R> {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn filtered(reason: impl Into<String>) -> Self {
        Self::Filtered {
            reason: reason.into(),
        }
    }

    pub fn rejected(code: ErrorCode, description: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            description: description.into(),
            details: Value::Object(Map::new()),
        }
    }

    pub fn exception(exception: impl ToString) -> Self {
        Self::ExceptionOccurred {
            exception: exception.to_string(),
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response(_))
    }

    pub fn response(&self) -> Option<&R> {
        match self {
            Self::Response(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<R> {
        match self {
            Self::Response(r) => Some(r),
            _ => None,
        }
    }

    pub fn map<S>(self, f: impl FnOnce(R) -> S) -> Outcome<S> {
        self.and_then(|r| Outcome::Response(f(r)))
    }

    /// Chain a step that may itself fail; non-response outcomes pass through.
    pub fn and_then<S>(self, f: impl FnOnce(R) -> Outcome<S>) -> Outcome<S> {
        match self {
            Self::Response(r) => f(r),
            Self::Failed { reason } => Outcome::Failed { reason },
            Self::SignatureError { reason } => Outcome::SignatureError { reason },
            Self::ExceptionOccurred { exception } => Outcome::ExceptionOccurred { exception },
            Self::Filtered { reason } => Outcome::Filtered { reason },
            Self::Timeout { after } => Outcome::Timeout { after },
            Self::Rejected {
                code,
                description,
                details,
            } => Outcome::Rejected {
                code,
                description,
                details,
            },
            Self::RemoteError {
                code,
                description,
                details,
            } => Outcome::RemoteError {
                code,
                description,
                details,
            },
        }
    }

    /// Label for logs and hook events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Response(_) => "Response",
            Self::Failed { .. } => "Failed",
            Self::SignatureError { .. } => "SignatureError",
            Self::ExceptionOccurred { .. } => "ExceptionOccurred",
            Self::Filtered { .. } => "Filtered",
            Self::Timeout { .. } => "Timeout",
            Self::Rejected { .. } => "Rejected",
            Self::RemoteError { .. } => "RemoteError",
        }
    }

    /// Wire error code for every non-response outcome.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Response(_) => None,
            Self::Failed { .. } | Self::Filtered { .. } | Self::Timeout { .. } => {
                Some(ErrorCode::GenericError)
            }
            Self::SignatureError { .. } => Some(ErrorCode::SecurityError),
            Self::ExceptionOccurred { .. } => Some(ErrorCode::InternalError),
            Self::Rejected { code, .. } | Self::RemoteError { code, .. } => Some(*code),
        }
    }

    /// The response payload, or the CALLERROR answering `request_id`.
    pub fn as_reply(
        &self,
        request_id: &RequestId,
        request_path: &NetworkPath,
    ) -> Result<&R, ErrorMessage> {
        let (code, description, details) = match self {
            Self::Response(r) => return Ok(r),
            Self::Failed { reason } => (
                ErrorCode::GenericError,
                reason.clone(),
                json!({ "reason": reason }),
            ),
            Self::SignatureError { reason } => (
                ErrorCode::SecurityError,
                format!("Invalid signature: {reason}"),
                json!({ "reason": reason }),
            ),
            Self::ExceptionOccurred { exception } => (
                ErrorCode::InternalError,
                format!("Processing the given request led to an exception: {exception}"),
                json!({ "exception": exception }),
            ),
            Self::Filtered { reason } => (
                ErrorCode::GenericError,
                format!("Filtered: {reason}"),
                json!({ "reason": reason }),
            ),
            Self::Timeout { after } => (
                ErrorCode::GenericError,
                format!("Timeout after {} ms", after.as_millis()),
                json!({ "timeoutMs": after.as_millis() as u64 }),
            ),
            Self::Rejected {
                code,
                description,
                details,
            }
            | Self::RemoteError {
                code,
                description,
                details,
            } => (*code, description.clone(), details.clone()),
        };

        let details = match details {
            Value::Object(_) => details,
            Value::Null => Value::Object(Map::new()),
            other => json!({ "details": other }),
        };
        Err(ErrorMessage::answering(request_id, request_path, code, description).with_details(details))
    }

    /// CALLERROR answering `request_id`, or `None` for a real response.
    pub fn to_error_message(
        &self,
        request_id: &RequestId,
        request_path: &NetworkPath,
    ) -> Option<ErrorMessage> {
        self.as_reply(request_id, request_path).err()
    }
}

impl<R> From<&ErrorMessage> for Outcome<R> {
    fn from(error: &ErrorMessage) -> Self {
        Self::RemoteError {
            code: error.error_code,
            description: error.description.clone(),
            details: error.details.clone(),
        }
    }
}
