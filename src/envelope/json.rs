//! OCPP-J text framing
//!
//! - **Call**            `[2, "<id>", "<action>", {payload}]`
//! - **CallResult**      `[3, "<id>", {payload}]`
//! - **CallError**       `[4, "<id>", "<code>", "<description>", {details}]`
//! - **CallResultError** `[5, "<id>", "<code>", "<description>", {details}]`
//! - **Send**            `[6, "<id>", "<action>", {payload}]`
//!
//! Routed frames insert `"<destination>", ["<hop>", ...]` right after the
//! message type id.

use serde_json::{Map, Value};

use super::{DecodeError, Envelope, ErrorMessage, JsonRequestMessage, JsonResponseMessage};
use crate::ocpp::{ErrorCode, MessageType, NetworkPath, NetworkingNodeId, RequestId};

/// Serialize a JSON envelope; `None` for binary kinds.
pub(crate) fn encode(envelope: &Envelope) -> Option<String> {
    let frame = match envelope {
        Envelope::JsonRequest(m) => {
            let message_type = if m.expects_response {
                MessageType::Call
            } else {
                MessageType::Send
            };
            let mut frame = header(message_type, m.destination.as_ref(), &m.network_path);
            frame.push(Value::String(m.request_id.to_string()));
            frame.push(Value::String(m.action.clone()));
            frame.push(m.payload.clone());
            frame
        }
        Envelope::JsonResponse(m) => {
            let mut frame = header(MessageType::CallResult, m.destination.as_ref(), &m.network_path);
            frame.push(Value::String(m.request_id.to_string()));
            frame.push(m.payload.clone());
            frame
        }
        Envelope::JsonRequestError(m) => error_frame(MessageType::CallError, m),
        Envelope::JsonResponseError(m) => error_frame(MessageType::CallResultError, m),
        Envelope::BinaryRequest(_)
        | Envelope::BinaryResponse(_)
        | Envelope::BinaryRequestError(_)
        | Envelope::BinaryResponseError(_) => return None,
    };

    Some(Value::Array(frame).to_string())
}

fn header(
    message_type: MessageType,
    destination: Option<&NetworkingNodeId>,
    path: &NetworkPath,
) -> Vec<Value> {
    let mut frame = vec![Value::Number(message_type.id().into())];
    if destination.is_some() || !path.is_empty() {
        frame.push(Value::String(
            destination.map(|d| d.to_string()).unwrap_or_default(),
        ));
        frame.push(Value::Array(
            path.hops()
                .iter()
                .map(|hop| Value::String(hop.to_string()))
                .collect(),
        ));
    }
    frame
}

fn error_frame(message_type: MessageType, m: &ErrorMessage) -> Vec<Value> {
    let mut frame = header(message_type, m.destination.as_ref(), &m.network_path);
    frame.push(Value::String(m.request_id.to_string()));
    frame.push(Value::String(m.error_code.to_string()));
    frame.push(Value::String(m.description.clone()));
    frame.push(m.details.clone());
    frame
}

/// Parse one text frame.
pub fn decode(text: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|e| DecodeError::FormationViolation {
        request_id: None,
        action: None,
        exception: e.to_string(),
    })?;

    let arr = match value {
        Value::Array(arr) if !arr.is_empty() => arr,
        _ => {
            return Err(DecodeError::could_not_parse(
                None,
                None,
                "frame is not a non-empty JSON array",
            ))
        }
    };

    let message_type = arr[0]
        .as_u64()
        .and_then(MessageType::from_id)
        .ok_or_else(|| {
            DecodeError::could_not_parse(None, None, format!("unknown message type {}", arr[0]))
        })?;

    let routed = arr.get(2).map(Value::is_array).unwrap_or(false);
    let (destination, network_path, rest) = if routed {
        let destination = arr[1].as_str().ok_or_else(|| {
            DecodeError::could_not_parse(None, None, "destination must be a string")
        })?;
        let destination = (!destination.is_empty()).then(|| NetworkingNodeId::new(destination));
        (destination, parse_path(&arr[2])?, &arr[3..])
    } else {
        (None, NetworkPath::empty(), &arr[1..])
    };

    let request_id = rest
        .first()
        .and_then(Value::as_str)
        .map(RequestId::new)
        .ok_or_else(|| DecodeError::could_not_parse(None, None, "request id must be a string"))?;

    let missing = |what: &str, action: Option<&str>| {
        DecodeError::could_not_parse(
            Some(request_id.clone()),
            action.map(str::to_string),
            format!("missing or invalid {what}"),
        )
    };

    match message_type {
        MessageType::Call | MessageType::Send => {
            let action = rest
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| missing("action", None))?;
            let payload = rest
                .get(2)
                .filter(|p| p.is_object())
                .cloned()
                .ok_or_else(|| missing("payload object", Some(action)))?;

            Ok(Envelope::JsonRequest(JsonRequestMessage {
                request_id,
                destination,
                network_path,
                action: action.to_string(),
                payload,
                expects_response: message_type == MessageType::Call,
            }))
        }
        MessageType::CallResult => {
            let payload = rest
                .get(1)
                .filter(|p| p.is_object())
                .cloned()
                .ok_or_else(|| missing("payload object", None))?;

            Ok(Envelope::JsonResponse(JsonResponseMessage {
                request_id,
                destination,
                network_path,
                payload,
            }))
        }
        MessageType::CallError | MessageType::CallResultError => {
            let error_code = rest
                .get(1)
                .and_then(Value::as_str)
                .map(ErrorCode::parse_lenient)
                .ok_or_else(|| missing("error code", None))?;
            let description = rest
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let details = rest
                .get(3)
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));

            let error = ErrorMessage {
                request_id,
                destination,
                network_path,
                error_code,
                description,
                details,
            };
            Ok(if message_type == MessageType::CallError {
                Envelope::JsonRequestError(error)
            } else {
                Envelope::JsonResponseError(error)
            })
        }
    }
}

fn parse_path(value: &Value) -> Result<NetworkPath, DecodeError> {
    let hops = value
        .as_array()
        .into_iter()
        .flatten()
        .map(|hop| {
            hop.as_str().map(NetworkingNodeId::new).ok_or_else(|| {
                DecodeError::could_not_parse(None, None, "network path hops must be strings")
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(NetworkPath::from_hops(hops))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_plain_call_round_trips() {
        let text = r#"[2,"abc123","GetCRL",{"requestId":7,"certificateHashData":{}}]"#;
        let envelope = decode(text).unwrap();
        match &envelope {
            Envelope::JsonRequest(m) => {
                assert_eq!(m.request_id.as_str(), "abc123");
                assert_eq!(m.action, "GetCRL");
                assert!(m.destination.is_none());
                assert!(m.expects_response);
            }
            other => panic!("expected JSONRequest, got {}", other.kind()),
        }
        assert_eq!(encode(&envelope).unwrap(), text);
    }

    #[test]
    fn test_routed_call_keeps_destination_and_path() {
        let text = r#"[2,"CSMS",["CS001","NN01"],"r-9","Heartbeat",{}]"#;
        let envelope = decode(text).unwrap();
        assert_eq!(envelope.destination(), Some(&NetworkingNodeId::from("CSMS")));
        assert_eq!(envelope.network_path().len(), 2);
        assert_eq!(encode(&envelope).unwrap(), text);
    }

    #[test]
    fn test_call_result_and_errors() {
        let result = decode(r#"[3,"r-1",{"status":"Accepted"}]"#).unwrap();
        assert_eq!(result.kind(), "JSONResponse");

        let error = decode(r#"[4,"r-2","NotImplemented","Unknown action",{}]"#).unwrap();
        match error {
            Envelope::JsonRequestError(e) => {
                assert_eq!(e.error_code, ErrorCode::NotImplemented);
                assert_eq!(e.description, "Unknown action");
            }
            other => panic!("expected JSONRequestError, got {}", other.kind()),
        }

        let response_error = decode(r#"[5,"r-3","SecurityError"]"#).unwrap();
        assert_eq!(response_error.kind(), "JSONResponseError");
    }

    #[test]
    fn test_send_message_expects_no_response() {
        let envelope = decode(r#"[6,"s-1","Heartbeat",{}]"#).unwrap();
        match &envelope {
            Envelope::JsonRequest(m) => assert!(!m.expects_response),
            other => panic!("expected JSONRequest, got {}", other.kind()),
        }
        assert!(encode(&envelope).unwrap().starts_with("[6,"));
    }

    #[test]
    fn test_error_frame_encodes_code_name() {
        let error = ErrorMessage::new("r-5".into(), ErrorCode::GenericError, "nope")
            .with_details(json!({"hint": 1}));
        let text = encode(&Envelope::JsonRequestError(error)).unwrap();
        assert_eq!(text, r#"[4,"r-5","GenericError","nope",{"hint":1}]"#);
    }

    #[test]
    fn test_binary_kinds_are_not_text_framed() {
        let binary = Envelope::BinaryResponse(crate::envelope::BinaryResponseMessage {
            request_id: "b-1".into(),
            destination: None,
            network_path: NetworkPath::empty(),
            payload: vec![1],
        });
        assert_eq!(encode(&binary), None);
    }

    #[test]
    fn test_invalid_json_is_formation_violation() {
        let err = decode("[2, \"abc").unwrap_err();
        assert!(matches!(err, DecodeError::FormationViolation { .. }));
        assert!(err.request_id().is_none());
    }

    #[rstest]
    #[case::not_an_array(r#"{"a":1}"#)]
    #[case::empty_array("[]")]
    #[case::unknown_type(r#"[9,"x","Heartbeat",{}]"#)]
    #[case::numeric_id(r#"[2,17,"Heartbeat",{}]"#)]
    #[case::bad_hop(r#"[2,"CSMS",[1],"x","Heartbeat",{}]"#)]
    fn test_malformed_frames_could_not_parse(#[case] text: &str) {
        let err = decode(text).unwrap_err();
        assert!(matches!(err, DecodeError::CouldNotParse { .. }), "{err:?}");
    }

    #[test]
    fn test_missing_payload_keeps_request_id() {
        let err = decode(r#"[2,"r-7","Heartbeat"]"#).unwrap_err();
        assert_eq!(err.request_id(), Some(&RequestId::from("r-7")));
        assert_eq!(err.action(), Some("Heartbeat"));
        assert_eq!(err.to_request_error().request_id.as_str(), "r-7");
    }
}
