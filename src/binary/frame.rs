//! Binary envelope codec
//!
//! Compact layout after the format tag:
//! `type(u8) || id(str16) || destination(str16) || hops(u16) || hop(str16)*`
//! followed by `action(str16) || payload(bytes32)` for requests,
//! `payload(bytes32)` for responses and
//! `code(str16) || description(str16) || details(bytes32)` for errors.
//!
//! The Extensible layout carries the same fields as TLV records, hops as one
//! record each in path order.

use serde_json::{Map, Value};

use super::{utf8, BinaryError, BinaryFormat, ByteReader, ByteWriter, TlvReader, TlvWriter};
use crate::envelope::{BinaryRequestMessage, BinaryResponseMessage, Envelope, ErrorMessage};
use crate::ocpp::{ErrorCode, MessageType, NetworkPath, NetworkingNodeId, RequestId};

mod tag {
    pub const MESSAGE_TYPE: u16 = 0x0001;
    pub const REQUEST_ID: u16 = 0x0002;
    pub const DESTINATION: u16 = 0x0003;
    pub const NETWORK_HOP: u16 = 0x0004;
    pub const ACTION: u16 = 0x0005;
    pub const PAYLOAD: u16 = 0x0006;
    pub const ERROR_CODE: u16 = 0x0007;
    pub const ERROR_DESCRIPTION: u16 = 0x0008;
    pub const ERROR_DETAILS: u16 = 0x0009;
}

/// Envelope fields in wire-neutral form
#[derive(Debug, Default)]
struct Fields {
    message_type: Option<MessageType>,
    request_id: Option<RequestId>,
    destination: Option<NetworkingNodeId>,
    hops: Vec<NetworkingNodeId>,
    action: Option<String>,
    payload: Vec<u8>,
    error_code: Option<ErrorCode>,
    error_description: String,
    error_details: Option<Value>,
}

impl Fields {
    fn from_envelope(envelope: &Envelope) -> Result<Self, BinaryError> {
        let mut fields = Fields {
            request_id: Some(envelope.request_id().clone()),
            destination: envelope.destination().cloned(),
            hops: envelope.network_path().hops().to_vec(),
            ..Default::default()
        };

        match envelope {
            Envelope::BinaryRequest(m) => {
                fields.message_type = Some(MessageType::Call);
                fields.action = Some(m.action.clone());
                fields.payload = m.payload.clone();
            }
            Envelope::BinaryResponse(m) => {
                fields.message_type = Some(MessageType::CallResult);
                fields.payload = m.payload.clone();
            }
            Envelope::BinaryRequestError(e) | Envelope::BinaryResponseError(e) => {
                fields.message_type = Some(if matches!(envelope, Envelope::BinaryRequestError(_)) {
                    MessageType::CallError
                } else {
                    MessageType::CallResultError
                });
                fields.error_code = Some(e.error_code);
                fields.error_description = e.description.clone();
                fields.error_details = Some(e.details.clone());
            }
            other => {
                return Err(BinaryError::InvalidField {
                    field: "envelope",
                    reason: format!("{} cannot be framed as binary", other.kind()),
                })
            }
        }
        Ok(fields)
    }

    fn into_envelope(self) -> Result<Envelope, BinaryError> {
        let message_type = self.message_type.ok_or(BinaryError::MissingField("message type"))?;
        let request_id = self
            .request_id
            .clone()
            .ok_or(BinaryError::MissingField("request id"))?;
        let action = self.action.clone();
        self.assemble(message_type, request_id.clone())
            .map_err(|e| e.in_request(&request_id, action.as_deref()))
    }

    fn assemble(self, message_type: MessageType, request_id: RequestId) -> Result<Envelope, BinaryError> {
        let network_path = NetworkPath::from_hops(self.hops);

        let envelope = match message_type {
            MessageType::Call => Envelope::BinaryRequest(BinaryRequestMessage {
                request_id,
                destination: self.destination,
                network_path,
                action: self.action.ok_or(BinaryError::MissingField("action"))?,
                payload: self.payload,
            }),
            MessageType::CallResult => Envelope::BinaryResponse(BinaryResponseMessage {
                request_id,
                destination: self.destination,
                network_path,
                payload: self.payload,
            }),
            MessageType::CallError | MessageType::CallResultError => {
                let error = ErrorMessage {
                    request_id,
                    destination: self.destination,
                    network_path,
                    error_code: self.error_code.ok_or(BinaryError::MissingField("error code"))?,
                    description: self.error_description,
                    details: self
                        .error_details
                        .unwrap_or_else(|| Value::Object(Map::new())),
                };
                if message_type == MessageType::CallError {
                    Envelope::BinaryRequestError(error)
                } else {
                    Envelope::BinaryResponseError(error)
                }
            }
            MessageType::Send => {
                return Err(BinaryError::InvalidField {
                    field: "message type",
                    reason: "SEND is not supported in binary frames".to_string(),
                })
            }
        };
        Ok(envelope)
    }
}

fn parse_message_type(id: u8) -> Result<MessageType, BinaryError> {
    MessageType::from_id(id as u64).ok_or_else(|| BinaryError::InvalidField {
        field: "message type",
        reason: format!("unknown message type {id}"),
    })
}

fn parse_details(bytes: &[u8]) -> Result<Value, BinaryError> {
    if bytes.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(bytes).map_err(|e| BinaryError::InvalidField {
        field: "error details",
        reason: e.to_string(),
    })
}

fn details_bytes(details: &Option<Value>) -> Vec<u8> {
    details
        .as_ref()
        .map(|d| d.to_string().into_bytes())
        .unwrap_or_default()
}

/// Encode a binary envelope kind in the given layout.
pub fn encode_envelope(envelope: &Envelope, format: BinaryFormat) -> Result<Vec<u8>, BinaryError> {
    let fields = Fields::from_envelope(envelope)?;
    let bytes = match format {
        BinaryFormat::Compact => encode_compact(&fields)?,
        BinaryFormat::Extensible => encode_extensible(&fields)?,
    };

    tracing::trace!(
        kind = envelope.kind(),
        request_id = %envelope.request_id(),
        format = ?format,
        len = bytes.len(),
        "encoded binary envelope"
    );
    Ok(bytes)
}

/// Decode a binary frame, dispatching on its format tag.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, BinaryError> {
    let (format, body) = BinaryFormat::read_header(data)?;
    let fields = match format {
        BinaryFormat::Compact => decode_compact(body)?,
        BinaryFormat::Extensible => decode_extensible(body)?,
    };
    fields.into_envelope()
}

fn encode_compact(fields: &Fields) -> Result<Vec<u8>, BinaryError> {
    let message_type = fields.message_type.ok_or(BinaryError::MissingField("message type"))?;
    let mut w = ByteWriter::with_format(BinaryFormat::Compact);
    w.put_u8(message_type.id());
    w.put_str16(
        "request id",
        fields.request_id.as_ref().map(RequestId::as_str).unwrap_or_default(),
    )?;
    w.put_str16(
        "destination",
        fields.destination.as_ref().map(NetworkingNodeId::as_str).unwrap_or_default(),
    )?;
    if fields.hops.len() > u16::MAX as usize {
        return Err(BinaryError::FieldTooLong {
            field: "network path",
            len: fields.hops.len(),
            max: u16::MAX as usize,
        });
    }
    w.put_u16(fields.hops.len() as u16);
    for hop in &fields.hops {
        w.put_str16("network hop", hop.as_str())?;
    }

    match message_type {
        MessageType::Call => {
            w.put_str16("action", fields.action.as_deref().unwrap_or_default())?;
            w.put_bytes32("payload", &fields.payload)?;
        }
        MessageType::CallResult => {
            w.put_bytes32("payload", &fields.payload)?;
        }
        _ => {
            let code = fields.error_code.map(|c| c.to_string()).unwrap_or_default();
            w.put_str16("error code", &code)?;
            w.put_str16("error description", &fields.error_description)?;
            w.put_bytes32("error details", &details_bytes(&fields.error_details))?;
        }
    }
    Ok(w.finish())
}

fn decode_compact(body: &[u8]) -> Result<Fields, BinaryError> {
    let mut r = ByteReader::new(body);
    let message_type = parse_message_type(r.read_u8()?)?;
    let request_id = RequestId::new(r.read_str16("request id")?);
    let mut fields = Fields {
        message_type: Some(message_type),
        request_id: Some(request_id.clone()),
        ..Default::default()
    };
    match read_compact_body(&mut r, message_type, &mut fields) {
        Ok(()) => Ok(fields),
        Err(e) => Err(e.in_request(&request_id, fields.action.as_deref())),
    }
}

fn read_compact_body(
    r: &mut ByteReader<'_>,
    message_type: MessageType,
    fields: &mut Fields,
) -> Result<(), BinaryError> {
    let destination = r.read_str16("destination")?;
    fields.destination = (!destination.is_empty()).then(|| NetworkingNodeId::new(destination));
    let hop_count = r.read_u16()?;
    fields.hops = (0..hop_count)
        .map(|_| r.read_str16("network hop").map(NetworkingNodeId::new))
        .collect::<Result<Vec<_>, _>>()?;

    match message_type {
        MessageType::Call | MessageType::Send => {
            fields.action = Some(r.read_str16("action")?);
            fields.payload = r.read_bytes32()?.to_vec();
        }
        MessageType::CallResult => {
            fields.payload = r.read_bytes32()?.to_vec();
        }
        MessageType::CallError | MessageType::CallResultError => {
            fields.error_code = Some(ErrorCode::parse_lenient(&r.read_str16("error code")?));
            fields.error_description = r.read_str16("error description")?;
            fields.error_details = Some(parse_details(r.read_bytes32()?)?);
        }
    }
    Ok(())
}

fn encode_extensible(fields: &Fields) -> Result<Vec<u8>, BinaryError> {
    let message_type = fields.message_type.ok_or(BinaryError::MissingField("message type"))?;
    let mut w = TlvWriter::with_format(BinaryFormat::Extensible);
    w.record(tag::MESSAGE_TYPE, &[message_type.id()])?;
    if let Some(request_id) = &fields.request_id {
        w.record_str(tag::REQUEST_ID, request_id.as_str())?;
    }
    if let Some(destination) = &fields.destination {
        w.record_str(tag::DESTINATION, destination.as_str())?;
    }
    for hop in &fields.hops {
        w.record_str(tag::NETWORK_HOP, hop.as_str())?;
    }
    if let Some(action) = &fields.action {
        w.record_str(tag::ACTION, action)?;
    }
    match message_type {
        MessageType::CallError | MessageType::CallResultError => {
            if let Some(code) = fields.error_code {
                w.record_str(tag::ERROR_CODE, &code.to_string())?;
            }
            w.record_str(tag::ERROR_DESCRIPTION, &fields.error_description)?;
            w.record(tag::ERROR_DETAILS, &details_bytes(&fields.error_details))?;
        }
        _ => {
            w.record(tag::PAYLOAD, &fields.payload)?;
        }
    }
    Ok(w.finish())
}

fn decode_extensible(body: &[u8]) -> Result<Fields, BinaryError> {
    let mut fields = Fields::default();
    match read_extensible_records(body, &mut fields) {
        Ok(()) => Ok(fields),
        Err(e) => Err(match &fields.request_id {
            Some(request_id) => e.in_request(request_id, fields.action.as_deref()),
            None => e,
        }),
    }
}

fn read_extensible_records(body: &[u8], fields: &mut Fields) -> Result<(), BinaryError> {
    for record in TlvReader::new(body) {
        let record = record?;
        match record.tag {
            tag::MESSAGE_TYPE => {
                let id = record
                    .value
                    .first()
                    .copied()
                    .ok_or(BinaryError::MissingField("message type"))?;
                fields.message_type = Some(parse_message_type(id)?);
            }
            tag::REQUEST_ID => {
                fields.request_id = Some(RequestId::new(utf8("request id", record.value)?))
            }
            tag::DESTINATION => {
                fields.destination = Some(NetworkingNodeId::new(utf8("destination", record.value)?))
            }
            tag::NETWORK_HOP => fields
                .hops
                .push(NetworkingNodeId::new(utf8("network hop", record.value)?)),
            tag::ACTION => fields.action = Some(utf8("action", record.value)?),
            tag::PAYLOAD => fields.payload = record.value.to_vec(),
            tag::ERROR_CODE => {
                fields.error_code =
                    Some(ErrorCode::parse_lenient(&utf8("error code", record.value)?))
            }
            tag::ERROR_DESCRIPTION => {
                fields.error_description = utf8("error description", record.value)?
            }
            tag::ERROR_DETAILS => fields.error_details = Some(parse_details(record.value)?),
            unknown => {
                tracing::trace!(tag = unknown, len = record.value.len(), "skipping unknown TLV tag")
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::DecodeError;
    use rstest::rstest;
    use serde_json::json;

    fn request() -> Envelope {
        Envelope::BinaryRequest(
            BinaryRequestMessage::new("b-1".into(), "BinaryDataTransfer", vec![1, 2, 3])
                .to("CSMS".into())
                .with_path(NetworkPath::from_hops(vec!["CS001".into(), "NN01".into()])),
        )
    }

    #[rstest]
    #[case(BinaryFormat::Compact)]
    #[case(BinaryFormat::Extensible)]
    fn test_request_survives_both_layouts(#[case] format: BinaryFormat) {
        let original = request();
        let bytes = encode_envelope(&original, format).unwrap();
        assert_eq!(&bytes[..2], &format.tag().to_be_bytes());
        assert_eq!(decode_envelope(&bytes).unwrap(), original);
    }

    #[test]
    fn test_error_details_travel_as_json() {
        let error = ErrorMessage::new("b-2".into(), ErrorCode::SecurityError, "bad signature")
            .with_details(json!({"keyId": "k1"}));
        let original = Envelope::BinaryResponseError(error);
        let bytes = encode_envelope(&original, BinaryFormat::Compact).unwrap();
        match decode_envelope(&bytes).unwrap() {
            Envelope::BinaryResponseError(e) => {
                assert_eq!(e.error_code, ErrorCode::SecurityError);
                assert_eq!(e.details["keyId"], "k1");
            }
            other => panic!("expected BinaryResponseError, got {}", other.kind()),
        }
    }

    #[test]
    fn test_extensible_reader_skips_unknown_tags() {
        let mut w = TlvWriter::with_format(BinaryFormat::Extensible);
        w.record(tag::MESSAGE_TYPE, &[3]).unwrap();
        w.record(0x7F00, b"from the future").unwrap();
        w.record_str(tag::REQUEST_ID, "b-3").unwrap();
        w.record(tag::PAYLOAD, &[9]).unwrap();

        match decode_envelope(&w.finish()).unwrap() {
            Envelope::BinaryResponse(m) => {
                assert_eq!(m.request_id.as_str(), "b-3");
                assert_eq!(m.payload, vec![9]);
            }
            other => panic!("expected BinaryResponse, got {}", other.kind()),
        }
    }

    #[test]
    fn test_missing_request_id_is_reported() {
        let mut w = TlvWriter::with_format(BinaryFormat::Extensible);
        w.record(tag::MESSAGE_TYPE, &[3]).unwrap();
        assert_eq!(
            decode_envelope(&w.finish()).unwrap_err(),
            BinaryError::MissingField("request id")
        );
    }

    #[test]
    fn test_missing_action_keeps_request_id_in_error_reply() {
        let mut w = TlvWriter::with_format(BinaryFormat::Extensible);
        w.record(tag::MESSAGE_TYPE, &[2]).unwrap();
        w.record_str(tag::REQUEST_ID, "b-4").unwrap();
        w.record(tag::PAYLOAD, &[1]).unwrap();

        let err = decode_envelope(&w.finish()).unwrap_err();
        assert!(matches!(&err, BinaryError::InRequest { source, .. }
            if **source == BinaryError::MissingField("action")));

        let reply = DecodeError::from(err).to_request_error();
        assert_eq!(reply.request_id.as_str(), "b-4");
        assert_eq!(reply.error_code, ErrorCode::FormatViolation);
    }

    #[test]
    fn test_truncated_compact_payload_keeps_request_id_and_action() {
        let bytes = encode_envelope(&request(), BinaryFormat::Compact).unwrap();
        let err = DecodeError::from(decode_envelope(&bytes[..bytes.len() - 2]).unwrap_err());

        assert!(matches!(err, DecodeError::FormationViolation { .. }));
        assert_eq!(err.request_id(), Some(&RequestId::from("b-1")));
        assert_eq!(err.action(), Some("BinaryDataTransfer"));
        assert_eq!(err.to_request_error().request_id.as_str(), "b-1");
    }

    #[test]
    fn test_json_envelopes_are_not_binary_framed() {
        let json_request = Envelope::JsonRequest(crate::envelope::JsonRequestMessage::new(
            "j-1".into(),
            "Heartbeat",
            json!({}),
        ));
        assert!(encode_envelope(&json_request, BinaryFormat::Compact).is_err());
    }
}
