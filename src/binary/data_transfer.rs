//! BinaryDataTransfer payload layouts
//!
//! Compact request: `vendor(str16) || message id(opt) || data(bytes32) ||
//! count(u16) || (len(u16) || signature)*`.
//! Compact response: `status(str16) || additional info(opt) || data(bytes32)`.
//!
//! `opt` is a presence byte followed by a str16 when the byte is `1`, so an
//! empty string and an absent field stay distinct.

use super::{utf8, BinaryError, BinaryFormat, ByteReader, ByteWriter, TlvReader, TlvWriter};
use crate::ocpp::messages::{
    BinaryDataTransferRequest, BinaryDataTransferResponse, DataTransferStatus,
};

mod tag {
    pub const VENDOR_ID: u16 = 0x0001;
    pub const MESSAGE_ID: u16 = 0x0002;
    pub const DATA: u16 = 0x0003;
    pub const SIGNATURE: u16 = 0x0004;
    pub const STATUS: u16 = 0x0005;
    pub const ADDITIONAL_INFO: u16 = 0x0006;
}

fn parse_status(name: &str) -> Result<DataTransferStatus, BinaryError> {
    name.parse().map_err(|_| BinaryError::InvalidField {
        field: "status",
        reason: format!("unknown data transfer status {name:?}"),
    })
}

impl BinaryDataTransferRequest {
    pub fn to_binary(&self, format: BinaryFormat) -> Result<Vec<u8>, BinaryError> {
        match format {
            BinaryFormat::Compact => {
                let mut w = ByteWriter::with_format(format);
                w.put_str16("vendor id", &self.vendor_id)?;
                w.put_opt_str16("message id", self.message_id.as_deref())?;
                w.put_bytes32("data", &self.data)?;
                if self.signatures.len() > u16::MAX as usize {
                    return Err(BinaryError::FieldTooLong {
                        field: "signatures",
                        len: self.signatures.len(),
                        max: u16::MAX as usize,
                    });
                }
                w.put_u16(self.signatures.len() as u16);
                for signature in &self.signatures {
                    if signature.len() > u16::MAX as usize {
                        return Err(BinaryError::FieldTooLong {
                            field: "signature",
                            len: signature.len(),
                            max: u16::MAX as usize,
                        });
                    }
                    w.put_u16(signature.len() as u16).put_raw(signature);
                }
                Ok(w.finish())
            }
            BinaryFormat::Extensible => {
                let mut w = TlvWriter::with_format(format);
                w.record_str(tag::VENDOR_ID, &self.vendor_id)?;
                if let Some(message_id) = &self.message_id {
                    w.record_str(tag::MESSAGE_ID, message_id)?;
                }
                w.record(tag::DATA, &self.data)?;
                for signature in &self.signatures {
                    w.record(tag::SIGNATURE, signature)?;
                }
                Ok(w.finish())
            }
        }
    }

    pub fn from_binary(data: &[u8]) -> Result<Self, BinaryError> {
        let (format, body) = BinaryFormat::read_header(data)?;
        match format {
            BinaryFormat::Compact => {
                let mut r = ByteReader::new(body);
                let vendor_id = r.read_str16("vendor id")?;
                let message_id = r.read_opt_str16("message id")?;
                let data = r.read_bytes32()?.to_vec();
                let count = r.read_u16()?;
                let mut signatures = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let len = r.read_u16()? as usize;
                    signatures.push(r.take(len)?.to_vec());
                }
                Ok(Self {
                    vendor_id,
                    message_id,
                    data,
                    signatures,
                })
            }
            BinaryFormat::Extensible => {
                let mut vendor_id = None;
                let mut request = Self {
                    vendor_id: String::new(),
                    message_id: None,
                    data: Vec::new(),
                    signatures: Vec::new(),
                };
                for record in TlvReader::new(body) {
                    let record = record?;
                    match record.tag {
                        tag::VENDOR_ID => vendor_id = Some(utf8("vendor id", record.value)?),
                        tag::MESSAGE_ID => {
                            request.message_id = Some(utf8("message id", record.value)?)
                        }
                        tag::DATA => request.data = record.value.to_vec(),
                        tag::SIGNATURE => request.signatures.push(record.value.to_vec()),
                        unknown => tracing::trace!(tag = unknown, "skipping unknown TLV tag"),
                    }
                }
                request.vendor_id = vendor_id.ok_or(BinaryError::MissingField("vendor id"))?;
                Ok(request)
            }
        }
    }
}

impl BinaryDataTransferResponse {
    pub fn to_binary(&self, format: BinaryFormat) -> Result<Vec<u8>, BinaryError> {
        match format {
            BinaryFormat::Compact => {
                let mut w = ByteWriter::with_format(format);
                w.put_str16("status", &self.status.to_string())?;
                w.put_opt_str16("additional info", self.additional_info.as_deref())?;
                w.put_bytes32("data", &self.data)?;
                Ok(w.finish())
            }
            BinaryFormat::Extensible => {
                let mut w = TlvWriter::with_format(format);
                w.record_str(tag::STATUS, &self.status.to_string())?;
                if let Some(info) = &self.additional_info {
                    w.record_str(tag::ADDITIONAL_INFO, info)?;
                }
                w.record(tag::DATA, &self.data)?;
                Ok(w.finish())
            }
        }
    }

    pub fn from_binary(data: &[u8]) -> Result<Self, BinaryError> {
        let (format, body) = BinaryFormat::read_header(data)?;
        match format {
            BinaryFormat::Compact => {
                let mut r = ByteReader::new(body);
                let status = parse_status(&r.read_str16("status")?)?;
                let additional_info = r.read_opt_str16("additional info")?;
                let data = r.read_bytes32()?.to_vec();
                Ok(Self {
                    status,
                    additional_info,
                    data,
                })
            }
            BinaryFormat::Extensible => {
                let mut status = None;
                let mut additional_info = None;
                let mut data = Vec::new();
                for record in TlvReader::new(body) {
                    let record = record?;
                    match record.tag {
                        tag::STATUS => status = Some(parse_status(&utf8("status", record.value)?)?),
                        tag::ADDITIONAL_INFO => {
                            additional_info = Some(utf8("additional info", record.value)?)
                        }
                        tag::DATA => data = record.value.to_vec(),
                        unknown => tracing::trace!(tag = unknown, "skipping unknown TLV tag"),
                    }
                }
                Ok(Self {
                    status: status.ok_or(BinaryError::MissingField("status"))?,
                    additional_info,
                    data,
                })
            }
        }
    }
}
