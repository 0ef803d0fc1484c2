//! Binary framing
//!
//! Every binary frame starts with a big-endian `u16` format tag:
//!
//! - `0x0001` **Compact**: fixed field order, length-prefixed strings
//!   (`u16` length) and blobs (`u32` length)
//! - `0x0002` **Extensible**: repeated `tag(u16) || length(u32) || value`
//!   records; readers skip tags they do not know
//!
//! The same two layouts are used for binary envelopes ([`frame`]) and for the
//! BinaryDataTransfer payload ([`data_transfer`]).

pub mod data_transfer;
pub mod frame;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::ocpp::RequestId;

pub use frame::{decode_envelope, encode_envelope};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BinaryError {
    #[error("truncated binary data: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("unknown binary format tag {0:#06x}")]
    UnknownFormat(u16),

    #[error("field {field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Failure inside a frame whose RequestId was already read
    #[error("{source} in request {request_id}")]
    InRequest {
        request_id: RequestId,
        action: Option<String>,
        source: Box<BinaryError>,
    },
}

impl BinaryError {
    /// Attach the RequestId (and action, once read) of the failing frame.
    pub fn in_request(self, request_id: &RequestId, action: Option<&str>) -> Self {
        match self {
            Self::InRequest { .. } => self,
            source => Self::InRequest {
                request_id: request_id.clone(),
                action: action.map(str::to_string),
                source: Box::new(source),
            },
        }
    }
}

/// Layout selector written as the first two bytes of a binary frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum BinaryFormat {
    Compact = 0x0001,
    Extensible = 0x0002,
}

impl BinaryFormat {
    pub fn tag(self) -> u16 {
        self as u16
    }

    pub fn from_tag(tag: u16) -> Result<Self, BinaryError> {
        match tag {
            0x0001 => Ok(Self::Compact),
            0x0002 => Ok(Self::Extensible),
            other => Err(BinaryError::UnknownFormat(other)),
        }
    }

    /// Split a frame into its format and body.
    pub fn read_header(data: &[u8]) -> Result<(Self, &[u8]), BinaryError> {
        let mut reader = ByteReader::new(data);
        let format = Self::from_tag(reader.read_u16()?)?;
        Ok((format, reader.rest()))
    }
}

/// Big-endian cursor over a borrowed buffer
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], BinaryError> {
        if self.data.len() - self.pos < len {
            return Err(BinaryError::Truncated {
                offset: self.pos,
                needed: len,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, BinaryError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, BinaryError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, BinaryError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    /// `u16` length followed by UTF-8 text.
    pub fn read_str16(&mut self, field: &'static str) -> Result<String, BinaryError> {
        let len = self.read_u16()? as usize;
        utf8(field, self.take(len)?)
    }

    /// Presence byte (`0` absent, `1` present) followed by a str16 when present.
    pub fn read_opt_str16(&mut self, field: &'static str) -> Result<Option<String>, BinaryError> {
        match self.read_u8()? {
            0 => Ok(None),
            1 => self.read_str16(field).map(Some),
            other => Err(BinaryError::InvalidField {
                field,
                reason: format!("invalid presence flag {other}"),
            }),
        }
    }

    /// `u32` length followed by raw bytes.
    pub fn read_bytes32(&mut self) -> Result<&'a [u8], BinaryError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }
}

pub(crate) fn utf8(field: &'static str, bytes: &[u8]) -> Result<String, BinaryError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| BinaryError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

/// Big-endian append-only buffer
#[derive(Debug, Clone, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(format: BinaryFormat) -> Self {
        let mut writer = Self::new();
        writer.put_u16(format.tag());
        writer
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        let mut bytes = [0u8; 2];
        BigEndian::write_u16(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        let mut bytes = [0u8; 4];
        BigEndian::write_u32(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
        self
    }

    pub fn put_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn put_str16(&mut self, field: &'static str, value: &str) -> Result<&mut Self, BinaryError> {
        let len = checked_len(field, value.len(), u16::MAX as usize)?;
        self.put_u16(len as u16);
        Ok(self.put_raw(value.as_bytes()))
    }

    pub fn put_opt_str16(
        &mut self,
        field: &'static str,
        value: Option<&str>,
    ) -> Result<&mut Self, BinaryError> {
        match value {
            Some(value) => {
                self.put_u8(1);
                self.put_str16(field, value)
            }
            None => Ok(self.put_u8(0)),
        }
    }

    pub fn put_bytes32(&mut self, field: &'static str, value: &[u8]) -> Result<&mut Self, BinaryError> {
        let len = checked_len(field, value.len(), u32::MAX as usize)?;
        self.put_u32(len as u32);
        Ok(self.put_raw(value))
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn checked_len(field: &'static str, len: usize, max: usize) -> Result<usize, BinaryError> {
    if len > max {
        return Err(BinaryError::FieldTooLong { field, len, max });
    }
    Ok(len)
}

/// One tag-length-value record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvRecord<'a> {
    pub tag: u16,
    pub value: &'a [u8],
}

/// Writer for Extensible bodies
#[derive(Debug, Clone, Default)]
pub struct TlvWriter {
    inner: ByteWriter,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(format: BinaryFormat) -> Self {
        Self {
            inner: ByteWriter::with_format(format),
        }
    }

    pub fn record(&mut self, tag: u16, value: &[u8]) -> Result<&mut Self, BinaryError> {
        self.inner.put_u16(tag);
        self.inner.put_bytes32("tlv value", value)?;
        Ok(self)
    }

    pub fn record_str(&mut self, tag: u16, value: &str) -> Result<&mut Self, BinaryError> {
        self.record(tag, value.as_bytes())
    }

    pub fn finish(self) -> Vec<u8> {
        self.inner.finish()
    }
}

/// Iterator over the records of an Extensible body
#[derive(Debug, Clone)]
pub struct TlvReader<'a> {
    inner: ByteReader<'a>,
    failed: bool,
}

impl<'a> TlvReader<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self {
            inner: ByteReader::new(body),
            failed: false,
        }
    }

    fn next_record(&mut self) -> Result<TlvRecord<'a>, BinaryError> {
        let tag = self.inner.read_u16()?;
        let value = self.inner.read_bytes32()?;
        Ok(TlvRecord { tag, value })
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = Result<TlvRecord<'a>, BinaryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.inner.is_empty() {
            return None;
        }
        let record = self.next_record();
        self.failed = record.is_err();
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_format_header() {
        let frame = [0x00, 0x02, 0xAA];
        let (format, body) = BinaryFormat::read_header(&frame).unwrap();
        assert_eq!(format, BinaryFormat::Extensible);
        assert_eq!(body, &[0xAA]);

        assert_eq!(
            BinaryFormat::read_header(&[0x00, 0x09]).unwrap_err(),
            BinaryError::UnknownFormat(9)
        );
        assert!(matches!(
            BinaryFormat::read_header(&[0x00]).unwrap_err(),
            BinaryError::Truncated { .. }
        ));
    }

    #[test]
    fn test_tlv_layout_is_big_endian() {
        let mut writer = TlvWriter::new();
        writer.record(0x0102, b"hi").unwrap();
        assert_eq!(writer.finish(), vec![0x01, 0x02, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_truncated_record_stops_iteration() {
        let data = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, b'a'];
        let mut reader = TlvReader::new(&data);
        assert!(matches!(
            reader.next(),
            Some(Err(BinaryError::Truncated { .. }))
        ));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_str16_rejects_invalid_utf8() {
        let data = [0x00, 0x02, 0xFF, 0xFE];
        let err = ByteReader::new(&data).read_str16("vendor id").unwrap_err();
        assert!(matches!(err, BinaryError::InvalidField { field: "vendor id", .. }));
    }

    #[test]
    fn test_optional_str16_keeps_empty_apart_from_absent() {
        let mut writer = ByteWriter::new();
        writer.put_opt_str16("message id", Some("")).unwrap();
        writer.put_opt_str16("message id", None).unwrap();
        let bytes = writer.finish();
        assert_eq!(bytes, vec![1, 0, 0, 0]);

        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_opt_str16("message id").unwrap(), Some(String::new()));
        assert_eq!(reader.read_opt_str16("message id").unwrap(), None);
        assert!(reader.is_empty());

        let err = ByteReader::new(&[7]).read_opt_str16("message id").unwrap_err();
        assert!(matches!(err, BinaryError::InvalidField { field: "message id", .. }));
    }

    proptest! {
        #[test]
        fn tlv_reader_yields_written_records(
            records in proptest::collection::vec(
                (any::<u16>(), proptest::collection::vec(any::<u8>(), 0..64)),
                0..16,
            )
        ) {
            let mut writer = TlvWriter::new();
            for (tag, value) in &records {
                writer.record(*tag, value).unwrap();
            }
            let bytes = writer.finish();

            let read: Vec<(u16, Vec<u8>)> = TlvReader::new(&bytes)
                .map(|r| r.map(|r| (r.tag, r.value.to_vec())))
                .collect::<Result<_, _>>()
                .unwrap();
            prop_assert_eq!(read, records);
        }

        #[test]
        fn tlv_reader_never_panics_on_garbage(data in proptest::collection::vec(any::<u8>(), 0..128)) {
            for record in TlvReader::new(&data) {
                if record.is_err() {
                    break;
                }
            }
        }
    }
}
