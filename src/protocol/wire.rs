//! Framing constants and byte-level helpers.

use thiserror::Error;
use uuid::Uuid;

use crate::config::Endpoint;

/// Request magic.
pub const REQUEST_MAGIC: &[u8; 8] = b"ONEQUERY";
/// Response magic.
pub const RESPONSE_MAGIC: &[u8; 8] = b"ONEREPLY";
/// Protocol version carried in every response header.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Datagram size every response stays under.
pub const SAFE_MTU: usize = 1400;
/// magic(8) + version(1) + flags(2) + request_id(4) + payload_len(2).
pub const RESPONSE_HEADER_SIZE: usize = 17;
/// Payload budget, leaving headroom for IP/UDP overhead variations.
pub const MAX_PAYLOAD: usize = SAFE_MTU - RESPONSE_HEADER_SIZE - 50;
/// type(2) + length(2).
pub const TLV_HEADER_SIZE: usize = 4;

/// TLV block types.
pub mod tlv {
    pub const SERVER_INFO: u16 = 0x0001;
    pub const PLAYER_LIST: u16 = 0x0002;
}

/// Request flag bits.
pub mod request_flags {
    /// An auth block follows the offset field.
    pub const HAS_AUTH_TOKEN: u16 = 0x0001;
}

/// Response flag bits.
pub mod response_flags {
    pub const HAS_MORE_PLAYERS: u16 = 0x0001;
    pub const AUTH_REQUIRED: u16 = 0x0002;
    pub const IS_NETWORK: u16 = 0x0010;
    pub const HAS_ADDRESS: u16 = 0x0020;
}

/// Query type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryType {
    Challenge = 0x00,
    Basic = 0x01,
    Players = 0x02,
}

impl QueryType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(QueryType::Challenge),
            0x01 => Some(QueryType::Basic),
            0x02 => Some(QueryType::Players),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Endpoint gated by this query; challenges are never gated.
    pub fn endpoint(self) -> Option<Endpoint> {
        match self {
            QueryType::Challenge => None,
            QueryType::Basic => Some(Endpoint::Basic),
            QueryType::Players => Some(Endpoint::Players),
        }
    }
}

/// Wire decoding errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Bad magic")]
    BadMagic,
    #[error("Truncated packet: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("Unknown TLV type {0:#06x}")]
    UnknownTlv(u16),
    #[error("Invalid UTF-8 in string field")]
    InvalidString,
}

// =============================================================================
// WRITING
// =============================================================================

/// Append-only little-endian byte writer.
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    #[inline]
    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    #[inline]
    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// u16 length prefix then UTF-8 bytes, truncated to fit the prefix.
    pub fn put_string(&mut self, value: &str) {
        let bytes = truncate_utf8(value, u16::MAX as usize).as_bytes();
        self.put_u16(bytes.len() as u16);
        self.put_bytes(bytes);
    }

    /// Most significant half then least significant half, both big-endian.
    #[inline]
    pub fn put_uuid(&mut self, uuid: &Uuid) {
        self.buf.extend_from_slice(uuid.as_bytes());
    }

    /// Write a TLV block. Bodies longer than a u16 are cut.
    pub fn put_tlv(&mut self, tlv_type: u16, body: &[u8]) {
        let len = body.len().min(u16::MAX as usize);
        self.put_u16(tlv_type);
        self.put_u16(len as u16);
        self.put_bytes(&body[..len]);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Longest prefix of `value` within `max` bytes that ends on a char boundary.
pub fn truncate_utf8(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

// =============================================================================
// READING
// =============================================================================

/// Cursor over a received buffer.
#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.remaining() < n {
            return Err(ParseError::Truncated {
                needed: self.pos + n,
                got: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ParseError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, ParseError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32, ParseError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn string(&mut self) -> Result<String, ParseError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ParseError::InvalidString)
    }

    pub fn uuid(&mut self) -> Result<Uuid, ParseError> {
        let bytes = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(Uuid::from_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_budget() {
        assert_eq!(MAX_PAYLOAD, 1333);
    }

    #[test]
    fn test_query_type_codes() {
        assert_eq!(QueryType::from_code(0), Some(QueryType::Challenge));
        assert_eq!(QueryType::from_code(2), Some(QueryType::Players));
        assert_eq!(QueryType::from_code(0x7f), None);
        assert_eq!(QueryType::Challenge.endpoint(), None);
        assert_eq!(QueryType::Players.endpoint(), Some(Endpoint::Players));
    }

    #[test]
    fn test_uuid_halves_big_endian() {
        let uuid = Uuid::from_u64_pair(0x0102030405060708, 0x090a0b0c0d0e0f10);
        let mut w = ByteWriter::new();
        w.put_uuid(&uuid);
        assert_eq!(
            w.into_inner(),
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]
        );
    }

    #[test]
    fn test_string_is_length_prefixed() {
        let mut w = ByteWriter::new();
        w.put_string("hé");
        assert_eq!(w.into_inner(), vec![3, 0, b'h', 0xc3, 0xa9]);
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }

    #[test]
    fn test_reader_reports_truncation() {
        let mut r = ByteReader::new(&[1, 0]);
        assert_eq!(r.u16().unwrap(), 1);
        assert_eq!(r.u8(), Err(ParseError::Truncated { needed: 3, got: 2 }));
    }
}
