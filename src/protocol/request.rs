//! Request parsing.
//!
//! Parsing is lenient about trailing fields: a request cut short after the
//! type byte still parses, with missing numeric fields read as zero and a
//! missing challenge token as `None`. The dispatcher drops requests without a
//! valid token, so leniency never yields an unauthenticated answer.

use super::wire::{request_flags, ByteWriter, ParseError, QueryType, REQUEST_MAGIC};
use crate::auth::{ChallengeToken, TOKEN_SIZE};

const TYPE_OFFSET: usize = 8;
const TOKEN_OFFSET: usize = 9;
const REQUEST_ID_OFFSET: usize = TOKEN_OFFSET + TOKEN_SIZE;
const FLAGS_OFFSET: usize = REQUEST_ID_OFFSET + 4;
const OFFSET_OFFSET: usize = FLAGS_OFFSET + 2;
const AUTH_OFFSET: usize = OFFSET_OFFSET + 4;

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Token request.
    Challenge,
    /// Authenticated query.
    Query(QueryRequest),
}

/// A non-challenge query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Raw type code as received.
    pub type_code: u8,
    pub challenge_token: Option<ChallengeToken>,
    pub request_id: u32,
    pub flags: u16,
    pub offset: u32,
    pub auth_token: Option<Vec<u8>>,
}

impl QueryRequest {
    /// Query with no auth token.
    pub fn new(query_type: QueryType, token: ChallengeToken, request_id: u32) -> Self {
        Self {
            type_code: query_type.code(),
            challenge_token: Some(token),
            request_id,
            flags: 0,
            offset: 0,
            auth_token: None,
        }
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<Vec<u8>>) -> Self {
        self.auth_token = Some(token.into());
        self.flags |= request_flags::HAS_AUTH_TOKEN;
        self
    }

    /// Effective query type. Unrecognised codes behave as `Basic`.
    pub fn query_type(&self) -> QueryType {
        match QueryType::from_code(self.type_code) {
            Some(QueryType::Challenge) | None => QueryType::Basic,
            Some(other) => other,
        }
    }

    /// Serialize, as a client would send it.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(AUTH_OFFSET + 2);
        w.put_bytes(REQUEST_MAGIC);
        w.put_u8(self.type_code);
        w.put_bytes(&self.challenge_token.unwrap_or([0u8; TOKEN_SIZE]));
        w.put_u32(self.request_id);
        w.put_u16(self.flags);
        w.put_u32(self.offset);
        if let Some(auth) = &self.auth_token {
            let len = auth.len().min(u16::MAX as usize);
            w.put_u16(len as u16);
            w.put_bytes(&auth[..len]);
        }
        w.into_inner()
    }
}

/// Challenge request bytes.
pub fn encode_challenge_request() -> Vec<u8> {
    let mut out = REQUEST_MAGIC.to_vec();
    out.push(QueryType::Challenge.code());
    out
}

/// True when `data` carries the v2 request magic.
pub fn is_query_request(data: &[u8]) -> bool {
    data.len() >= REQUEST_MAGIC.len() && &data[..REQUEST_MAGIC.len()] == REQUEST_MAGIC
}

/// Decode a request datagram.
pub fn parse_request(data: &[u8]) -> Result<Request, ParseError> {
    if !is_query_request(data) {
        return Err(ParseError::BadMagic);
    }
    if data.len() <= TYPE_OFFSET {
        return Err(ParseError::Truncated {
            needed: TYPE_OFFSET + 1,
            got: data.len(),
        });
    }

    let type_code = data[TYPE_OFFSET];
    if type_code == QueryType::Challenge.code() {
        return Ok(Request::Challenge);
    }

    let challenge_token = data
        .get(TOKEN_OFFSET..REQUEST_ID_OFFSET)
        .and_then(|slice| ChallengeToken::try_from(slice).ok());
    let request_id = read_u32(data, REQUEST_ID_OFFSET).unwrap_or(0);
    let flags = read_u16(data, FLAGS_OFFSET).unwrap_or(0);
    let offset = read_u32(data, OFFSET_OFFSET).unwrap_or(0);

    let auth_token = if flags & request_flags::HAS_AUTH_TOKEN != 0 {
        read_u16(data, AUTH_OFFSET).and_then(|len| {
            let start = AUTH_OFFSET + 2;
            data.get(start..start + len as usize).map(<[u8]>::to_vec)
        })
    } else {
        None
    };

    Ok(Request::Query(QueryRequest {
        type_code,
        challenge_token,
        request_id,
        flags,
        offset,
        auth_token,
    }))
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}
