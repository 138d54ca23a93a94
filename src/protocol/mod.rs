//! Query Wire Protocol
//!
//! Binary request parsing and response construction for the UDP query
//! endpoint. Integers are little-endian except UUID halves.
//!
//! ```text
//! request  : "ONEQUERY" | type | challenge(32) | request_id | flags | offset | [auth]
//! response : "ONEREPLY" | version | flags | request_id | payload_len | TLV*
//! ```

pub mod legacy;
pub mod request;
pub mod response;
pub mod wire;

pub use request::{is_query_request, parse_request, QueryRequest, Request};
pub use response::{
    auth_required_response, basic_response, challenge_response, decode_response,
    players_response, DecodedResponse, PlayerEntry, PlayerListBlock, PlayersPage, ServerInfo,
};
pub use wire::{response_flags, ParseError, QueryType, PROTOCOL_VERSION};
