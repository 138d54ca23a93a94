//! Response construction.

use uuid::Uuid;

use super::wire::{
    response_flags, tlv, truncate_utf8, ByteReader, ByteWriter, ParseError, MAX_PAYLOAD,
    PROTOCOL_VERSION, RESPONSE_HEADER_SIZE, RESPONSE_MAGIC, TLV_HEADER_SIZE,
};
use crate::auth::ChallengeToken;

/// Player names in list entries are capped so a single entry always fits a page.
pub const MAX_PLAYER_NAME_BYTES: usize = 255;

const CHALLENGE_RESPONSE_SIZE: usize = 48;
const PLAYER_LIST_COUNTS_SIZE: usize = 12;
const PLAYER_ENTRY_FIXED_SIZE: usize = 2 + 16;

/// Contents of a SERVER_INFO block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub motd: String,
    pub player_count: u32,
    pub max_players: u32,
    pub version: String,
    pub protocol_version: u32,
    pub protocol_hash: String,
    /// Advertised host and port.
    pub address: Option<(String, u16)>,
}

/// One player in a PLAYER_LIST block.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PlayerEntry {
    pub uuid: Uuid,
    pub username: String,
}

impl PlayerEntry {
    pub fn new(uuid: Uuid, username: impl Into<String>) -> Self {
        Self {
            uuid,
            username: username.into(),
        }
    }

    fn wire_name(&self) -> &str {
        truncate_utf8(&self.username, MAX_PLAYER_NAME_BYTES)
    }

    fn wire_size(&self) -> usize {
        PLAYER_ENTRY_FIXED_SIZE + self.wire_name().len()
    }
}

/// A built PLAYERS response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayersPage {
    pub packet: Vec<u8>,
    pub returned: u32,
    pub has_more: bool,
}

// =============================================================================
// BUILDERS
// =============================================================================

/// `magic | type | token | reserved(7)`.
pub fn challenge_response(token: &ChallengeToken) -> Vec<u8> {
    let mut out = Vec::with_capacity(CHALLENGE_RESPONSE_SIZE);
    out.extend_from_slice(RESPONSE_MAGIC);
    out.push(0x00);
    out.extend_from_slice(token);
    out.resize(CHALLENGE_RESPONSE_SIZE, 0);
    out
}

/// BASIC response: one SERVER_INFO block.
///
/// `HAS_ADDRESS` is added when `info` carries an address.
pub fn basic_response(request_id: u32, flags: u16, info: &ServerInfo) -> Vec<u8> {
    let mut payload = ByteWriter::new();
    payload.put_tlv(tlv::SERVER_INFO, &encode_server_info(info));
    frame(request_id, flags | address_flag(info), &payload.into_inner())
}

/// BASIC-shaped response flagged `AUTH_REQUIRED`.
pub fn auth_required_response(request_id: u32, info: &ServerInfo) -> Vec<u8> {
    basic_response(request_id, response_flags::AUTH_REQUIRED, info)
}

/// PLAYERS response starting at `offset`.
///
/// Entries are appended in slice order until the next one would exceed the
/// payload budget, at which point `HAS_MORE_PLAYERS` is set.
pub fn players_response(
    request_id: u32,
    flags: u16,
    players: &[PlayerEntry],
    offset: u32,
) -> PlayersPage {
    let total = players.len();
    let start = (offset as usize).min(total);
    let mut budget = MAX_PAYLOAD - TLV_HEADER_SIZE - PLAYER_LIST_COUNTS_SIZE;

    let mut entries = ByteWriter::new();
    let mut returned = 0u32;
    let mut has_more = false;
    for player in &players[start..] {
        let size = player.wire_size();
        if size > budget {
            has_more = true;
            break;
        }
        entries.put_string(player.wire_name());
        entries.put_uuid(&player.uuid);
        budget -= size;
        returned += 1;
    }

    let mut body = ByteWriter::with_capacity(PLAYER_LIST_COUNTS_SIZE + entries.len());
    body.put_u32(total as u32);
    body.put_u32(returned);
    body.put_u32(start as u32);
    body.put_bytes(&entries.into_inner());

    let mut payload = ByteWriter::new();
    payload.put_tlv(tlv::PLAYER_LIST, &body.into_inner());

    let flags = if has_more {
        flags | response_flags::HAS_MORE_PLAYERS
    } else {
        flags
    };

    PlayersPage {
        packet: frame(request_id, flags, &payload.into_inner()),
        returned,
        has_more,
    }
}

fn address_flag(info: &ServerInfo) -> u16 {
    if info.address.is_some() {
        response_flags::HAS_ADDRESS
    } else {
        0
    }
}

fn encode_server_info(info: &ServerInfo) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_string(&info.name);
    w.put_string(&info.motd);
    w.put_u32(info.player_count);
    w.put_u32(info.max_players);
    w.put_string(&info.version);
    w.put_u32(info.protocol_version);
    w.put_string(&info.protocol_hash);
    if let Some((host, port)) = &info.address {
        w.put_string(host);
        w.put_u16(*port);
    }
    w.into_inner()
}

fn frame(request_id: u32, flags: u16, payload: &[u8]) -> Vec<u8> {
    let len = payload.len().min(u16::MAX as usize);
    let mut w = ByteWriter::with_capacity(RESPONSE_HEADER_SIZE + len);
    w.put_bytes(RESPONSE_MAGIC);
    w.put_u8(PROTOCOL_VERSION);
    w.put_u16(flags);
    w.put_u32(request_id);
    w.put_u16(len as u16);
    w.put_bytes(&payload[..len]);
    w.into_inner()
}

// =============================================================================
// DECODING (client side)
// =============================================================================

/// A PLAYER_LIST block as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerListBlock {
    pub total: u32,
    pub offset: u32,
    pub players: Vec<PlayerEntry>,
}

/// A decoded query response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedResponse {
    pub version: u8,
    pub flags: u16,
    pub request_id: u32,
    pub server_info: Option<ServerInfo>,
    pub player_list: Option<PlayerListBlock>,
}

impl DecodedResponse {
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Decode a query response. Challenge responses are not handled here.
pub fn decode_response(data: &[u8]) -> Result<DecodedResponse, ParseError> {
    let mut r = ByteReader::new(data);
    if r.take(RESPONSE_MAGIC.len())? != RESPONSE_MAGIC {
        return Err(ParseError::BadMagic);
    }
    let version = r.u8()?;
    let flags = r.u16()?;
    let request_id = r.u32()?;
    let payload_len = r.u16()? as usize;
    let mut payload = ByteReader::new(r.take(payload_len)?);

    let mut response = DecodedResponse {
        version,
        flags,
        request_id,
        server_info: None,
        player_list: None,
    };

    while payload.remaining() > 0 {
        let tlv_type = payload.u16()?;
        let len = payload.u16()? as usize;
        let mut body = ByteReader::new(payload.take(len)?);
        match tlv_type {
            tlv::SERVER_INFO => {
                let has_address = flags & response_flags::HAS_ADDRESS != 0;
                response.server_info = Some(decode_server_info(&mut body, has_address)?);
            }
            tlv::PLAYER_LIST => {
                let total = body.u32()?;
                let returned = body.u32()?;
                let offset = body.u32()?;
                let mut players = Vec::with_capacity(returned as usize);
                for _ in 0..returned {
                    let username = body.string()?;
                    let uuid = body.uuid()?;
                    players.push(PlayerEntry { uuid, username });
                }
                response.player_list = Some(PlayerListBlock {
                    total,
                    offset,
                    players,
                });
            }
            other => return Err(ParseError::UnknownTlv(other)),
        }
    }

    Ok(response)
}

fn decode_server_info(r: &mut ByteReader<'_>, has_address: bool) -> Result<ServerInfo, ParseError> {
    let name = r.string()?;
    let motd = r.string()?;
    let player_count = r.u32()?;
    let max_players = r.u32()?;
    let version = r.string()?;
    let protocol_version = r.u32()?;
    let protocol_hash = r.string()?;
    let address = if has_address && r.remaining() > 0 {
        let host = r.string()?;
        Some((host, r.u16()?))
    } else {
        None
    };
    Ok(ServerInfo {
        name,
        motd,
        player_count,
        max_players,
        version,
        protocol_version,
        protocol_hash,
        address,
    })
}
