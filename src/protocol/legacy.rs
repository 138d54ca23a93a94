//! Legacy `HYQUERY` protocol.
//!
//! Unauthenticated, unpaginated replies kept for older monitoring tools. Each
//! reply ends with capability flags so newer clients can discover the
//! challenge-based protocol. FULL replies list as many players, then
//! plugins, as fit in one datagram.

use super::response::{PlayerEntry, ServerInfo};
use super::wire::{truncate_utf8, ByteWriter, PROTOCOL_VERSION, SAFE_MTU};

/// Capability flags plus protocol version.
const TRAILER_SIZE: usize = 3;
/// Player and plugin count fields.
const LIST_COUNTS_SIZE: usize = 8;

pub const LEGACY_REQUEST_MAGIC: &[u8; 8] = b"HYQUERY\0";
pub const LEGACY_RESPONSE_MAGIC: &[u8; 8] = b"HYREPLY\0";

/// Capability bits in the reply trailer.
pub mod capabilities {
    pub const V2_PROTOCOL: u16 = 0x01;
    pub const NETWORK_MODE: u16 = 0x02;
}

/// Legacy query kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyQuery {
    Basic = 0x00,
    Full = 0x01,
}

/// A plugin advertised in FULL replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEntry {
    pub id: String,
    pub version: String,
    pub enabled: bool,
}

/// True when `data` is a legacy request (magic plus type byte).
pub fn is_legacy_request(data: &[u8]) -> bool {
    data.len() > LEGACY_REQUEST_MAGIC.len() && data.starts_with(LEGACY_REQUEST_MAGIC)
}

/// Decode the query kind. Unknown type bytes are treated as BASIC.
pub fn parse_legacy_request(data: &[u8]) -> Option<LegacyQuery> {
    if !is_legacy_request(data) {
        return None;
    }
    match data[LEGACY_REQUEST_MAGIC.len()] {
        0x01 => Some(LegacyQuery::Full),
        _ => Some(LegacyQuery::Basic),
    }
}

/// Inputs to a legacy reply.
#[derive(Debug, Clone, Copy)]
pub struct LegacyReply<'a> {
    pub info: &'a ServerInfo,
    /// Game port, always present in legacy replies.
    pub port: u16,
    pub players: &'a [PlayerEntry],
    pub plugins: &'a [PluginEntry],
    /// Whether counts and players are fleet-wide.
    pub network: bool,
}

/// Build a reply for `query`.
pub fn legacy_response(query: LegacyQuery, reply: &LegacyReply<'_>) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_bytes(LEGACY_RESPONSE_MAGIC);
    w.put_u8(query as u8);

    let info = reply.info;
    w.put_string(&info.name);
    w.put_string(&info.motd);
    w.put_i32(clamp_i32(info.player_count));
    w.put_i32(clamp_i32(info.max_players));
    w.put_u16(reply.port);
    w.put_string(&info.version);
    w.put_i32(clamp_i32(info.protocol_version));
    w.put_string(&info.protocol_hash);

    if query == LegacyQuery::Full {
        let mut budget = SAFE_MTU.saturating_sub(w.len() + LIST_COUNTS_SIZE + TRAILER_SIZE);
        let players = fitting(reply.players, &mut budget, |p| string_size(&p.username) + 16);
        let plugins = fitting(reply.plugins, &mut budget, |p| {
            string_size(&p.id) + string_size(&p.version) + 1
        });

        w.put_i32(clamp_i32(players.len() as u32));
        for player in players {
            w.put_string(&player.username);
            w.put_uuid(&player.uuid);
        }

        w.put_i32(clamp_i32(plugins.len() as u32));
        for plugin in plugins {
            w.put_string(&plugin.id);
            w.put_string(&plugin.version);
            w.put_u8(u8::from(plugin.enabled));
        }
    }

    let mut caps = capabilities::V2_PROTOCOL;
    if reply.network {
        caps |= capabilities::NETWORK_MODE;
    }
    w.put_u16(caps);
    w.put_u8(PROTOCOL_VERSION);

    w.into_inner()
}

/// Longest prefix of `items` whose encoded sizes fit in `budget`.
fn fitting<'a, T>(items: &'a [T], budget: &mut usize, size: impl Fn(&T) -> usize) -> &'a [T] {
    let mut taken = 0;
    for item in items {
        let needed = size(item);
        if needed > *budget {
            break;
        }
        *budget -= needed;
        taken += 1;
    }
    &items[..taken]
}

fn string_size(value: &str) -> usize {
    2 + truncate_utf8(value, u16::MAX as usize).len()
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
