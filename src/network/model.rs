//! Fleet presence records and change events.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::core::{now_millis, time::age_millis};
use crate::protocol::PlayerEntry;
use crate::provider::DEFAULT_GAME_PORT;

/// One server's published state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    pub server_id: String,
    pub server_name: String,
    pub player_count: u32,
    pub max_players: u32,
    pub host: Option<String>,
    pub port: u16,
    /// Unix millis of the last heartbeat.
    pub last_heartbeat: i64,
}

impl ServerState {
    /// Fresh record with default capacity and port, heartbeat now.
    pub fn new(server_id: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            server_name: server_name.into(),
            player_count: 0,
            max_players: 100,
            host: None,
            port: DEFAULT_GAME_PORT,
            last_heartbeat: now_millis(),
        }
    }

    pub fn with_player_count(mut self, player_count: u32) -> Self {
        self.player_count = player_count;
        self
    }

    pub fn with_max_players(mut self, max_players: u32) -> Self {
        self.max_players = max_players;
        self
    }

    pub fn with_heartbeat(mut self, last_heartbeat: i64) -> Self {
        self.last_heartbeat = last_heartbeat;
        self
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.is_stale_at(now_millis(), timeout)
    }

    pub fn is_stale_at(&self, now: i64, timeout: Duration) -> bool {
        age_millis(self.last_heartbeat, now) > timeout.as_millis() as i64
    }
}

/// A player and where they are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub uuid: Uuid,
    pub username: String,
    pub server_id: String,
    pub server_name: String,
    /// Unix millis.
    pub join_time: i64,
}

impl PlayerInfo {
    /// Player joining `server_id` now.
    pub fn new(
        uuid: Uuid,
        username: impl Into<String>,
        server_id: impl Into<String>,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            uuid,
            username: username.into(),
            server_id: server_id.into(),
            server_name: server_name.into(),
            join_time: now_millis(),
        }
    }
}

impl From<&PlayerInfo> for PlayerEntry {
    fn from(player: &PlayerInfo) -> Self {
        PlayerEntry::new(player.uuid, player.username.clone())
    }
}

/// Immutable view of the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkSnapshot {
    pub servers: Vec<ServerState>,
    pub players: Vec<PlayerInfo>,
    /// Unix millis.
    pub captured_at: i64,
}

impl NetworkSnapshot {
    pub fn new(servers: Vec<ServerState>, players: Vec<PlayerInfo>) -> Self {
        Self {
            servers,
            players,
            captured_at: now_millis(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Sum of per-server player counts.
    pub fn total_player_count(&self) -> u32 {
        self.servers
            .iter()
            .fold(0u32, |sum, s| sum.saturating_add(s.player_count))
    }

    pub fn total_max_players(&self) -> u32 {
        self.servers
            .iter()
            .fold(0u32, |sum, s| sum.saturating_add(s.max_players))
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn server(&self, server_id: &str) -> Option<&ServerState> {
        self.servers.iter().find(|s| s.server_id == server_id)
    }

    pub fn player(&self, uuid: Uuid) -> Option<&PlayerInfo> {
        self.players.iter().find(|p| p.uuid == uuid)
    }

    /// Players as wire entries, in snapshot order.
    pub fn player_entries(&self) -> Vec<PlayerEntry> {
        self.players.iter().map(PlayerEntry::from).collect()
    }
}

/// A change to fleet state, as carried on the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEvent {
    PlayerJoin {
        uuid: Uuid,
        username: String,
        server_id: String,
        server_name: String,
        /// Set when the join moved the player off another server.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_server_id: Option<String>,
    },
    PlayerLeave {
        uuid: Uuid,
        server_id: String,
    },
    ServerHeartbeat {
        server_id: String,
        player_count: u32,
        max_players: u32,
    },
    ServerOnline {
        server_id: String,
        server_name: String,
    },
    ServerOffline {
        server_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl NetworkEvent {
    /// Log tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkEvent::PlayerJoin { .. } => "player_join",
            NetworkEvent::PlayerLeave { .. } => "player_leave",
            NetworkEvent::ServerHeartbeat { .. } => "server_heartbeat",
            NetworkEvent::ServerOnline { .. } => "server_online",
            NetworkEvent::ServerOffline { .. } => "server_offline",
        }
    }

    /// Server the event concerns.
    pub fn server_id(&self) -> &str {
        match self {
            NetworkEvent::PlayerJoin { server_id, .. }
            | NetworkEvent::PlayerLeave { server_id, .. }
            | NetworkEvent::ServerHeartbeat { server_id, .. }
            | NetworkEvent::ServerOnline { server_id, .. }
            | NetworkEvent::ServerOffline { server_id, .. } => server_id,
        }
    }

    pub fn join(player: &PlayerInfo, previous_server_id: Option<String>) -> Self {
        NetworkEvent::PlayerJoin {
            uuid: player.uuid,
            username: player.username.clone(),
            server_id: player.server_id.clone(),
            server_name: player.server_name.clone(),
            previous_server_id,
        }
    }

    /// Notifications subscribers see for this log entry.
    ///
    /// A relocating join becomes a leave from the old server followed by the
    /// join itself.
    pub fn notifications(&self) -> Vec<NetworkEvent> {
        match self {
            NetworkEvent::PlayerJoin {
                uuid,
                server_id,
                previous_server_id: Some(previous),
                ..
            } if previous != server_id => vec![
                NetworkEvent::PlayerLeave {
                    uuid: *uuid,
                    server_id: previous.clone(),
                },
                self.clone(),
            ],
            _ => vec![self.clone()],
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
