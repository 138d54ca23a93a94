//! Local server data.
//!
//! The host process implements [`ServerDataProvider`] (or uses [`LocalServer`])
//! to tell the query layer who it is and who is connected.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

use crate::config::ServerInfoConfig;
use crate::protocol::legacy::PluginEntry;
use crate::protocol::{PlayerEntry, ServerInfo};

/// Default game port.
pub const DEFAULT_GAME_PORT: u16 = 5520;

/// What the host knows about the local server.
pub trait ServerDataProvider: Send + Sync {
    fn server_name(&self) -> String;
    fn motd(&self) -> String;
    fn player_count(&self) -> u32;
    fn max_players(&self) -> u32;
    /// Connected players in a stable order.
    fn players(&self) -> Vec<PlayerEntry>;
    fn version(&self) -> String;
    fn protocol_version(&self) -> u32;
    fn protocol_hash(&self) -> String;
    /// Address advertised to clients, if any.
    fn host(&self) -> Option<String>;
    fn port(&self) -> u16;

    fn plugins(&self) -> Vec<PluginEntry> {
        Vec::new()
    }

    /// Local-only SERVER_INFO contents.
    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            name: self.server_name(),
            motd: self.motd(),
            player_count: self.player_count(),
            max_players: self.max_players(),
            version: self.version(),
            protocol_version: self.protocol_version(),
            protocol_hash: self.protocol_hash(),
            address: self.host().map(|host| (host, self.port())),
        }
    }
}

/// Static identity of a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub name: String,
    pub motd: String,
    pub max_players: u32,
    pub version: String,
    pub protocol_version: u32,
    pub protocol_hash: String,
    pub host: Option<String>,
    pub port: u16,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            name: "Fleet Server".to_string(),
            motd: String::new(),
            max_players: 100,
            version: crate::VERSION.to_string(),
            protocol_version: 1,
            protocol_hash: String::new(),
            host: None,
            port: DEFAULT_GAME_PORT,
        }
    }
}

impl ServerIdentity {
    /// Apply configured overrides.
    pub fn with_overrides(mut self, overrides: &ServerInfoConfig) -> Self {
        if let Some(name) = &overrides.server_name {
            self.name = name.clone();
        }
        if let Some(motd) = &overrides.motd {
            self.motd = motd.clone();
        }
        if let Some(host) = &overrides.host {
            self.host = Some(host.clone());
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(max_players) = overrides.max_players {
            self.max_players = max_players;
        }
        self
    }
}

/// Thread-safe provider updated by the host on connect/disconnect.
#[derive(Debug, Default)]
pub struct LocalServer {
    identity: ServerIdentity,
    players: RwLock<BTreeMap<Uuid, String>>,
    plugins: Vec<PluginEntry>,
}

impl LocalServer {
    pub fn new(identity: ServerIdentity) -> Self {
        Self {
            identity,
            players: RwLock::new(BTreeMap::new()),
            plugins: Vec::new(),
        }
    }

    /// Plugins listed in legacy FULL replies.
    pub fn with_plugins(mut self, plugins: Vec<PluginEntry>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Record a connected player. Returns false if already present.
    pub fn player_joined(&self, uuid: Uuid, username: impl Into<String>) -> bool {
        let mut players = self.players.write().unwrap_or_else(PoisonError::into_inner);
        players.insert(uuid, username.into()).is_none()
    }

    /// Forget a player. Returns false if unknown.
    pub fn player_left(&self, uuid: Uuid) -> bool {
        let mut players = self.players.write().unwrap_or_else(PoisonError::into_inner);
        players.remove(&uuid).is_some()
    }
}

impl ServerDataProvider for LocalServer {
    fn server_name(&self) -> String {
        self.identity.name.clone()
    }

    fn motd(&self) -> String {
        self.identity.motd.clone()
    }

    fn player_count(&self) -> u32 {
        let players = self.players.read().unwrap_or_else(PoisonError::into_inner);
        players.len() as u32
    }

    fn max_players(&self) -> u32 {
        self.identity.max_players
    }

    fn players(&self) -> Vec<PlayerEntry> {
        let players = self.players.read().unwrap_or_else(PoisonError::into_inner);
        players
            .iter()
            .map(|(uuid, name)| PlayerEntry::new(*uuid, name.clone()))
            .collect()
    }

    fn version(&self) -> String {
        self.identity.version.clone()
    }

    fn protocol_version(&self) -> u32 {
        self.identity.protocol_version
    }

    fn protocol_hash(&self) -> String {
        self.identity.protocol_hash.clone()
    }

    fn host(&self) -> Option<String> {
        self.identity.host.clone()
    }

    fn port(&self) -> u16 {
        self.identity.port
    }

    fn plugins(&self) -> Vec<PluginEntry> {
        self.plugins.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_players_tracked() {
        let server = LocalServer::new(ServerIdentity::default());
        let a = Uuid::from_u128(2);
        let b = Uuid::from_u128(1);

        assert!(server.player_joined(a, "alice"));
        assert!(server.player_joined(b, "bob"));
        assert!(!server.player_joined(a, "alice"));
        assert_eq!(server.player_count(), 2);

        let names: Vec<_> = server.players().into_iter().map(|p| p.username).collect();
        assert_eq!(names, vec!["bob", "alice"]);

        assert!(server.player_left(a));
        assert!(!server.player_left(a));
        assert_eq!(server.player_count(), 1);
    }

    #[test]
    fn test_overrides_win() {
        let overrides = ServerInfoConfig {
            server_name: Some("Lobby".to_string()),
            host: Some("play.example.net".to_string()),
            port: Some(25000),
            ..Default::default()
        };
        let server = LocalServer::new(ServerIdentity::default().with_overrides(&overrides));
        let info = server.server_info();
        assert_eq!(info.name, "Lobby");
        assert_eq!(info.max_players, 100);
        assert_eq!(info.address, Some(("play.example.net".to_string(), 25000)));
    }

    #[test]
    fn test_no_host_means_no_address() {
        let server = LocalServer::new(ServerIdentity::default());
        assert_eq!(server.server_info().address, None);
    }
}
