//! Local State Cache
//!
//! In-process mirror of fleet state used to answer aggregated queries without
//! a store round trip. One reader/writer lock guards all three maps so the
//! player index and per-server counts never disagree.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

use super::model::{NetworkEvent, NetworkSnapshot, PlayerInfo, ServerState};
use crate::core::now_millis;

/// Default staleness timeout.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Default)]
struct CacheState {
    servers: BTreeMap<String, ServerState>,
    players: BTreeMap<Uuid, PlayerInfo>,
    /// uuid -> server id, derived from `players`.
    locations: BTreeMap<Uuid, String>,
    last_refresh: Option<i64>,
}

impl CacheState {
    fn recount(&mut self, server_id: &str) {
        let count = self
            .locations
            .values()
            .filter(|id| id.as_str() == server_id)
            .count() as u32;
        if let Some(server) = self.servers.get_mut(server_id) {
            server.player_count = count;
        }
    }

    fn insert_player(&mut self, player: PlayerInfo) {
        let new_server = player.server_id.clone();
        let old_server = self.locations.insert(player.uuid, new_server.clone());
        self.players.insert(player.uuid, player);

        if let Some(old) = old_server.filter(|old| *old != new_server) {
            self.recount(&old);
        }
        self.recount(&new_server);
    }

    fn take_player(&mut self, uuid: Uuid) -> Option<PlayerInfo> {
        let removed = self.players.remove(&uuid);
        if let Some(server_id) = self.locations.remove(&uuid) {
            self.recount(&server_id);
        }
        removed
    }

    fn take_server(&mut self, server_id: &str) -> Option<ServerState> {
        let removed = self.servers.remove(server_id);
        let orphans: Vec<Uuid> = self
            .locations
            .iter()
            .filter(|(_, id)| id.as_str() == server_id)
            .map(|(uuid, _)| *uuid)
            .collect();
        for uuid in orphans {
            self.locations.remove(&uuid);
            self.players.remove(&uuid);
        }
        removed
    }
}

/// Lock-guarded mirror of fleet state.
#[derive(Debug)]
pub struct LocalStateCache {
    state: RwLock<CacheState>,
    server_timeout: Duration,
}

impl Default for LocalStateCache {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_TIMEOUT)
    }
}

impl LocalStateCache {
    pub fn new(server_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            server_timeout,
        }
    }

    pub fn server_timeout(&self) -> Duration {
        self.server_timeout
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // MUTATIONS
    // =========================================================================

    /// Insert or replace a server.
    pub fn update_server(&self, server: ServerState) {
        self.write().servers.insert(server.server_id.clone(), server);
    }

    /// Remove a server and every player located on it.
    pub fn remove_server(&self, server_id: &str) -> Option<ServerState> {
        self.write().take_server(server_id)
    }

    /// Insert or move a player, recounting affected servers.
    pub fn update_player(&self, player: PlayerInfo) {
        self.write().insert_player(player);
    }

    pub fn remove_player(&self, uuid: Uuid) -> Option<PlayerInfo> {
        self.write().take_player(uuid)
    }

    /// Replace everything with `snapshot`.
    pub fn refresh(&self, snapshot: NetworkSnapshot) {
        let mut state = self.write();
        state.servers = snapshot
            .servers
            .into_iter()
            .map(|s| (s.server_id.clone(), s))
            .collect();
        state.locations = snapshot
            .players
            .iter()
            .map(|p| (p.uuid, p.server_id.clone()))
            .collect();
        state.players = snapshot.players.into_iter().map(|p| (p.uuid, p)).collect();
        state.last_refresh = Some(now_millis());
    }

    /// Evict stale servers and their players. Returns how many were evicted.
    pub fn prune_stale_servers(&self) -> usize {
        self.prune_stale_servers_at(now_millis())
    }

    pub fn prune_stale_servers_at(&self, now: i64) -> usize {
        let mut state = self.write();
        let stale: Vec<String> = state
            .servers
            .values()
            .filter(|s| s.is_stale_at(now, self.server_timeout))
            .map(|s| s.server_id.clone())
            .collect();
        for server_id in &stale {
            state.take_server(server_id);
        }
        stale.len()
    }

    pub fn clear(&self) {
        let mut state = self.write();
        *state = CacheState::default();
    }

    /// Patch the cache with one replicated log entry.
    pub fn apply_event(&self, event: &NetworkEvent) {
        let mut state = self.write();
        match event {
            NetworkEvent::PlayerJoin {
                uuid,
                username,
                server_id,
                server_name,
                ..
            } => {
                let join_time = state
                    .players
                    .get(uuid)
                    .filter(|p| p.server_id == *server_id)
                    .map(|p| p.join_time)
                    .unwrap_or_else(now_millis);
                state.insert_player(PlayerInfo {
                    uuid: *uuid,
                    username: username.clone(),
                    server_id: server_id.clone(),
                    server_name: server_name.clone(),
                    join_time,
                });
            }
            NetworkEvent::PlayerLeave { uuid, server_id } => {
                if state.locations.get(uuid) == Some(server_id) {
                    state.take_player(*uuid);
                }
            }
            NetworkEvent::ServerHeartbeat {
                server_id,
                max_players,
                ..
            } => {
                if let Some(server) = state.servers.get_mut(server_id) {
                    server.max_players = *max_players;
                    server.last_heartbeat = now_millis();
                }
            }
            NetworkEvent::ServerOnline {
                server_id,
                server_name,
            } => {
                let mut server = ServerState::new(server_id.clone(), server_name.clone());
                if let Some(existing) = state.servers.get(server_id) {
                    server.max_players = existing.max_players;
                    server.host = existing.host.clone();
                    server.port = existing.port;
                }
                state.servers.insert(server_id.clone(), server);
                state.recount(server_id);
            }
            NetworkEvent::ServerOffline { server_id, .. } => {
                state.take_server(server_id);
            }
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    pub fn server(&self, server_id: &str) -> Option<ServerState> {
        self.read().servers.get(server_id).cloned()
    }

    pub fn player(&self, uuid: Uuid) -> Option<PlayerInfo> {
        self.read().players.get(&uuid).cloned()
    }

    /// Server a player is on.
    pub fn player_location(&self, uuid: Uuid) -> Option<String> {
        self.read().locations.get(&uuid).cloned()
    }

    pub fn servers(&self) -> Vec<ServerState> {
        self.read().servers.values().cloned().collect()
    }

    /// Players ordered by UUID.
    pub fn players(&self) -> Vec<PlayerInfo> {
        self.read().players.values().cloned().collect()
    }

    pub fn players_on(&self, server_id: &str) -> Vec<PlayerInfo> {
        self.read()
            .players
            .values()
            .filter(|p| p.server_id == server_id)
            .cloned()
            .collect()
    }

    /// Consistent copy of servers and players.
    pub fn snapshot(&self) -> NetworkSnapshot {
        let state = self.read();
        NetworkSnapshot::new(
            state.servers.values().cloned().collect(),
            state.players.values().cloned().collect(),
        )
    }

    pub fn player_count(&self) -> usize {
        self.read().players.len()
    }

    /// All known servers, stale included.
    pub fn server_count(&self) -> usize {
        self.read().servers.len()
    }

    /// Servers whose heartbeat is within the timeout.
    pub fn online_server_count(&self) -> usize {
        self.online_server_count_at(now_millis())
    }

    pub fn online_server_count_at(&self, now: i64) -> usize {
        self.read()
            .servers
            .values()
            .filter(|s| !s.is_stale_at(now, self.server_timeout))
            .count()
    }

    pub fn has_stale_servers(&self) -> bool {
        let now = now_millis();
        self.read()
            .servers
            .values()
            .any(|s| s.is_stale_at(now, self.server_timeout))
    }

    /// Unix millis of the last full refresh.
    pub fn last_refresh(&self) -> Option<i64> {
        self.read().last_refresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str) -> ServerState {
        ServerState::new(id, id.to_uppercase())
    }

    fn player(n: u128, server_id: &str) -> PlayerInfo {
        PlayerInfo::new(Uuid::from_u128(n), format!("p{}", n), server_id, server_id)
    }

    #[test]
    fn test_player_counts_follow_index() {
        let cache = LocalStateCache::default();
        cache.update_server(server("a"));
        cache.update_server(server("b"));

        cache.update_player(player(1, "a"));
        cache.update_player(player(2, "a"));
        assert_eq!(cache.server("a").unwrap().player_count, 2);

        cache.update_player(player(1, "b"));
        assert_eq!(cache.server("a").unwrap().player_count, 1);
        assert_eq!(cache.server("b").unwrap().player_count, 1);
        assert_eq!(cache.player_location(Uuid::from_u128(1)).as_deref(), Some("b"));

        cache.remove_player(Uuid::from_u128(2));
        assert_eq!(cache.server("a").unwrap().player_count, 0);
        assert_eq!(cache.player_count(), 1);
    }

    #[test]
    fn test_remove_server_cascades() {
        let cache = LocalStateCache::default();
        cache.update_server(server("a"));
        cache.update_server(server("b"));
        cache.update_player(player(1, "a"));
        cache.update_player(player(2, "b"));

        assert!(cache.remove_server("a").is_some());
        assert!(cache.player(Uuid::from_u128(1)).is_none());
        assert!(cache.player_location(Uuid::from_u128(1)).is_none());
        assert!(cache.player(Uuid::from_u128(2)).is_some());
        assert!(cache.remove_server("a").is_none());
    }

    #[test]
    fn test_refresh_replaces_everything() {
        let cache = LocalStateCache::default();
        cache.update_server(server("old"));
        cache.update_player(player(1, "old"));
        assert!(cache.last_refresh().is_none());

        cache.refresh(NetworkSnapshot::new(
            vec![server("new").with_player_count(1)],
            vec![player(2, "new")],
        ));

        assert!(cache.server("old").is_none());
        assert!(cache.player(Uuid::from_u128(1)).is_none());
        assert_eq!(cache.player_location(Uuid::from_u128(2)).as_deref(), Some("new"));
        assert!(cache.last_refresh().is_some());
    }

    #[test]
    fn test_stale_servers_counted_until_pruned() {
        let cache = LocalStateCache::new(Duration::from_secs(45));
        let now = now_millis();
        cache.update_server(server("fresh").with_heartbeat(now));
        cache.update_server(server("stale").with_heartbeat(now - 60_000));
        cache.update_player(player(1, "stale"));

        assert_eq!(cache.server_count(), 2);
        assert_eq!(cache.online_server_count_at(now), 1);
        assert!(cache.has_stale_servers());

        assert_eq!(cache.prune_stale_servers_at(now), 1);
        assert_eq!(cache.server_count(), 1);
        assert_eq!(cache.player_count(), 0);
        assert!(!cache.has_stale_servers());
    }

    #[test]
    fn test_clear() {
        let cache = LocalStateCache::default();
        cache.update_server(server("a"));
        cache.update_player(player(1, "a"));
        cache.clear();
        assert_eq!(cache.server_count(), 0);
        assert_eq!(cache.player_count(), 0);
    }

    #[test]
    fn test_apply_events() {
        let cache = LocalStateCache::default();
        let uuid = Uuid::from_u128(7);

        cache.apply_event(&NetworkEvent::ServerOnline {
            server_id: "lobby-0".to_string(),
            server_name: "Lobby".to_string(),
        });
        cache.apply_event(&NetworkEvent::ServerOnline {
            server_id: "survival-0".to_string(),
            server_name: "Survival".to_string(),
        });
        cache.apply_event(&NetworkEvent::PlayerJoin {
            uuid,
            username: "p".to_string(),
            server_id: "survival-0".to_string(),
            server_name: "Survival".to_string(),
            previous_server_id: None,
        });
        assert_eq!(cache.server("survival-0").unwrap().player_count, 1);

        cache.apply_event(&NetworkEvent::PlayerJoin {
            uuid,
            username: "p".to_string(),
            server_id: "lobby-0".to_string(),
            server_name: "Lobby".to_string(),
            previous_server_id: Some("survival-0".to_string()),
        });
        assert_eq!(cache.server("survival-0").unwrap().player_count, 0);
        assert_eq!(cache.server("lobby-0").unwrap().player_count, 1);

        // Stale leave from the old server is ignored.
        cache.apply_event(&NetworkEvent::PlayerLeave {
            uuid,
            server_id: "survival-0".to_string(),
        });
        assert_eq!(cache.player_location(uuid).as_deref(), Some("lobby-0"));

        cache.apply_event(&NetworkEvent::ServerHeartbeat {
            server_id: "lobby-0".to_string(),
            player_count: 99,
            max_players: 250,
        });
        let lobby = cache.server("lobby-0").unwrap();
        assert_eq!(lobby.max_players, 250);
        assert_eq!(lobby.player_count, 1);

        cache.apply_event(&NetworkEvent::ServerOffline {
            server_id: "lobby-0".to_string(),
            reason: Some("shutdown".to_string()),
        });
        assert!(cache.player(uuid).is_none());
        assert_eq!(cache.server_count(), 1);
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let cache = LocalStateCache::default();
        cache.update_server(server("a"));
        for n in [5u128, 1, 3] {
            cache.update_player(player(n, "a"));
        }
        let uuids: Vec<_> = cache.snapshot().players.iter().map(|p| p.uuid.as_u128()).collect();
        assert_eq!(uuids, vec![1, 3, 5]);
    }
}
