//! Read-only facade over a running [`NetworkModule`] for host code.
//!
//! Reads come from the module's view without a store round trip, except
//! [`QueryApi::fetch_snapshot`]. Server globs match server ids and player
//! globs match usernames. Both support `*` and `?` and ignore case.

use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::network::{
    NetworkError, NetworkEvent, NetworkModule, NetworkSnapshot, PlayerInfo, ServerState,
};

/// Handle for querying fleet state.
#[derive(Debug, Clone)]
pub struct QueryApi {
    network: Arc<NetworkModule>,
}

impl QueryApi {
    /// `None` unless the module exists and is running.
    pub fn new(network: Option<Arc<NetworkModule>>) -> Option<Self> {
        network
            .filter(|network| network.is_enabled())
            .map(|network| Self { network })
    }

    fn view(&self) -> NetworkSnapshot {
        self.network.network_snapshot()
    }

    // =========================================================================
    // SERVERS
    // =========================================================================

    pub fn servers(&self) -> Vec<ServerState> {
        self.view().servers
    }

    pub fn servers_matching(&self, pattern: &str) -> Vec<ServerState> {
        self.view()
            .servers
            .into_iter()
            .filter(|s| glob_matches(pattern, &s.server_id))
            .collect()
    }

    pub fn server(&self, server_id: &str) -> Option<ServerState> {
        self.view().server(server_id).cloned()
    }

    pub fn server_count(&self) -> usize {
        self.view().server_count()
    }

    /// Servers whose last heartbeat is within the staleness timeout.
    pub fn online_server_count(&self) -> usize {
        let timeout = self.network.config().timing.server_timeout();
        self.view()
            .servers
            .iter()
            .filter(|s| !s.is_stale(timeout))
            .count()
    }

    // =========================================================================
    // PLAYERS
    // =========================================================================

    pub fn players(&self) -> Vec<PlayerInfo> {
        self.view().players
    }

    pub fn players_matching(&self, pattern: &str) -> Vec<PlayerInfo> {
        self.view()
            .players
            .into_iter()
            .filter(|p| glob_matches(pattern, &p.username))
            .collect()
    }

    pub fn player(&self, uuid: Uuid) -> Option<PlayerInfo> {
        self.view().player(uuid).cloned()
    }

    /// Case-insensitive exact name lookup.
    pub fn player_by_name(&self, username: &str) -> Option<PlayerInfo> {
        let wanted = username.to_lowercase();
        self.view()
            .players
            .into_iter()
            .find(|p| p.username.to_lowercase() == wanted)
    }

    pub fn is_player_online(&self, uuid: Uuid) -> bool {
        self.view().player(uuid).is_some()
    }

    /// Sum of per-server counts.
    pub fn player_count(&self) -> u32 {
        self.view().total_player_count()
    }

    /// Players on servers whose id matches `pattern`.
    pub fn player_count_matching(&self, pattern: &str) -> u32 {
        self.view()
            .servers
            .iter()
            .filter(|s| glob_matches(pattern, &s.server_id))
            .map(|s| s.player_count)
            .fold(0u32, u32::saturating_add)
    }

    // =========================================================================
    // IDENTITY & EVENTS
    // =========================================================================

    pub fn network_id(&self) -> &str {
        self.network.network_id()
    }

    pub fn local_server_id(&self) -> &str {
        self.network.server_id()
    }

    pub fn local_server_state(&self) -> ServerState {
        self.network.local_server_state()
    }

    pub fn is_syncing(&self) -> bool {
        self.network.should_sync()
    }

    pub fn is_aggregating(&self) -> bool {
        self.network.should_aggregate()
    }

    /// Fleet events. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.network.subscribe()
    }

    /// Authoritative read from the store.
    pub async fn fetch_snapshot(&self) -> Result<NetworkSnapshot, NetworkError> {
        self.network.fetch_network_snapshot().await
    }
}

/// Case-insensitive glob with `*` (any run) and `?` (one char).
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    let (mut p, mut t) = (0, 0);
    // Last `*` seen and the text position it is currently absorbing up to.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, absorbed)) => {
                    p = star + 1;
                    t = absorbed + 1;
                    backtrack = Some((star, absorbed + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkConfig, NetworkMode};
    use crate::network::{MemoryStateStore, NetworkStateStore};
    use crate::provider::{LocalServer, ServerIdentity};

    #[test]
    fn test_glob() {
        assert!(glob_matches("lobby-*", "lobby-0"));
        assert!(glob_matches("LOBBY-*", "lobby-12"));
        assert!(glob_matches("lobby-?", "lobby-3"));
        assert!(!glob_matches("lobby-?", "lobby-13"));
        assert!(glob_matches("*", ""));
        assert!(glob_matches("*-*-*", "a-b-c"));
        assert!(glob_matches("s*l", "survival"));
        assert!(!glob_matches("s*x", "survival"));
        assert!(glob_matches("", ""));
        assert!(!glob_matches("", "x"));
        assert!(glob_matches("a*b*c", "aXXbYYbc"));
    }

    async fn running_module() -> (Arc<NetworkModule>, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        store
            .register_server(&ServerState::new("survival-0", "Survival").with_max_players(100))
            .await
            .unwrap();
        store
            .player_join(&PlayerInfo::new(Uuid::from_u128(7), "Steve", "survival-0", "Survival"))
            .await
            .unwrap();

        let local = Arc::new(LocalServer::new(ServerIdentity {
            name: "Lobby".to_string(),
            ..Default::default()
        }));
        let module = Arc::new(NetworkModule::new(
            NetworkConfig {
                enabled: true,
                server_id: "lobby-0".to_string(),
                network_id: "main".to_string(),
                mode: NetworkMode::Sync,
                ..Default::default()
            },
            local,
        ));
        module.start_with_store(store.clone()).await.unwrap();
        module
            .record_player_join(Uuid::from_u128(8), "alex")
            .await
            .unwrap();
        module.cache().refresh(store.fetch_snapshot().await.unwrap());
        (module, store)
    }

    #[test]
    fn test_unavailable_module() {
        assert!(QueryApi::new(None).is_none());
        let idle = Arc::new(NetworkModule::new(
            NetworkConfig::default(),
            Arc::new(LocalServer::default()),
        ));
        assert!(QueryApi::new(Some(idle)).is_none());
    }

    #[tokio::test]
    async fn test_queries() {
        let (module, _store) = running_module().await;
        let api = QueryApi::new(Some(module.clone())).unwrap();

        assert_eq!(api.network_id(), "main");
        assert_eq!(api.local_server_id(), "lobby-0");
        assert!(api.is_syncing());
        assert!(!api.is_aggregating());

        assert_eq!(api.server_count(), 2);
        assert_eq!(api.online_server_count(), 2);
        assert_eq!(api.servers_matching("LOBBY-*").len(), 1);
        assert_eq!(api.server("survival-0").unwrap().max_players, 100);

        assert_eq!(api.player_count(), 2);
        assert_eq!(api.player_count_matching("surv*"), 1);
        assert_eq!(api.players_matching("st?ve").len(), 1);

        let steve = api.player_by_name("STEVE").unwrap();
        assert_eq!(steve.server_id, "survival-0");
        assert!(api.is_player_online(Uuid::from_u128(8)));
        assert!(!api.is_player_online(Uuid::from_u128(9)));
        assert_eq!(api.player(Uuid::from_u128(8)).unwrap().server_id, "lobby-0");

        let fetched = api.fetch_snapshot().await.unwrap();
        assert_eq!(fetched.server_count(), 2);

        module.stop().await;
        assert!(QueryApi::new(Some(module)).is_none());
    }

    #[tokio::test]
    async fn test_subscribe_sees_joins() {
        let (module, store) = running_module().await;
        let api = QueryApi::new(Some(module.clone())).unwrap();
        let mut events = api.subscribe();

        store
            .player_join(&PlayerInfo::new(Uuid::from_u128(10), "newbie", "survival-0", "Survival"))
            .await
            .unwrap();

        let joined_on = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(NetworkEvent::PlayerJoin { uuid, server_id, .. })
                        if uuid == Uuid::from_u128(10) =>
                    {
                        break server_id
                    }
                    Ok(_) => continue,
                    Err(e) => panic!("event stream closed: {}", e),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(joined_on, "survival-0");

        module.stop().await;
    }
}
