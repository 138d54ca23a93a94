//! Query Dispatcher
//!
//! Per-datagram entry point. Classifies the protocol, enforces the challenge
//! and access checks, and builds the reply from local data or, when the
//! network module aggregates, from its cache. Never touches the store.
//!
//! | Condition                                   | Result                 |
//! |---------------------------------------------|------------------------|
//! | Unknown magic, malformed, bad challenge     | dropped                |
//! | Legacy request, legacy disabled             | dropped                |
//! | Endpoint not permitted for the bearer token | `AUTH_REQUIRED` reply  |
//! | Otherwise                                   | BASIC / PLAYERS reply  |

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::auth::{AccessValidator, ChallengeCodec};
use crate::config::QueryConfig;
use crate::core::short_hex;
use crate::network::{NetworkModule, NetworkSnapshot};
use crate::protocol::legacy::{self, LegacyReply};
use crate::protocol::{
    auth_required_response, basic_response, challenge_response, is_query_request, parse_request,
    players_response, response_flags, PlayerEntry, QueryRequest, QueryType, Request, ServerInfo,
};
use crate::provider::ServerDataProvider;

/// Turns request datagrams into response datagrams.
pub struct QueryDispatcher {
    challenges: ChallengeCodec,
    access: AccessValidator,
    local: Arc<dyn ServerDataProvider>,
    network: Option<Arc<NetworkModule>>,
    legacy_enabled: bool,
}

impl QueryDispatcher {
    pub fn new(
        challenges: ChallengeCodec,
        access: AccessValidator,
        local: Arc<dyn ServerDataProvider>,
    ) -> Self {
        Self {
            challenges,
            access,
            local,
            network: None,
            legacy_enabled: false,
        }
    }

    /// Dispatcher wired from configuration.
    pub fn from_config(
        config: &QueryConfig,
        challenges: ChallengeCodec,
        local: Arc<dyn ServerDataProvider>,
        network: Option<Arc<NetworkModule>>,
    ) -> Self {
        let mut dispatcher = Self::new(
            challenges,
            AccessValidator::new(config.authentication.clone()),
            local,
        )
        .with_legacy(config.legacy_protocol_enabled);
        dispatcher.network = network;
        dispatcher
    }

    pub fn with_network(mut self, network: Arc<NetworkModule>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_legacy(mut self, enabled: bool) -> Self {
        self.legacy_enabled = enabled;
        self
    }

    /// Handle one datagram. `None` means send nothing.
    pub fn handle(&self, datagram: &[u8], from: SocketAddr) -> Option<Vec<u8>> {
        if is_query_request(datagram) {
            return self.handle_query(datagram, from);
        }
        if let Some(query) = legacy::parse_legacy_request(datagram) {
            if !self.legacy_enabled {
                trace!("Legacy query from {} ignored: protocol disabled", from);
                return None;
            }
            return Some(self.legacy_reply(query));
        }
        trace!("Dropping {} byte datagram from {}: unknown magic", datagram.len(), from);
        None
    }

    fn handle_query(&self, datagram: &[u8], from: SocketAddr) -> Option<Vec<u8>> {
        let request = match parse_request(datagram) {
            Ok(request) => request,
            Err(e) => {
                trace!("Dropping malformed query from {}: {}", from, e);
                return None;
            }
        };

        match request {
            Request::Challenge => {
                let token = self.challenges.generate(from.ip());
                trace!("Issued challenge {} to {}", short_hex(&token), from);
                Some(challenge_response(&token))
            }
            Request::Query(query) => self.answer(&query, from),
        }
    }

    fn answer(&self, query: &QueryRequest, from: SocketAddr) -> Option<Vec<u8>> {
        let Some(token) = &query.challenge_token else {
            trace!("Dropping query from {}: no challenge token", from);
            return None;
        };
        if !self.challenges.validate(token, from.ip()) {
            trace!("Dropping query from {}: invalid challenge {}", from, short_hex(token));
            return None;
        }

        let query_type = query.query_type();
        let endpoint = query_type.endpoint()?;
        if !self
            .access
            .is_access_allowed(endpoint, query.auth_token.as_deref())
        {
            debug!("Query for {} from {} requires authentication", endpoint.name(), from);
            return Some(auth_required_response(
                query.request_id,
                &self.local.server_info(),
            ));
        }

        let aggregated = self.aggregated_snapshot();
        let response = match (query_type, aggregated) {
            (QueryType::Players, Some(snapshot)) => {
                players_response(
                    query.request_id,
                    response_flags::IS_NETWORK,
                    &snapshot.player_entries(),
                    query.offset,
                )
                .packet
            }
            (QueryType::Players, None) => {
                players_response(query.request_id, 0, &self.local.players(), query.offset).packet
            }
            (_, Some(snapshot)) => basic_response(
                query.request_id,
                response_flags::IS_NETWORK,
                &self.network_info(&snapshot),
            ),
            (_, None) => basic_response(query.request_id, 0, &self.local.server_info()),
        };
        Some(response)
    }

    fn aggregated_snapshot(&self) -> Option<NetworkSnapshot> {
        self.network
            .as_ref()
            .and_then(|network| network.aggregated_snapshot())
    }

    /// Local identity with fleet-wide counts.
    fn network_info(&self, snapshot: &NetworkSnapshot) -> ServerInfo {
        ServerInfo {
            player_count: snapshot.total_player_count(),
            max_players: snapshot.total_max_players(),
            ..self.local.server_info()
        }
    }

    fn legacy_reply(&self, query: legacy::LegacyQuery) -> Vec<u8> {
        let plugins = self.local.plugins();
        let (info, players, network) = match self.aggregated_snapshot() {
            Some(snapshot) => (self.network_info(&snapshot), snapshot.player_entries(), true),
            None => (self.local.server_info(), self.local.players(), false),
        };
        let players: Vec<PlayerEntry> = if query == legacy::LegacyQuery::Full {
            players
        } else {
            Vec::new()
        };

        legacy::legacy_response(
            query,
            &LegacyReply {
                info: &info,
                port: self.local.port(),
                players: &players,
                plugins: &plugins,
                network,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TOKEN_SIZE;
    use crate::config::{AuthConfig, NetworkConfig, NetworkMode, Permissions};
    use crate::network::store::MemoryStateStore;
    use crate::network::NetworkStateStore;
    use crate::network::{PlayerInfo, ServerState};
    use crate::protocol::legacy::capabilities;
    use crate::protocol::request::encode_challenge_request;
    use crate::protocol::{decode_response, DecodedResponse};
    use crate::provider::{LocalServer, ServerIdentity};
    use std::net::{IpAddr, Ipv4Addr};
    use uuid::Uuid;

    const CLIENT: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 40000);
    const SPOOFED: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8)), 40000);

    fn local_server(players: usize) -> Arc<LocalServer> {
        let server = LocalServer::new(ServerIdentity {
            name: "Lobby".to_string(),
            max_players: 50,
            ..Default::default()
        });
        for i in 0..players {
            server.player_joined(Uuid::from_u128(i as u128 + 1), format!("player{:03}", i));
        }
        Arc::new(server)
    }

    fn dispatcher_with(public: Permissions, players: usize) -> QueryDispatcher {
        let mut auth = AuthConfig {
            public,
            ..Default::default()
        };
        auth.tokens.insert("admin".to_string(), Permissions::all());
        QueryDispatcher::new(
            ChallengeCodec::new(b"dispatcher-test").unwrap(),
            AccessValidator::new(auth),
            local_server(players),
        )
    }

    fn dispatcher() -> QueryDispatcher {
        dispatcher_with(Permissions::all(), 3)
    }

    fn challenge(d: &QueryDispatcher, from: SocketAddr) -> [u8; TOKEN_SIZE] {
        let reply = d.handle(&encode_challenge_request(), from).unwrap();
        assert_eq!(reply.len(), 48);
        let mut token = [0u8; TOKEN_SIZE];
        token.copy_from_slice(&reply[9..41]);
        token
    }

    fn ask(d: &QueryDispatcher, request: QueryRequest) -> Option<DecodedResponse> {
        d.handle(&request.encode(), CLIENT)
            .map(|bytes| decode_response(&bytes).unwrap())
    }

    #[test]
    fn test_challenge_then_basic() {
        let d = dispatcher();
        let token = challenge(&d, CLIENT);
        let reply = ask(&d, QueryRequest::new(QueryType::Basic, token, 11)).unwrap();

        assert_eq!(reply.request_id, 11);
        assert!(!reply.has_flag(response_flags::IS_NETWORK));
        let info = reply.server_info.unwrap();
        assert_eq!(info.name, "Lobby");
        assert_eq!(info.player_count, 3);
        assert_eq!(info.max_players, 50);
    }

    #[test]
    fn test_missing_token_is_dropped() {
        let d = dispatcher();
        let mut bytes = b"ONEQUERY".to_vec();
        bytes.push(QueryType::Basic.code());
        assert!(d.handle(&bytes, CLIENT).is_none());
    }

    #[test]
    fn test_token_for_other_address_is_dropped() {
        let d = dispatcher();
        let token = challenge(&d, SPOOFED);
        assert!(ask(&d, QueryRequest::new(QueryType::Basic, token, 1)).is_none());
    }

    #[test]
    fn test_forged_token_is_dropped() {
        let d = dispatcher();
        assert!(ask(&d, QueryRequest::new(QueryType::Basic, [0u8; TOKEN_SIZE], 1)).is_none());
    }

    #[test]
    fn test_garbage_is_dropped() {
        let d = dispatcher();
        assert!(d.handle(b"", CLIENT).is_none());
        assert!(d.handle(b"GET / HTTP/1.1\r\n", CLIENT).is_none());
        assert!(d.handle(b"ONEQUERY", CLIENT).is_none());
    }

    #[test]
    fn test_protected_players_without_token() {
        let d = dispatcher_with(
            Permissions {
                basic: true,
                players: false,
            },
            3,
        );
        let token = challenge(&d, CLIENT);
        let reply = ask(&d, QueryRequest::new(QueryType::Players, token, 5)).unwrap();

        assert!(reply.has_flag(response_flags::AUTH_REQUIRED));
        assert!(reply.player_list.is_none());
        assert_eq!(reply.request_id, 5);

        let authed = ask(
            &d,
            QueryRequest::new(QueryType::Players, token, 6).with_auth_token("admin"),
        )
        .unwrap();
        assert!(!authed.has_flag(response_flags::AUTH_REQUIRED));
        assert_eq!(authed.player_list.unwrap().players.len(), 3);

        let wrong = ask(
            &d,
            QueryRequest::new(QueryType::Players, token, 7).with_auth_token("nope"),
        )
        .unwrap();
        assert!(wrong.has_flag(response_flags::AUTH_REQUIRED));
    }

    #[test]
    fn test_unknown_type_answers_basic() {
        let d = dispatcher();
        let token = challenge(&d, CLIENT);
        let mut request = QueryRequest::new(QueryType::Basic, token, 3);
        request.type_code = 0x33;
        let reply = ask(&d, request).unwrap();
        assert!(reply.server_info.is_some());
        assert!(reply.player_list.is_none());
    }

    #[test]
    fn test_players_paginate() {
        let d = dispatcher_with(Permissions::all(), 120);
        let token = challenge(&d, CLIENT);

        let mut offset = 0;
        let mut names = Vec::new();
        loop {
            let reply = ask(
                &d,
                QueryRequest::new(QueryType::Players, token, 1).with_offset(offset),
            )
            .unwrap();
            let list = reply.player_list.clone().unwrap();
            assert_eq!(list.total, 120);
            offset += list.players.len() as u32;
            names.extend(list.players.into_iter().map(|p| p.username));
            if !reply.has_flag(response_flags::HAS_MORE_PLAYERS) {
                break;
            }
        }
        assert_eq!(names.len(), 120);
        assert_eq!(names[0], "player000");
        assert_eq!(names[119], "player119");
    }

    #[test]
    fn test_first_page_is_stable() {
        let d = dispatcher_with(Permissions::all(), 80);
        let token = challenge(&d, CLIENT);
        let request = QueryRequest::new(QueryType::Players, token, 9).encode();
        assert_eq!(d.handle(&request, CLIENT), d.handle(&request, CLIENT));
    }

    #[test]
    fn test_legacy_protocol() {
        let d = dispatcher().with_legacy(true);
        let reply = d.handle(b"HYQUERY\0\x00", CLIENT).unwrap();
        assert!(reply.starts_with(b"HYREPLY\0"));
        let trailer = &reply[reply.len() - 3..];
        assert_eq!(u16::from_le_bytes([trailer[0], trailer[1]]), capabilities::V2_PROTOCOL);

        let disabled = dispatcher();
        assert!(disabled.handle(b"HYQUERY\0\x00", CLIENT).is_none());
    }

    #[tokio::test]
    async fn test_aggregated_answers() {
        let store = Arc::new(MemoryStateStore::new());
        let remote = ServerState::new("survival-0", "Survival").with_max_players(200);
        store.register_server(&remote).await.unwrap();
        store
            .player_join(&PlayerInfo::new(Uuid::from_u128(900), "remote", "survival-0", "Survival"))
            .await
            .unwrap();

        let local = local_server(2);
        let network = Arc::new(NetworkModule::new(
            NetworkConfig {
                enabled: true,
                server_id: "lobby-0".to_string(),
                mode: NetworkMode::Aggregate,
                ..Default::default()
            },
            local.clone(),
        ));
        network.start_with_store(store.clone()).await.unwrap();
        for player in local.players() {
            network
                .record_player_join(player.uuid, player.username)
                .await
                .unwrap();
        }
        network.cache().refresh(store.fetch_snapshot().await.unwrap());

        let d = QueryDispatcher::new(
            ChallengeCodec::new(b"dispatcher-test").unwrap(),
            AccessValidator::default(),
            local,
        )
        .with_network(network.clone());
        let token = challenge(&d, CLIENT);

        let basic = ask(&d, QueryRequest::new(QueryType::Basic, token, 1)).unwrap();
        assert!(basic.has_flag(response_flags::IS_NETWORK));
        let info = basic.server_info.unwrap();
        assert_eq!(info.name, "Lobby");
        assert_eq!(info.player_count, 3);
        assert_eq!(info.max_players, 250);

        let players = ask(&d, QueryRequest::new(QueryType::Players, token, 2)).unwrap();
        assert!(players.has_flag(response_flags::IS_NETWORK));
        assert_eq!(players.player_list.unwrap().total, 3);

        network.stop().await;
        let basic = ask(&d, QueryRequest::new(QueryType::Basic, token, 3)).unwrap();
        assert!(!basic.has_flag(response_flags::IS_NETWORK));
        assert_eq!(basic.server_info.unwrap().player_count, 2);
    }
}
