//! Redis-backed store.
//!
//! Every mutation is one Lua script so concurrent readers never observe a
//! half-applied transition. Keys for a network share a hash tag and land on
//! one cluster slot:
//!
//! ```text
//! fleetquery:network:{<network>}:servers               SET   server ids
//! fleetquery:network:{<network>}:server:<id>           HASH  server fields
//! fleetquery:network:{<network>}:server:<id>:players   HASH  uuid -> {username, joinTime}
//! fleetquery:network:{<network>}:player:<uuid>         STR   server id
//! fleetquery:network:{<network>}:events                STREAM data=<json event>
//! ```
//!
//! Scripts are invoked by SHA and resent in full when the server reports the
//! script is not cached.

use ::redis::aio::MultiplexedConnection;
use ::redis::streams::{StreamRangeReply, StreamReadOptions, StreamReadReply};
use ::redis::{AsyncCommands, ErrorKind, FromRedisValue, RedisResult};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    JoinOutcome, LeaveOutcome, LogCursor, LogEntry, NetworkStateStore, StoreError,
    EVENT_LOG_MAX_LEN,
};
use crate::network::model::{NetworkEvent, NetworkSnapshot, PlayerInfo, ServerState};
use crate::provider::DEFAULT_GAME_PORT;

/// Per-command timeout.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
/// Connection establishment timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// SCRIPTS
// =============================================================================

const REGISTER_SCRIPT: &str = r#"
redis.call('HDEL', KEYS[1], 'host')
for i = 5, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('HSET', KEYS[1], 'playerCount', redis.call('HLEN', KEYS[2]))
redis.call('EXPIRE', KEYS[1], ARGV[3])
redis.call('SADD', KEYS[3], ARGV[1])
local event = cjson.encode({type = 'server_online', server_id = ARGV[1], server_name = ARGV[2]})
redis.call('XADD', KEYS[4], 'MAXLEN', '~', ARGV[4], '*', 'data', event)
return 1
"#;

const HEARTBEAT_SCRIPT: &str = r#"
for i = 5, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('HSETNX', KEYS[1], 'playerCount', redis.call('HLEN', KEYS[2]))
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[1])
local uuids = redis.call('HKEYS', KEYS[2])
if #uuids > 0 then
  redis.call('EXPIRE', KEYS[2], ARGV[2])
  for _, uuid in ipairs(uuids) do
    redis.call('EXPIRE', ARGV[4] .. uuid, ARGV[2])
  end
end
local count = tonumber(redis.call('HGET', KEYS[1], 'playerCount')) or 0
local maxPlayers = tonumber(redis.call('HGET', KEYS[1], 'maxPlayers')) or 0
local event = cjson.encode({type = 'server_heartbeat', server_id = ARGV[1], player_count = count, max_players = maxPlayers})
redis.call('XADD', KEYS[4], 'MAXLEN', '~', ARGV[3], '*', 'data', event)
return count
"#;

const JOIN_SCRIPT: &str = r#"
local previous = redis.call('GET', KEYS[1])
local relocated = false
if previous and previous ~= ARGV[2] then
  local oldServer = ARGV[5] .. previous
  if redis.call('HDEL', oldServer .. ':players', ARGV[1]) == 1 then
    local count = tonumber(redis.call('HGET', oldServer, 'playerCount'))
    if count and count > 0 then
      redis.call('HINCRBY', oldServer, 'playerCount', -1)
    end
  end
  relocated = true
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[4])
local existed = redis.call('HEXISTS', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
redis.call('EXPIRE', KEYS[2], ARGV[4])
if existed == 0 and redis.call('EXISTS', KEYS[3]) == 1 then
  redis.call('HINCRBY', KEYS[3], 'playerCount', 1)
end
local event = {type = 'player_join', uuid = ARGV[1], username = ARGV[7], server_id = ARGV[2], server_name = ARGV[8]}
if relocated then
  event['previous_server_id'] = previous
end
redis.call('XADD', KEYS[4], 'MAXLEN', '~', ARGV[6], '*', 'data', cjson.encode(event))
if relocated then
  return {'relocated', previous}
end
if existed == 1 then
  return {'rejoined'}
end
return {'joined'}
"#;

const LEAVE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return {'absent'}
end
if current ~= ARGV[2] then
  return {'mismatch', current}
end
redis.call('DEL', KEYS[1])
if redis.call('HDEL', KEYS[2], ARGV[1]) == 1 then
  local count = tonumber(redis.call('HGET', KEYS[3], 'playerCount'))
  if count and count > 0 then
    redis.call('HINCRBY', KEYS[3], 'playerCount', -1)
  end
end
local event = cjson.encode({type = 'player_leave', uuid = ARGV[1], server_id = ARGV[2]})
redis.call('XADD', KEYS[4], 'MAXLEN', '~', ARGV[3], '*', 'data', event)
return {'removed'}
"#;

const UNREGISTER_SCRIPT: &str = r#"
local uuids = redis.call('HKEYS', KEYS[2])
for _, uuid in ipairs(uuids) do
  local key = ARGV[3] .. uuid
  if redis.call('GET', key) == ARGV[1] then
    redis.call('DEL', key)
  end
end
redis.call('DEL', KEYS[1], KEYS[2])
redis.call('SREM', KEYS[3], ARGV[1])
local event = cjson.encode({type = 'server_offline', server_id = ARGV[1], reason = ARGV[4]})
redis.call('XADD', KEYS[4], 'MAXLEN', '~', ARGV[2], '*', 'data', event)
return 1
"#;

const ORPHAN_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
if redis.call('SREM', KEYS[2], ARGV[1]) == 0 then
  return 0
end
local event = cjson.encode({type = 'server_offline', server_id = ARGV[1], reason = 'expired'})
redis.call('XADD', KEYS[3], 'MAXLEN', '~', ARGV[2], '*', 'data', event)
return 1
"#;

struct LuaScript {
    name: &'static str,
    source: &'static str,
    sha: String,
}

impl LuaScript {
    fn new(name: &'static str, source: &'static str) -> Self {
        Self {
            name,
            source,
            sha: ::redis::Script::new(source).get_hash().to_string(),
        }
    }
}

struct Scripts {
    register: LuaScript,
    heartbeat: LuaScript,
    join: LuaScript,
    leave: LuaScript,
    unregister: LuaScript,
    orphan: LuaScript,
}

impl Scripts {
    fn load() -> Self {
        Self {
            register: LuaScript::new("register", REGISTER_SCRIPT),
            heartbeat: LuaScript::new("heartbeat", HEARTBEAT_SCRIPT),
            join: LuaScript::new("player_join", JOIN_SCRIPT),
            leave: LuaScript::new("player_leave", LEAVE_SCRIPT),
            unregister: LuaScript::new("unregister", UNREGISTER_SCRIPT),
            orphan: LuaScript::new("orphan", ORPHAN_SCRIPT),
        }
    }
}

// =============================================================================
// KEYS AND RECORDS
// =============================================================================

#[derive(Debug, Clone)]
struct KeySpace {
    prefix: String,
}

impl KeySpace {
    fn new(network_id: &str) -> Self {
        Self {
            prefix: format!("fleetquery:network:{{{}}}", network_id),
        }
    }

    fn server_prefix(&self) -> String {
        format!("{}:server:", self.prefix)
    }

    fn server(&self, server_id: &str) -> String {
        format!("{}:server:{}", self.prefix, server_id)
    }

    fn server_players(&self, server_id: &str) -> String {
        format!("{}:server:{}:players", self.prefix, server_id)
    }

    fn player_prefix(&self) -> String {
        format!("{}:player:", self.prefix)
    }

    fn player(&self, uuid: Uuid) -> String {
        format!("{}:player:{}", self.prefix, uuid)
    }

    fn servers(&self) -> String {
        format!("{}:servers", self.prefix)
    }

    fn events(&self) -> String {
        format!("{}:events", self.prefix)
    }
}

/// Player hash value.
#[derive(Debug, Serialize, Deserialize)]
struct StoredPlayer {
    username: String,
    #[serde(rename = "joinTime")]
    join_time: i64,
}

/// Server hash fields written on register and heartbeat. `playerCount` is
/// owned by the join and leave scripts.
fn server_fields(state: &ServerState) -> Vec<String> {
    let mut fields = vec![
        "serverName".to_string(),
        state.server_name.clone(),
        "maxPlayers".to_string(),
        state.max_players.to_string(),
        "port".to_string(),
        state.port.to_string(),
        "lastHeartbeat".to_string(),
        state.last_heartbeat.to_string(),
    ];
    if let Some(host) = &state.host {
        fields.push("host".to_string());
        fields.push(host.clone());
    }
    fields
}

/// Decode a server hash. An empty hash means the record is gone; a hash
/// without `lastHeartbeat` decodes as never seen, so it reads as stale.
fn parse_server(server_id: &str, fields: &BTreeMap<String, String>) -> Option<ServerState> {
    if fields.is_empty() {
        return None;
    }
    let number = |key: &str| fields.get(key).and_then(|v| v.parse::<i64>().ok());

    Some(ServerState {
        server_id: server_id.to_string(),
        server_name: fields
            .get("serverName")
            .cloned()
            .unwrap_or_else(|| server_id.to_string()),
        player_count: number("playerCount").unwrap_or(0).clamp(0, u32::MAX as i64) as u32,
        max_players: number("maxPlayers").unwrap_or(100).clamp(0, u32::MAX as i64) as u32,
        host: fields.get("host").filter(|h| !h.is_empty()).cloned(),
        port: fields
            .get("port")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_GAME_PORT),
        last_heartbeat: number("lastHeartbeat").unwrap_or(0),
    })
}

fn parse_players(
    server_id: &str,
    server_name: &str,
    roster: &BTreeMap<String, String>,
) -> Vec<PlayerInfo> {
    roster
        .iter()
        .filter_map(|(uuid, json)| {
            let uuid = Uuid::parse_str(uuid).ok()?;
            match serde_json::from_str::<StoredPlayer>(json) {
                Ok(stored) => Some(PlayerInfo {
                    uuid,
                    username: stored.username,
                    server_id: server_id.to_string(),
                    server_name: server_name.to_string(),
                    join_time: stored.join_time,
                }),
                Err(e) => {
                    debug!(%uuid, server_id, error = %e, "Skipping malformed player record");
                    None
                }
            }
        })
        .collect()
}

fn parse_join_reply(reply: &[String]) -> Result<JoinOutcome, StoreError> {
    match reply {
        [kind] if kind == "joined" => Ok(JoinOutcome::Joined),
        [kind] if kind == "rejoined" => Ok(JoinOutcome::Rejoined),
        [kind, from] if kind == "relocated" => Ok(JoinOutcome::Relocated { from: from.clone() }),
        other => Err(StoreError::UnexpectedReply(format!("{:?}", other))),
    }
}

fn parse_leave_reply(reply: &[String]) -> Result<LeaveOutcome, StoreError> {
    match reply {
        [kind] if kind == "removed" => Ok(LeaveOutcome::Removed),
        [kind] if kind == "absent" => Ok(LeaveOutcome::NotPresent),
        [kind, current] if kind == "mismatch" => Ok(LeaveOutcome::LocationMismatch {
            current: current.clone(),
        }),
        other => Err(StoreError::UnexpectedReply(format!("{:?}", other))),
    }
}

async fn timed<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoreError::Timeout(operation)),
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Connection settings for [`RedisStateStore`].
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub url: String,
    pub network_id: String,
    /// TTL on server and player records.
    pub record_ttl: Duration,
}

struct Connections {
    command: MultiplexedConnection,
    /// Dedicated to blocking log reads.
    tail: MultiplexedConnection,
}

/// [`NetworkStateStore`] over Redis.
pub struct RedisStateStore {
    /// `None` once closed.
    connections: Mutex<Option<Connections>>,
    keys: KeySpace,
    scripts: Scripts,
    ttl_secs: u64,
}

impl std::fmt::Debug for RedisStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStateStore")
            .field("prefix", &self.keys.prefix)
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl RedisStateStore {
    /// Open the command and tail connections and check the server answers.
    pub async fn connect(settings: &StoreSettings) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(settings.url.as_str())?;

        let conn = Self::open_connection(&client).await?;
        let tail_conn = Self::open_connection(&client).await?;

        let mut ping_conn = conn.clone();
        let pong: String = timed(
            "ping",
            COMMAND_TIMEOUT,
            ::redis::cmd("PING").query_async(&mut ping_conn),
        )
        .await?;
        debug!(reply = %pong, "Store answered ping");

        let store = Self {
            connections: Mutex::new(Some(Connections {
                command: conn,
                tail: tail_conn,
            })),
            keys: KeySpace::new(&settings.network_id),
            scripts: Scripts::load(),
            ttl_secs: settings.record_ttl.as_secs().max(1),
        };

        info!(
            network_id = %settings.network_id,
            ttl_secs = store.ttl_secs,
            "Connected to Redis store"
        );
        Ok(store)
    }

    async fn open_connection(
        client: &::redis::Client,
    ) -> Result<MultiplexedConnection, StoreError> {
        match tokio::time::timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection())
            .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(StoreError::Connect(e.to_string())),
            Err(_) => Err(StoreError::Timeout("connect")),
        }
    }

    fn connections(&self) -> MutexGuard<'_, Option<Connections>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn conn(&self) -> Result<MultiplexedConnection, StoreError> {
        self.connections()
            .as_ref()
            .map(|c| c.command.clone())
            .ok_or(StoreError::Closed)
    }

    fn tail_conn(&self) -> Result<MultiplexedConnection, StoreError> {
        self.connections()
            .as_ref()
            .map(|c| c.tail.clone())
            .ok_or(StoreError::Closed)
    }

    /// Run a script by SHA, resending the source once if it is not cached.
    async fn eval<T>(
        &self,
        script: &LuaScript,
        keys: &[String],
        args: &[String],
    ) -> Result<T, StoreError>
    where
        T: FromRedisValue + Send,
    {
        let mut conn = self.conn()?;

        let mut by_sha = ::redis::cmd("EVALSHA");
        by_sha.arg(script.sha.as_str()).arg(keys.len());
        for key in keys {
            by_sha.arg(key.as_str());
        }
        for arg in args {
            by_sha.arg(arg.as_str());
        }

        let result: Result<T, StoreError> =
            timed(script.name, COMMAND_TIMEOUT, by_sha.query_async(&mut conn)).await;
        match result {
            Err(StoreError::Redis(e)) if e.kind() == ErrorKind::NoScriptError => {
                debug!(script = script.name, "Script not cached, sending source");
                let mut by_source = ::redis::cmd("EVAL");
                by_source.arg(script.source).arg(keys.len());
                for key in keys {
                    by_source.arg(key.as_str());
                }
                for arg in args {
                    by_source.arg(arg.as_str());
                }
                timed(script.name, COMMAND_TIMEOUT, by_source.query_async(&mut conn)).await
            }
            other => other,
        }
    }

    async fn read_server(
        &self,
        server_id: &str,
    ) -> Result<Option<(ServerState, Vec<PlayerInfo>)>, StoreError> {
        let mut conn = self.conn()?;
        let (fields, roster): (BTreeMap<String, String>, BTreeMap<String, String>) = timed(
            "read_server",
            COMMAND_TIMEOUT,
            ::redis::pipe()
                .hgetall(self.keys.server(server_id))
                .hgetall(self.keys.server_players(server_id))
                .query_async(&mut conn),
        )
        .await?;

        Ok(parse_server(server_id, &fields).map(|server| {
            let players = parse_players(server_id, &server.server_name, &roster);
            (server, players)
        }))
    }

    async fn heal_orphan(&self, server_id: &str) -> Result<bool, StoreError> {
        let removed: i64 = self
            .eval(
                &self.scripts.orphan,
                &[
                    self.keys.server(server_id),
                    self.keys.servers(),
                    self.keys.events(),
                ],
                &[server_id.to_string(), EVENT_LOG_MAX_LEN.to_string()],
            )
            .await?;
        if removed == 1 {
            warn!(server_id, "Removed orphaned server id from server set");
        }
        Ok(removed == 1)
    }
}

#[async_trait]
impl NetworkStateStore for RedisStateStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn register_server(&self, state: &ServerState) -> Result<(), StoreError> {
        let mut args = vec![
            state.server_id.clone(),
            state.server_name.clone(),
            self.ttl_secs.to_string(),
            EVENT_LOG_MAX_LEN.to_string(),
        ];
        args.extend(server_fields(state));

        let _: i64 = self
            .eval(
                &self.scripts.register,
                &[
                    self.keys.server(&state.server_id),
                    self.keys.server_players(&state.server_id),
                    self.keys.servers(),
                    self.keys.events(),
                ],
                &args,
            )
            .await?;
        Ok(())
    }

    async fn unregister_server(&self, server_id: &str) -> Result<(), StoreError> {
        let _: i64 = self
            .eval(
                &self.scripts.unregister,
                &[
                    self.keys.server(server_id),
                    self.keys.server_players(server_id),
                    self.keys.servers(),
                    self.keys.events(),
                ],
                &[
                    server_id.to_string(),
                    EVENT_LOG_MAX_LEN.to_string(),
                    self.keys.player_prefix(),
                    "shutdown".to_string(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn heartbeat(&self, state: &ServerState) -> Result<(), StoreError> {
        let mut args = vec![
            state.server_id.clone(),
            self.ttl_secs.to_string(),
            EVENT_LOG_MAX_LEN.to_string(),
            self.keys.player_prefix(),
        ];
        args.extend(server_fields(state));

        let _: i64 = self
            .eval(
                &self.scripts.heartbeat,
                &[
                    self.keys.server(&state.server_id),
                    self.keys.server_players(&state.server_id),
                    self.keys.servers(),
                    self.keys.events(),
                ],
                &args,
            )
            .await?;
        Ok(())
    }

    async fn player_join(&self, player: &PlayerInfo) -> Result<JoinOutcome, StoreError> {
        let record = serde_json::to_string(&StoredPlayer {
            username: player.username.clone(),
            join_time: player.join_time,
        })?;

        let reply: Vec<String> = self
            .eval(
                &self.scripts.join,
                &[
                    self.keys.player(player.uuid),
                    self.keys.server_players(&player.server_id),
                    self.keys.server(&player.server_id),
                    self.keys.events(),
                ],
                &[
                    player.uuid.to_string(),
                    player.server_id.clone(),
                    record,
                    self.ttl_secs.to_string(),
                    self.keys.server_prefix(),
                    EVENT_LOG_MAX_LEN.to_string(),
                    player.username.clone(),
                    player.server_name.clone(),
                ],
            )
            .await?;
        parse_join_reply(&reply)
    }

    async fn player_leave(&self, uuid: Uuid, server_id: &str) -> Result<LeaveOutcome, StoreError> {
        let reply: Vec<String> = self
            .eval(
                &self.scripts.leave,
                &[
                    self.keys.player(uuid),
                    self.keys.server_players(server_id),
                    self.keys.server(server_id),
                    self.keys.events(),
                ],
                &[
                    uuid.to_string(),
                    server_id.to_string(),
                    EVENT_LOG_MAX_LEN.to_string(),
                ],
            )
            .await?;
        parse_leave_reply(&reply)
    }

    async fn server_players(&self, server_id: &str) -> Result<Vec<PlayerInfo>, StoreError> {
        Ok(self
            .read_server(server_id)
            .await?
            .map(|(_, players)| players)
            .unwrap_or_default())
    }

    async fn fetch_snapshot(&self) -> Result<NetworkSnapshot, StoreError> {
        let mut conn = self.conn()?;
        let mut server_ids: Vec<String> =
            timed("smembers", COMMAND_TIMEOUT, conn.smembers(self.keys.servers())).await?;
        server_ids.sort();

        let reads = join_all(server_ids.iter().map(|id| self.read_server(id))).await;

        let mut servers = Vec::with_capacity(server_ids.len());
        let mut players = Vec::new();
        for (server_id, read) in server_ids.iter().zip(reads) {
            match read? {
                Some((server, roster)) => {
                    servers.push(server);
                    players.extend(roster);
                }
                None => {
                    self.heal_orphan(server_id).await?;
                }
            }
        }

        Ok(NetworkSnapshot::new(servers, players))
    }

    async fn latest_cursor(&self) -> Result<LogCursor, StoreError> {
        let mut conn = self.conn()?;
        let reply: StreamRangeReply = timed(
            "xrevrange",
            COMMAND_TIMEOUT,
            ::redis::cmd("XREVRANGE")
                .arg(self.keys.events())
                .arg("+")
                .arg("-")
                .arg("COUNT")
                .arg(1)
                .query_async(&mut conn),
        )
        .await?;

        Ok(reply
            .ids
            .into_iter()
            .next()
            .map(|entry| LogCursor::new(entry.id))
            .unwrap_or_else(LogCursor::origin))
    }

    async fn read_events(
        &self,
        after: &LogCursor,
        max: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let mut conn = self.tail_conn()?;

        let mut options = StreamReadOptions::default().count(max);
        if !block.is_zero() {
            options = options.block(block.as_millis() as usize);
        }
        let events_key = self.keys.events();
        let reply: Option<StreamReadReply> = timed(
            "xread",
            COMMAND_TIMEOUT + block,
            conn.xread_options(&[events_key.as_str()], &[after.as_str()], &options),
        )
        .await?;

        let mut entries = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for item in stream.ids {
                let Some(data) = item.get::<String>("data") else {
                    debug!(id = %item.id, "Log entry without data field");
                    continue;
                };
                match NetworkEvent::from_json(&data) {
                    Ok(event) => entries.push(LogEntry {
                        id: LogCursor::new(item.id),
                        event,
                    }),
                    Err(e) => debug!(id = %item.id, error = %e, "Skipping malformed log entry"),
                }
            }
        }
        Ok(entries)
    }

    /// Drops both connections. Clones held by in-flight calls finish first.
    async fn close(&self) {
        if self.connections().take().is_some() {
            debug!(prefix = %self.keys.prefix, "Redis store closed");
        }
    }
}
