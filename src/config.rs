//! Configuration
//!
//! The query server reads a single JSON document with PascalCase keys. Every
//! field has a default, so an empty object (or no file at all) yields a working
//! local-only setup. A handful of environment variables override the file after
//! it is loaded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default UDP bind address for the query listener.
pub const DEFAULT_BIND: &str = "0.0.0.0:5520";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid bind address: {0}")]
    InvalidBind(String),
    #[error("Unsupported store type: {0}")]
    UnsupportedStore(String),
}

// =============================================================================
// ENDPOINTS AND PERMISSIONS
// =============================================================================

/// Query endpoints that can be gated by permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    /// Server summary.
    Basic,
    /// Paginated player list.
    Players,
}

impl Endpoint {
    /// Name used in configuration and logs.
    pub fn name(self) -> &'static str {
        match self {
            Endpoint::Basic => "basic",
            Endpoint::Players => "players",
        }
    }
}

/// Per-endpoint access flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Permissions {
    pub basic: bool,
    pub players: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self::all()
    }
}

impl Permissions {
    /// Every endpoint allowed.
    pub const fn all() -> Self {
        Self {
            basic: true,
            players: true,
        }
    }

    /// No endpoint allowed.
    pub const fn none() -> Self {
        Self {
            basic: false,
            players: false,
        }
    }

    /// Whether `endpoint` is allowed.
    pub fn allows(&self, endpoint: Endpoint) -> bool {
        match endpoint {
            Endpoint::Basic => self.basic,
            Endpoint::Players => self.players,
        }
    }
}

/// Public defaults plus a table of bearer tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuthConfig {
    /// Permissions granted to requests without a token.
    pub public: Permissions,
    /// Bearer token to permissions.
    pub tokens: BTreeMap<String, Permissions>,
}

impl AuthConfig {
    pub fn is_publicly_accessible(&self, endpoint: Endpoint) -> bool {
        self.public.allows(endpoint)
    }

    /// Permissions attached to a configured token.
    pub fn token(&self, secret: &str) -> Option<&Permissions> {
        self.tokens.get(secret)
    }
}

// =============================================================================
// NETWORK
// =============================================================================

/// Fleet participation mode, fixed for the lifetime of the network module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NetworkMode {
    /// Report own state only.
    Publish,
    /// Also mirror fleet state into the local cache.
    Sync,
    /// Also answer queries from the mirrored fleet state.
    #[default]
    Aggregate,
}

impl NetworkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkMode::Publish => "PUBLISH",
            NetworkMode::Sync => "SYNC",
            NetworkMode::Aggregate => "AGGREGATE",
        }
    }

    /// Parse a mode name; anything unrecognised is `Aggregate`.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "PUBLISH" => NetworkMode::Publish,
            "SYNC" => NetworkMode::Sync,
            _ => NetworkMode::Aggregate,
        }
    }
}

impl From<String> for NetworkMode {
    fn from(value: String) -> Self {
        Self::parse_lenient(&value)
    }
}

impl From<NetworkMode> for String {
    fn from(mode: NetworkMode) -> Self {
        mode.as_str().to_string()
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Redis,
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u32,
    #[serde(rename = "UseTLS")]
    pub use_tls: bool,
    /// Full connection URL; takes precedence over the discrete fields.
    pub url: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            use_tls: false,
            url: None,
        }
    }
}

impl RedisConfig {
    /// Connection URL in `redis://` or `rediss://` form.
    pub fn to_url(&self) -> String {
        if let Some(url) = self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            return url.to_string();
        }

        let scheme = if self.use_tls { "rediss" } else { "redis" };
        let credentials = match (
            self.username.as_deref().filter(|u| !u.is_empty()),
            self.password.as_deref().filter(|p| !p.is_empty()),
        ) {
            (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
            (None, Some(pass)) => format!(":{}@", pass),
            (Some(user), None) => format!("{}@", user),
            (None, None) => String::new(),
        };
        let database = if self.database > 0 {
            format!("/{}", self.database)
        } else {
            String::new()
        };

        format!("{}://{}{}:{}{}", scheme, credentials, self.host, self.port, database)
    }
}

/// Store selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StoreConfig {
    #[serde(rename = "Type")]
    pub kind: String,
    pub redis: RedisConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: "redis".to_string(),
            redis: RedisConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn store_kind(&self) -> Result<StoreKind, ConfigError> {
        match self.kind.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreKind::Redis),
            other => Err(ConfigError::UnsupportedStore(other.to_string())),
        }
    }
}

/// Timer settings. Raw values are kept as written; the getters clamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TimingConfig {
    pub heartbeat_interval_seconds: u64,
    pub cache_refresh_seconds: u64,
    pub server_timeout_seconds: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 15,
            cache_refresh_seconds: 60,
            server_timeout_seconds: 45,
        }
    }
}

impl TimingConfig {
    /// Heartbeat period, clamped to [5s, 300s].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds.clamp(5, 300))
    }

    /// Full cache refresh period, clamped to [10s, 300s].
    pub fn cache_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cache_refresh_seconds.clamp(10, 300))
    }

    /// Heartbeat age after which a server counts as stale.
    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_seconds.max(1))
    }

    /// TTL on store records: two heartbeat periods.
    pub fn record_ttl(&self) -> Duration {
        self.heartbeat_interval() * 2
    }
}

/// Network module settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkConfig {
    pub enabled: bool,
    pub server_id: String,
    pub network_id: String,
    pub mode: NetworkMode,
    pub store: StoreConfig,
    pub timing: TimingConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_id: "server-1".to_string(),
            network_id: "default".to_string(),
            mode: NetworkMode::Aggregate,
            store: StoreConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// SYNC and AGGREGATE mirror fleet state.
    pub fn should_sync(&self) -> bool {
        matches!(self.mode, NetworkMode::Sync | NetworkMode::Aggregate)
    }

    pub fn should_aggregate(&self) -> bool {
        self.mode == NetworkMode::Aggregate
    }

    fn normalize(&mut self) {
        if self.server_id.trim().is_empty() {
            self.server_id = "server-1".to_string();
        }
        if self.network_id.trim().is_empty() {
            self.network_id = "default".to_string();
        }
    }
}

// =============================================================================
// SERVER INFO OVERRIDES
// =============================================================================

/// Values that replace what the host reports about itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServerInfoConfig {
    pub server_name: Option<String>,
    pub motd: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_players: Option<u32>,
}

impl ServerInfoConfig {
    pub fn has_overrides(&self) -> bool {
        self.server_name.is_some()
            || self.motd.is_some()
            || self.host.is_some()
            || self.port.is_some()
            || self.max_players.is_some()
    }
}

// =============================================================================
// ROOT
// =============================================================================

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct QueryConfig {
    pub enabled: bool,
    pub legacy_protocol_enabled: bool,
    /// UDP listener address.
    pub bind: String,
    pub authentication: AuthConfig,
    pub network: NetworkConfig,
    pub server_info: ServerInfoConfig,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            legacy_protocol_enabled: true,
            bind: DEFAULT_BIND.to_string(),
            authentication: AuthConfig::default(),
            network: NetworkConfig::default(),
            server_info: ServerInfoConfig::default(),
        }
    }
}

impl QueryConfig {
    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parse a JSON document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(text)?;
        config.network.normalize();
        Ok(config)
    }

    /// Apply `FLEETQUERY_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(bind) = get("FLEETQUERY_BIND") {
            self.bind = bind;
        }
        if let Some(server_id) = get("FLEETQUERY_SERVER_ID") {
            self.network.server_id = server_id;
        }
        if let Some(network_id) = get("FLEETQUERY_NETWORK_ID") {
            self.network.network_id = network_id;
        }
        if let Some(mode) = get("FLEETQUERY_MODE") {
            self.network.mode = NetworkMode::parse_lenient(&mode);
        }
        if let Some(url) = get("FLEETQUERY_REDIS_URL") {
            self.network.store.redis.url = Some(url);
            self.network.enabled = true;
        }
        self.network.normalize();
    }

    /// Parsed listener address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|_| ConfigError::InvalidBind(self.bind.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_url_is_accepted_by_client() {
        let redis = RedisConfig {
            host: "cache.internal".to_string(),
            use_tls: true,
            ..Default::default()
        };
        let url = redis.to_url();
        assert!(url.starts_with("rediss://"));
        assert!(::redis::Client::open(url.as_str()).is_ok());

        let plain = RedisConfig::default().to_url();
        assert!(::redis::Client::open(plain.as_str()).is_ok());
    }

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = QueryConfig::from_json("{}").unwrap();
        assert!(config.enabled);
        assert!(config.legacy_protocol_enabled);
        assert!(config.authentication.public.allows(Endpoint::Basic));
        assert!(config.authentication.public.allows(Endpoint::Players));
        assert!(!config.network.enabled);
        assert_eq!(config.network.server_id, "server-1");
        assert_eq!(config.network.network_id, "default");
        assert_eq!(config.network.mode, NetworkMode::Aggregate);
        assert_eq!(config.bind_addr().unwrap().port(), 5520);
    }

    #[test]
    fn test_full_document() {
        let json = r#"{
            "LegacyProtocolEnabled": false,
            "Authentication": {
                "Public": { "Basic": true, "Players": false },
                "Tokens": { "s3cret": { "Basic": true, "Players": true } }
            },
            "Network": {
                "Enabled": true,
                "ServerId": "lobby-0",
                "NetworkId": "eu",
                "Mode": "publish",
                "Store": { "Type": "redis", "Redis": { "Host": "cache", "Port": 6380, "Password": "pw", "Database": 2, "UseTLS": true } },
                "Timing": { "HeartbeatIntervalSeconds": 1, "CacheRefreshSeconds": 1000 }
            },
            "ServerInfo": { "ServerName": "Lobby", "MaxPlayers": 200 }
        }"#;
        let config = QueryConfig::from_json(json).unwrap();

        assert!(!config.legacy_protocol_enabled);
        assert!(!config.authentication.is_publicly_accessible(Endpoint::Players));
        assert!(config.authentication.token("s3cret").unwrap().players);
        assert!(config.authentication.token("other").is_none());

        let network = &config.network;
        assert_eq!(network.server_id, "lobby-0");
        assert_eq!(network.mode, NetworkMode::Publish);
        assert!(!network.should_sync());
        assert!(!network.should_aggregate());
        assert_eq!(network.store.store_kind().unwrap(), StoreKind::Redis);
        assert_eq!(network.store.redis.to_url(), "rediss://:pw@cache:6380/2");
        assert_eq!(network.timing.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(network.timing.cache_refresh_interval(), Duration::from_secs(300));
        assert_eq!(network.timing.record_ttl(), Duration::from_secs(10));

        assert!(config.server_info.has_overrides());
        assert_eq!(config.server_info.max_players, Some(200));
    }

    #[test]
    fn test_unknown_mode_falls_back_to_aggregate() {
        assert_eq!(NetworkMode::parse_lenient("bogus"), NetworkMode::Aggregate);
        assert_eq!(NetworkMode::parse_lenient(""), NetworkMode::Aggregate);
        assert_eq!(NetworkMode::parse_lenient(" sync "), NetworkMode::Sync);

        let config = QueryConfig::from_json(r#"{"Network":{"Mode":"???"}}"#).unwrap();
        assert!(config.network.should_sync());
        assert!(config.network.should_aggregate());
    }

    #[test]
    fn test_blank_ids_fall_back() {
        let config =
            QueryConfig::from_json(r#"{"Network":{"ServerId":" ","NetworkId":""}}"#).unwrap();
        assert_eq!(config.network.server_id, "server-1");
        assert_eq!(config.network.network_id, "default");
    }

    #[test]
    fn test_unsupported_store_rejected() {
        let config = QueryConfig::from_json(r#"{"Network":{"Store":{"Type":"mysql"}}}"#).unwrap();
        assert!(matches!(
            config.network.store.store_kind(),
            Err(ConfigError::UnsupportedStore(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let mut config = QueryConfig::default();
        config.apply_overrides(|key| match key {
            "FLEETQUERY_SERVER_ID" => Some("survival-0".to_string()),
            "FLEETQUERY_MODE" => Some("SYNC".to_string()),
            "FLEETQUERY_REDIS_URL" => Some("redis://10.0.0.1:6379".to_string()),
            "FLEETQUERY_BIND" => Some("   ".to_string()),
            _ => None,
        });

        assert_eq!(config.network.server_id, "survival-0");
        assert_eq!(config.network.mode, NetworkMode::Sync);
        assert!(config.network.enabled);
        assert_eq!(config.network.store.redis.to_url(), "redis://10.0.0.1:6379");
        assert_eq!(config.bind, DEFAULT_BIND);
    }

    #[test]
    fn test_plain_redis_url() {
        assert_eq!(RedisConfig::default().to_url(), "redis://localhost:6379");
    }

    #[test]
    fn test_bad_bind_rejected() {
        let config = QueryConfig {
            bind: "not-an-address".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.bind_addr(), Err(ConfigError::InvalidBind(_))));
    }

    #[test]
    fn test_mode_serializes_uppercase() {
        let json = serde_json::to_string(&NetworkMode::Sync).unwrap();
        assert_eq!(json, "\"SYNC\"");
    }
}
