//! Network State Store
//!
//! Shared record of which servers are up and which players are where, plus a
//! capped, ordered log of changes. Each mutating call is one atomic step on
//! the backend and appends exactly one log entry.
//!
//! | Backend               | Use                                   |
//! |-----------------------|---------------------------------------|
//! | [`RedisStateStore`]   | Production, shared across processes   |
//! | [`MemoryStateStore`]  | Tests and single-process deployments  |

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::model::{NetworkEvent, NetworkSnapshot, PlayerInfo, ServerState};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStateStore;
pub use self::redis::{RedisStateStore, StoreSettings};

/// Log entries kept before the oldest are pruned.
pub const EVENT_LOG_MAX_LEN: usize = 1000;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("Timed out during {0}")]
    Timeout(&'static str),
    #[error("Could not connect to store: {0}")]
    Connect(String),
    #[error("Malformed record: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Unexpected script reply: {0}")]
    UnexpectedReply(String),
    #[error("Store is closed")]
    Closed,
}

/// Position in the event log. Reads return entries strictly after it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogCursor(String);

impl LogCursor {
    /// Before the first entry.
    pub fn origin() -> Self {
        Self("0-0".to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LogCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One event read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: LogCursor,
    pub event: NetworkEvent,
}

/// Result of recording a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// No previous location.
    Joined,
    /// Already on this server; record refreshed.
    Rejoined,
    /// Moved off `from`.
    Relocated { from: String },
}

/// Result of recording a leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    Removed,
    /// No recorded location.
    NotPresent,
    /// The player is recorded on another server; nothing changed.
    LocationMismatch { current: String },
}

/// Shared presence store.
#[async_trait]
pub trait NetworkStateStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Publish a server record and announce it online.
    async fn register_server(&self, state: &ServerState) -> Result<(), StoreError>;

    /// Delete a server record and its players, announce it offline.
    async fn unregister_server(&self, server_id: &str) -> Result<(), StoreError>;

    /// Refresh TTLs on the server and its players. Does not change the count.
    async fn heartbeat(&self, state: &ServerState) -> Result<(), StoreError>;

    /// Record `player` on `player.server_id`, vacating any previous server.
    async fn player_join(&self, player: &PlayerInfo) -> Result<JoinOutcome, StoreError>;

    /// Remove a player if still recorded on `server_id`.
    async fn player_leave(&self, uuid: Uuid, server_id: &str) -> Result<LeaveOutcome, StoreError>;

    /// Players recorded on one server.
    async fn server_players(&self, server_id: &str) -> Result<Vec<PlayerInfo>, StoreError>;

    /// Full read of every tracked server. Orphaned server ids are dropped and
    /// announced offline.
    async fn fetch_snapshot(&self) -> Result<NetworkSnapshot, StoreError>;

    /// Cursor of the newest log entry.
    async fn latest_cursor(&self) -> Result<LogCursor, StoreError>;

    /// Up to `max` entries after `after`, waiting up to `block` if none.
    async fn read_events(
        &self,
        after: &LogCursor,
        max: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, StoreError>;

    /// Release connections. Later calls fail with [`StoreError::Closed`].
    async fn close(&self);
}
