//! In-memory store.
//!
//! Same semantics as the Redis backend without expiry: relocation vacates the
//! old server, leaves only apply on the recorded server, and every mutation
//! appends one entry to a capped log.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{
    JoinOutcome, LeaveOutcome, LogCursor, LogEntry, NetworkStateStore, StoreError,
    EVENT_LOG_MAX_LEN,
};
use crate::network::model::{NetworkEvent, NetworkSnapshot, PlayerInfo, ServerState};

#[derive(Debug, Default)]
struct MemoryState {
    servers: BTreeMap<String, ServerState>,
    server_set: BTreeSet<String>,
    counts: BTreeMap<String, u32>,
    rosters: BTreeMap<String, BTreeMap<Uuid, PlayerInfo>>,
    locations: BTreeMap<Uuid, String>,
    log: VecDeque<(u64, NetworkEvent)>,
    last_seq: u64,
    closed: bool,
}

impl MemoryState {
    fn append(&mut self, event: NetworkEvent, max_len: usize) {
        self.last_seq += 1;
        self.log.push_back((self.last_seq, event));
        while self.log.len() > max_len {
            self.log.pop_front();
        }
    }

    fn decrement(&mut self, server_id: &str) {
        if let Some(count) = self.counts.get_mut(server_id) {
            *count = count.saturating_sub(1);
        }
    }

    fn vacate(&mut self, uuid: Uuid, server_id: &str) {
        let removed = self
            .rosters
            .get_mut(server_id)
            .and_then(|roster| roster.remove(&uuid))
            .is_some();
        if removed {
            self.decrement(server_id);
        }
    }
}

/// Process-local [`NetworkStateStore`].
#[derive(Debug)]
pub struct MemoryStateStore {
    state: Mutex<MemoryState>,
    appended: Notify,
    max_log_len: usize,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::with_log_capacity(EVENT_LOG_MAX_LEN)
    }

    pub fn with_log_capacity(max_log_len: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            appended: Notify::new(),
            max_log_len: max_log_len.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let state = self.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state)
    }

    fn append(&self, state: &mut MemoryState, event: NetworkEvent) {
        state.append(event, self.max_log_len);
        self.appended.notify_waiters();
    }

    /// Stored player count for a server.
    pub fn player_count(&self, server_id: &str) -> u32 {
        self.lock().counts.get(server_id).copied().unwrap_or(0)
    }

    /// Recorded location of a player.
    pub fn location_of(&self, uuid: Uuid) -> Option<String> {
        self.lock().locations.get(&uuid).cloned()
    }

    /// Entries currently retained in the log.
    pub fn log_len(&self) -> usize {
        self.lock().log.len()
    }

    /// Drop a server's records as if they had expired, leaving its id in the
    /// server set.
    pub fn expire_server(&self, server_id: &str) {
        let mut state = self.lock();
        state.servers.remove(server_id);
        state.counts.remove(server_id);
        if let Some(roster) = state.rosters.remove(server_id) {
            for uuid in roster.keys() {
                if state.locations.get(uuid).map(String::as_str) == Some(server_id) {
                    state.locations.remove(uuid);
                }
            }
        }
    }

    fn entries_after(&self, after: &LogCursor) -> Result<Vec<(u64, NetworkEvent)>, StoreError> {
        let after_seq = parse_seq(after);
        let state = self.open()?;
        Ok(state
            .log
            .iter()
            .filter(|(seq, _)| *seq > after_seq)
            .cloned()
            .collect())
    }
}

fn parse_seq(cursor: &LogCursor) -> u64 {
    cursor
        .as_str()
        .split('-')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn format_seq(seq: u64) -> LogCursor {
    LogCursor::new(format!("{}-0", seq))
}

#[async_trait]
impl NetworkStateStore for MemoryStateStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn register_server(&self, server: &ServerState) -> Result<(), StoreError> {
        let mut state = self.open()?;
        let count = state
            .rosters
            .get(&server.server_id)
            .map(|r| r.len() as u32)
            .unwrap_or(0);
        state.counts.insert(server.server_id.clone(), count);
        state
            .servers
            .insert(server.server_id.clone(), server.clone());
        state.server_set.insert(server.server_id.clone());
        self.append(
            &mut state,
            NetworkEvent::ServerOnline {
                server_id: server.server_id.clone(),
                server_name: server.server_name.clone(),
            },
        );
        Ok(())
    }

    async fn unregister_server(&self, server_id: &str) -> Result<(), StoreError> {
        let mut state = self.open()?;
        state.servers.remove(server_id);
        state.counts.remove(server_id);
        state.server_set.remove(server_id);
        if let Some(roster) = state.rosters.remove(server_id) {
            for uuid in roster.keys() {
                if state.locations.get(uuid).map(String::as_str) == Some(server_id) {
                    state.locations.remove(uuid);
                }
            }
        }
        self.append(
            &mut state,
            NetworkEvent::ServerOffline {
                server_id: server_id.to_string(),
                reason: Some("shutdown".to_string()),
            },
        );
        Ok(())
    }

    async fn heartbeat(&self, server: &ServerState) -> Result<(), StoreError> {
        let mut state = self.open()?;
        state
            .servers
            .insert(server.server_id.clone(), server.clone());
        state.server_set.insert(server.server_id.clone());
        let player_count = state.counts.get(&server.server_id).copied().unwrap_or(0);
        self.append(
            &mut state,
            NetworkEvent::ServerHeartbeat {
                server_id: server.server_id.clone(),
                player_count,
                max_players: server.max_players,
            },
        );
        Ok(())
    }

    async fn player_join(&self, player: &PlayerInfo) -> Result<JoinOutcome, StoreError> {
        let mut state = self.open()?;

        let previous = state
            .locations
            .get(&player.uuid)
            .filter(|old| **old != player.server_id)
            .cloned();
        if let Some(old) = &previous {
            state.vacate(player.uuid, old);
        }

        state
            .locations
            .insert(player.uuid, player.server_id.clone());
        let already = state
            .rosters
            .entry(player.server_id.clone())
            .or_default()
            .insert(player.uuid, player.clone())
            .is_some();
        if !already {
            *state.counts.entry(player.server_id.clone()).or_default() += 1;
        }

        self.append(&mut state, NetworkEvent::join(player, previous.clone()));

        Ok(match (previous, already) {
            (Some(from), _) => JoinOutcome::Relocated { from },
            (None, true) => JoinOutcome::Rejoined,
            (None, false) => JoinOutcome::Joined,
        })
    }

    async fn player_leave(&self, uuid: Uuid, server_id: &str) -> Result<LeaveOutcome, StoreError> {
        let mut state = self.open()?;

        match state.locations.get(&uuid) {
            None => return Ok(LeaveOutcome::NotPresent),
            Some(current) if current != server_id => {
                return Ok(LeaveOutcome::LocationMismatch {
                    current: current.clone(),
                })
            }
            Some(_) => {}
        }

        state.locations.remove(&uuid);
        state.vacate(uuid, server_id);
        self.append(
            &mut state,
            NetworkEvent::PlayerLeave {
                uuid,
                server_id: server_id.to_string(),
            },
        );
        Ok(LeaveOutcome::Removed)
    }

    async fn server_players(&self, server_id: &str) -> Result<Vec<PlayerInfo>, StoreError> {
        let state = self.open()?;
        Ok(state
            .rosters
            .get(server_id)
            .map(|roster| roster.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_snapshot(&self) -> Result<NetworkSnapshot, StoreError> {
        let mut state = self.open()?;

        let orphans: Vec<String> = state
            .server_set
            .iter()
            .filter(|id| !state.servers.contains_key(*id))
            .cloned()
            .collect();
        for server_id in orphans {
            state.server_set.remove(&server_id);
            self.append(
                &mut state,
                NetworkEvent::ServerOffline {
                    server_id,
                    reason: Some("expired".to_string()),
                },
            );
        }

        let mut servers = Vec::with_capacity(state.server_set.len());
        let mut players = Vec::new();
        for server_id in &state.server_set {
            if let Some(server) = state.servers.get(server_id) {
                let mut server = server.clone();
                server.player_count = state.counts.get(server_id).copied().unwrap_or(0);
                servers.push(server);
            }
            if let Some(roster) = state.rosters.get(server_id) {
                players.extend(roster.values().cloned());
            }
        }

        Ok(NetworkSnapshot::new(servers, players))
    }

    async fn latest_cursor(&self) -> Result<LogCursor, StoreError> {
        let state = self.open()?;
        Ok(state
            .log
            .back()
            .map(|(seq, _)| format_seq(*seq))
            .unwrap_or_else(LogCursor::origin))
    }

    async fn read_events(
        &self,
        after: &LogCursor,
        max: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let notified = self.appended.notified();
        let mut entries = self.entries_after(after)?;
        if entries.is_empty() && !block.is_zero() {
            let _ = tokio::time::timeout(block, notified).await;
            entries = self.entries_after(after)?;
        }

        Ok(entries
            .into_iter()
            .take(max)
            .map(|(seq, event)| LogEntry {
                id: format_seq(seq),
                event,
            })
            .collect())
    }

    async fn close(&self) {
        self.lock().closed = true;
        self.appended.notify_waiters();
    }
}
