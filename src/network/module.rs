//! Network Module
//!
//! Owns the store connection for the lifetime of the process and runs the
//! background work that keeps this server visible to the fleet:
//!
//! ```text
//!            ┌────────────┐  register / heartbeat / join / leave
//!  host ───▶ │  Network   │ ─────────────────────────────────────▶ store
//!            │  Module    │ ◀──── log tail (SYNC, AGGREGATE) ─────
//!            └─────┬──────┘ ◀──── full refresh (SYNC, AGGREGATE) ─
//!                  │ patches
//!                  ▼
//!           LocalStateCache ──▶ dispatcher reads (AGGREGATE)
//! ```
//!
//! Heartbeats, the refresh timer and the log tail each run as their own
//! task and are joined on [`NetworkModule::stop`]. Player joins and leaves
//! go through one queue with a single consumer, so the store sees them in
//! the order the host reported them. `stop` drains that queue first.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::cache::LocalStateCache;
use super::model::{NetworkEvent, NetworkSnapshot, PlayerInfo, ServerState};
use super::store::{
    JoinOutcome, LeaveOutcome, LogCursor, NetworkStateStore, RedisStateStore, StoreError,
    StoreSettings,
};
use crate::config::{ConfigError, NetworkConfig, NetworkMode, StoreKind};
use crate::core::now_millis;
use crate::provider::ServerDataProvider;

/// Poll period of the log tail.
pub const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long one tail read may wait for new entries.
pub const TAIL_BLOCK: Duration = Duration::from_millis(50);
/// Entries read per tail poll.
pub const TAIL_BATCH: usize = 100;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Network module errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Network mode is switched off in configuration.
    #[error("Network module is disabled")]
    Disabled,

    /// `start` was called more than once.
    #[error("Network module already started")]
    AlreadyStarted,

    /// The module is not connected to a store.
    #[error("Network module is not running")]
    NotRunning,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Could not reach the store.
    #[error("Store connection failed: {0}")]
    Connect(#[source] StoreError),

    /// Connected, but the local server could not be registered.
    #[error("Server registration failed: {0}")]
    Registration(#[source] StoreError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Lifecycle state, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Idle,
    Starting,
    Running,
    /// Startup failed; local-only answers for the rest of the process.
    Unavailable,
    Stopped,
}

struct Running {
    store: Arc<dyn NetworkStateStore>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    /// Ordered player event queue. Dropping the sender ends the worker.
    player_tx: mpsc::UnboundedSender<PlayerCommand>,
    player_worker: JoinHandle<()>,
}

type Reply<T> = Option<oneshot::Sender<Result<T, StoreError>>>;

enum PlayerCommand {
    Join {
        player: PlayerInfo,
        reply: Reply<JoinOutcome>,
    },
    Leave {
        uuid: Uuid,
        reply: Reply<LeaveOutcome>,
    },
}

enum Lifecycle {
    Idle,
    Starting,
    Running(Running),
    Unavailable,
    Stopped,
}

impl Lifecycle {
    fn state(&self) -> ModuleState {
        match self {
            Lifecycle::Idle => ModuleState::Idle,
            Lifecycle::Starting => ModuleState::Starting,
            Lifecycle::Running(_) => ModuleState::Running,
            Lifecycle::Unavailable => ModuleState::Unavailable,
            Lifecycle::Stopped => ModuleState::Stopped,
        }
    }
}

/// Fleet presence for one server process.
pub struct NetworkModule {
    /// Network settings, fixed for the module's lifetime.
    config: NetworkConfig,
    /// Local server data.
    local: Arc<dyn ServerDataProvider>,
    /// Mirror of fleet state.
    cache: Arc<LocalStateCache>,
    /// In-process event fan-out.
    events: broadcast::Sender<NetworkEvent>,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for NetworkModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkModule")
            .field("server_id", &self.config.server_id)
            .field("network_id", &self.config.network_id)
            .field("mode", &self.config.mode)
            .field("state", &self.state())
            .finish()
    }
}

impl NetworkModule {
    pub fn new(config: NetworkConfig, local: Arc<dyn ServerDataProvider>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cache = Arc::new(LocalStateCache::new(config.timing.server_timeout()));

        Self {
            config,
            local,
            cache,
            events,
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        *self.lifecycle() = next;
    }

    fn store(&self) -> Option<Arc<dyn NetworkStateStore>> {
        match &*self.lifecycle() {
            Lifecycle::Running(running) => Some(running.store.clone()),
            _ => None,
        }
    }

    fn player_queue(&self) -> Option<mpsc::UnboundedSender<PlayerCommand>> {
        match &*self.lifecycle() {
            Lifecycle::Running(running) => Some(running.player_tx.clone()),
            _ => None,
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Connect to the configured store and start.
    ///
    /// Any failure leaves the module [`ModuleState::Unavailable`].
    pub async fn start(&self) -> Result<(), NetworkError> {
        self.begin_start()?;

        let kind = match self.config.store.store_kind() {
            Ok(kind) => kind,
            Err(e) => {
                error!("Network module not started: {}", e);
                self.set_lifecycle(Lifecycle::Unavailable);
                return Err(e.into());
            }
        };

        let store: Arc<dyn NetworkStateStore> = match kind {
            StoreKind::Redis => {
                let settings = StoreSettings {
                    url: self.config.store.redis.to_url(),
                    network_id: self.config.network_id.clone(),
                    record_ttl: self.config.timing.record_ttl(),
                };
                match RedisStateStore::connect(&settings).await {
                    Ok(store) => Arc::new(store),
                    Err(e) => {
                        error!("Could not connect to network store: {}", e);
                        self.set_lifecycle(Lifecycle::Unavailable);
                        return Err(NetworkError::Connect(e));
                    }
                }
            }
        };

        self.finish_start(store).await
    }

    /// Start on an already-connected store.
    pub async fn start_with_store(
        &self,
        store: Arc<dyn NetworkStateStore>,
    ) -> Result<(), NetworkError> {
        self.begin_start()?;
        self.finish_start(store).await
    }

    fn begin_start(&self) -> Result<(), NetworkError> {
        if !self.config.enabled {
            return Err(NetworkError::Disabled);
        }
        let mut lifecycle = self.lifecycle();
        match &*lifecycle {
            Lifecycle::Idle => {
                *lifecycle = Lifecycle::Starting;
                Ok(())
            }
            _ => Err(NetworkError::AlreadyStarted),
        }
    }

    async fn finish_start(&self, store: Arc<dyn NetworkStateStore>) -> Result<(), NetworkError> {
        let local_state = self.local_server_state();
        if let Err(e) = store.register_server(&local_state).await {
            error!(
                "Failed to register {} with {} store: {}",
                self.config.server_id,
                store.name(),
                e
            );
            store.close().await;
            self.set_lifecycle(Lifecycle::Unavailable);
            return Err(NetworkError::Registration(e));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        if self.config.should_sync() {
            // Cursor first, so nothing between it and the snapshot is missed.
            let cursor = match store.latest_cursor().await {
                Ok(cursor) => cursor,
                Err(e) => {
                    warn!("Could not read log position, replaying retained log: {}", e);
                    LogCursor::origin()
                }
            };
            match store.fetch_snapshot().await {
                Ok(snapshot) => self.cache.refresh(snapshot),
                Err(e) => warn!("Initial network snapshot failed: {}", e),
            }

            tasks.push(tokio::spawn(run_event_tail(
                store.clone(),
                self.cache.clone(),
                self.events.clone(),
                cursor,
                shutdown_tx.subscribe(),
            )));
            tasks.push(tokio::spawn(run_cache_refresh(
                store.clone(),
                self.cache.clone(),
                self.config.timing.cache_refresh_interval(),
                shutdown_tx.subscribe(),
            )));
        }

        tasks.push(tokio::spawn(run_heartbeat(
            store.clone(),
            self.local.clone(),
            self.config.server_id.clone(),
            self.config.timing.heartbeat_interval(),
            shutdown_tx.subscribe(),
        )));

        let (player_tx, player_rx) = mpsc::unbounded_channel();
        let player_worker = tokio::spawn(run_player_events(
            store.clone(),
            self.config.server_id.clone(),
            player_rx,
        ));

        self.set_lifecycle(Lifecycle::Running(Running {
            store: store.clone(),
            shutdown_tx,
            tasks,
            player_tx,
            player_worker,
        }));

        let _ = self.events.send(NetworkEvent::ServerOnline {
            server_id: local_state.server_id.clone(),
            server_name: local_state.server_name.clone(),
        });

        info!(
            server_id = %self.config.server_id,
            network_id = %self.config.network_id,
            mode = %self.config.mode,
            store = store.name(),
            "Network module started"
        );
        Ok(())
    }

    /// Stop background tasks, unregister, and release the store.
    pub async fn stop(&self) {
        let running = {
            let mut lifecycle = self.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                previous => {
                    *lifecycle = previous;
                    return;
                }
            }
        };

        let Running {
            store,
            shutdown_tx,
            tasks,
            player_tx,
            player_worker,
        } = running;

        // Queued player events reach the store before the server leaves it.
        drop(player_tx);
        if let Err(e) = player_worker.await {
            warn!("Player event worker ended abnormally: {}", e);
        }

        let _ = shutdown_tx.send(());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Network task ended abnormally: {}", e);
            }
        }

        if let Err(e) = store.unregister_server(&self.config.server_id).await {
            warn!("Failed to unregister {}: {}", self.config.server_id, e);
        }
        store.close().await;
        self.cache.clear();

        let _ = self.events.send(NetworkEvent::ServerOffline {
            server_id: self.config.server_id.clone(),
            reason: Some("shutdown".to_string()),
        });
        info!("Network module stopped");
    }

    pub fn state(&self) -> ModuleState {
        self.lifecycle().state()
    }

    /// True while connected and running.
    pub fn is_enabled(&self) -> bool {
        self.state() == ModuleState::Running
    }

    // =========================================================================
    // PLAYER EVENTS
    // =========================================================================

    /// Record a join and wait for the store.
    ///
    /// Ordered with every other join and leave from this module.
    pub async fn record_player_join(
        &self,
        uuid: Uuid,
        username: impl Into<String>,
    ) -> Result<JoinOutcome, NetworkError> {
        let (reply, outcome) = oneshot::channel();
        self.enqueue(PlayerCommand::Join {
            player: self.local_player(uuid, username.into()),
            reply: Some(reply),
        })?;
        let result = outcome.await.map_err(|_| NetworkError::NotRunning)?;
        Ok(result?)
    }

    /// Record a leave and wait for the store.
    pub async fn record_player_leave(&self, uuid: Uuid) -> Result<LeaveOutcome, NetworkError> {
        let (reply, outcome) = oneshot::channel();
        self.enqueue(PlayerCommand::Leave {
            uuid,
            reply: Some(reply),
        })?;
        let result = outcome.await.map_err(|_| NetworkError::NotRunning)?;
        Ok(result?)
    }

    /// Queue a join notification from the host without waiting.
    pub fn on_player_join(&self, uuid: Uuid, username: impl Into<String>) {
        let player = self.local_player(uuid, username.into());
        if self
            .enqueue(PlayerCommand::Join {
                player,
                reply: None,
            })
            .is_err()
        {
            trace!("Join of {} not recorded: network module not running", uuid);
        }
    }

    /// Queue a leave notification from the host without waiting.
    pub fn on_player_leave(&self, uuid: Uuid) {
        if self
            .enqueue(PlayerCommand::Leave { uuid, reply: None })
            .is_err()
        {
            trace!("Leave of {} not recorded: network module not running", uuid);
        }
    }

    fn enqueue(&self, command: PlayerCommand) -> Result<(), NetworkError> {
        let queue = self.player_queue().ok_or(NetworkError::NotRunning)?;
        queue.send(command).map_err(|_| NetworkError::NotRunning)
    }

    fn local_player(&self, uuid: Uuid, username: String) -> PlayerInfo {
        PlayerInfo::new(
            uuid,
            username,
            self.config.server_id.clone(),
            self.local.server_name(),
        )
    }

    // =========================================================================
    // READS
    // =========================================================================

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn network_id(&self) -> &str {
        &self.config.network_id
    }

    pub fn mode(&self) -> NetworkMode {
        self.config.mode
    }

    pub fn should_sync(&self) -> bool {
        self.config.should_sync()
    }

    pub fn should_aggregate(&self) -> bool {
        self.config.should_aggregate()
    }

    pub fn cache(&self) -> &Arc<LocalStateCache> {
        &self.cache
    }

    /// This server's record as it would be published now.
    pub fn local_server_state(&self) -> ServerState {
        local_server_state(&self.config.server_id, self.local.as_ref())
    }

    /// This server and its players only.
    pub fn local_snapshot(&self) -> NetworkSnapshot {
        let state = self.local_server_state();
        let players = self
            .local
            .players()
            .into_iter()
            .map(|p| PlayerInfo {
                uuid: p.uuid,
                username: p.username,
                server_id: state.server_id.clone(),
                server_name: state.server_name.clone(),
                join_time: state.last_heartbeat,
            })
            .collect();
        NetworkSnapshot::new(vec![state], players)
    }

    /// Best view without a store round trip: the cache when syncing, local
    /// data otherwise.
    pub fn network_snapshot(&self) -> NetworkSnapshot {
        if self.is_enabled() && self.should_sync() {
            self.cache.snapshot()
        } else {
            self.local_snapshot()
        }
    }

    /// Cached fleet view for query answers, when aggregating.
    pub fn aggregated_snapshot(&self) -> Option<NetworkSnapshot> {
        (self.is_enabled() && self.should_aggregate()).then(|| self.cache.snapshot())
    }

    /// Full read from the store.
    pub async fn fetch_network_snapshot(&self) -> Result<NetworkSnapshot, NetworkError> {
        let store = self.store().ok_or(NetworkError::NotRunning)?;
        Ok(store.fetch_snapshot().await?)
    }

    /// Receive fleet events. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }
}

fn local_server_state(server_id: &str, local: &dyn ServerDataProvider) -> ServerState {
    ServerState {
        server_id: server_id.to_string(),
        server_name: local.server_name(),
        player_count: local.player_count(),
        max_players: local.max_players(),
        host: local.host(),
        port: local.port(),
        last_heartbeat: now_millis(),
    }
}

fn log_join(player: &PlayerInfo, outcome: &JoinOutcome) {
    match outcome {
        JoinOutcome::Relocated { from } => debug!(
            "Player {} moved from {} to {}",
            player.uuid, from, player.server_id
        ),
        _ => debug!("Player {} joined {}", player.uuid, player.server_id),
    }
}

fn log_leave(uuid: Uuid, server_id: &str, outcome: &LeaveOutcome) {
    match outcome {
        LeaveOutcome::Removed => debug!("Player {} left {}", uuid, server_id),
        LeaveOutcome::NotPresent => debug!("Leave for {} ignored: no recorded location", uuid),
        LeaveOutcome::LocationMismatch { current } => debug!(
            "Leave for {} from {} ignored: player is on {}",
            uuid, server_id, current
        ),
    }
}

// =============================================================================
// BACKGROUND TASKS
// =============================================================================

/// Applies player events one at a time until every sender is gone.
async fn run_player_events(
    store: Arc<dyn NetworkStateStore>,
    server_id: String,
    mut commands: mpsc::UnboundedReceiver<PlayerCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            PlayerCommand::Join { player, reply } => {
                let result = store.player_join(&player).await;
                match &result {
                    Ok(outcome) => log_join(&player, outcome),
                    Err(e) => warn!("Failed to record join of {}: {}", player.uuid, e),
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            PlayerCommand::Leave { uuid, reply } => {
                let result = store.player_leave(uuid, &server_id).await;
                match &result {
                    Ok(outcome) => log_leave(uuid, &server_id, outcome),
                    Err(e) => warn!("Failed to record leave of {}: {}", uuid, e),
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }
    trace!("Player event queue for {} drained", server_id);
}

async fn run_heartbeat(
    store: Arc<dyn NetworkStateStore>,
    local: Arc<dyn ServerDataProvider>,
    server_id: String,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {}
        }

        let state = local_server_state(&server_id, local.as_ref());
        match store.heartbeat(&state).await {
            Ok(()) => trace!("Heartbeat sent for {}", server_id),
            Err(e) => warn!("Heartbeat failed, retrying next tick: {}", e),
        }
    }
}

async fn run_cache_refresh(
    store: Arc<dyn NetworkStateStore>,
    cache: Arc<LocalStateCache>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {}
        }

        match store.fetch_snapshot().await {
            Ok(snapshot) => {
                cache.refresh(snapshot);
                let pruned = cache.prune_stale_servers();
                debug!(
                    servers = cache.server_count(),
                    players = cache.player_count(),
                    pruned,
                    "Network cache refreshed"
                );
            }
            Err(e) => warn!("Network cache refresh failed: {}", e),
        }
    }
}

async fn run_event_tail(
    store: Arc<dyn NetworkStateStore>,
    cache: Arc<LocalStateCache>,
    events: broadcast::Sender<NetworkEvent>,
    mut cursor: LogCursor,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(TAIL_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!("Tailing network events from {}", cursor);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {}
        }

        match store.read_events(&cursor, TAIL_BATCH, TAIL_BLOCK).await {
            Ok(entries) => {
                for entry in entries {
                    trace!("Event {} {}", entry.id, entry.event.kind());
                    cache.apply_event(&entry.event);
                    for notification in entry.event.notifications() {
                        let _ = events.send(notification);
                    }
                    cursor = entry.id;
                }
            }
            Err(StoreError::Closed) => break,
            Err(e) => debug!("Event poll failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::network::store::MemoryStateStore;
    use crate::provider::{LocalServer, ServerIdentity};
    use tokio::time::timeout;

    fn config(server_id: &str, mode: NetworkMode) -> NetworkConfig {
        NetworkConfig {
            enabled: true,
            server_id: server_id.to_string(),
            network_id: "test".to_string(),
            mode,
            timing: TimingConfig::default(),
            ..Default::default()
        }
    }

    fn local(name: &str) -> Arc<LocalServer> {
        Arc::new(LocalServer::new(ServerIdentity {
            name: name.to_string(),
            ..Default::default()
        }))
    }

    fn module(server_id: &str, mode: NetworkMode) -> NetworkModule {
        NetworkModule::new(config(server_id, mode), local(server_id))
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    /// Player events on the receiver until `stop` matches or the timeout.
    async fn collect_player_events<F>(
        rx: &mut broadcast::Receiver<NetworkEvent>,
        stop: F,
    ) -> Vec<NetworkEvent>
    where
        F: Fn(&NetworkEvent) -> bool,
    {
        let mut seen = Vec::new();
        while let Ok(Ok(event)) = timeout(Duration::from_secs(2), rx.recv()).await {
            let done = stop(&event);
            if matches!(
                event,
                NetworkEvent::PlayerJoin { .. } | NetworkEvent::PlayerLeave { .. }
            ) {
                seen.push(event);
            }
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = Arc::new(MemoryStateStore::new());
        let module = module("lobby-0", NetworkMode::Aggregate);
        assert_eq!(module.state(), ModuleState::Idle);
        assert!(!module.is_enabled());

        module.start_with_store(store.clone()).await.unwrap();
        assert!(module.is_enabled());
        assert!(matches!(
            module.start_with_store(store.clone()).await,
            Err(NetworkError::AlreadyStarted)
        ));
        assert_eq!(module.cache().server_count(), 1);

        module.stop().await;
        assert_eq!(module.state(), ModuleState::Stopped);
        assert_eq!(module.cache().server_count(), 0);
        assert!(matches!(
            store.fetch_snapshot().await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_disabled_module_does_not_start() {
        let mut cfg = config("a", NetworkMode::Publish);
        cfg.enabled = false;
        let module = NetworkModule::new(cfg, local("a"));
        assert!(matches!(
            module.start_with_store(Arc::new(MemoryStateStore::new())).await,
            Err(NetworkError::Disabled)
        ));
        assert_eq!(module.state(), ModuleState::Idle);
    }

    #[tokio::test]
    async fn test_failed_registration_marks_unavailable() {
        let store = Arc::new(MemoryStateStore::new());
        store.close().await;
        let module = module("a", NetworkMode::Aggregate);

        assert!(matches!(
            module.start_with_store(store).await,
            Err(NetworkError::Registration(StoreError::Closed))
        ));
        assert_eq!(module.state(), ModuleState::Unavailable);
        assert!(module.aggregated_snapshot().is_none());
        assert_eq!(module.network_snapshot().server_count(), 1);
        assert!(matches!(
            module.record_player_join(Uuid::from_u128(1), "p").await,
            Err(NetworkError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_unsupported_store_marks_unavailable() {
        let mut cfg = config("a", NetworkMode::Aggregate);
        cfg.store.kind = "etcd".to_string();
        let module = NetworkModule::new(cfg, local("a"));
        assert!(matches!(module.start().await, Err(NetworkError::Config(_))));
        assert_eq!(module.state(), ModuleState::Unavailable);
    }

    #[tokio::test]
    async fn test_publish_mode_does_not_mirror() {
        let store = Arc::new(MemoryStateStore::new());
        let module = module("survival-0", NetworkMode::Publish);
        module.start_with_store(store.clone()).await.unwrap();

        module
            .record_player_join(Uuid::from_u128(1), "p")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(module.cache().player_count(), 0);
        assert!(module.aggregated_snapshot().is_none());
        assert_eq!(store.player_count("survival-0"), 1);
        module.stop().await;
    }

    #[tokio::test]
    async fn test_subscribers_see_lifecycle_events() {
        let store = Arc::new(MemoryStateStore::new());
        let module = module("a", NetworkMode::Sync);
        let mut rx = module.subscribe();

        module.start_with_store(store).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            NetworkEvent::ServerOnline { .. }
        ));

        module.stop().await;
        let last = loop {
            let event = rx.recv().await.unwrap();
            if matches!(event, NetworkEvent::ServerOffline { .. }) {
                break event;
            }
        };
        assert_eq!(last.server_id(), "a");
    }

    #[tokio::test]
    async fn test_leave_reports_mismatch() {
        let store = Arc::new(MemoryStateStore::new());
        let lobby = module("lobby-0", NetworkMode::Publish);
        let survival = module("survival-0", NetworkMode::Publish);
        lobby.start_with_store(store.clone()).await.unwrap();
        survival.start_with_store(store.clone()).await.unwrap();

        let uuid = Uuid::from_u128(3);
        survival.record_player_join(uuid, "p").await.unwrap();
        lobby.record_player_join(uuid, "p").await.unwrap();

        assert_eq!(
            survival.record_player_leave(uuid).await.unwrap(),
            LeaveOutcome::LocationMismatch {
                current: "lobby-0".to_string()
            }
        );
        assert_eq!(store.player_count("lobby-0"), 1);
    }

    #[tokio::test]
    async fn test_lobby_and_survival_share_network() {
        let store = Arc::new(MemoryStateStore::new());
        let lobby = module("lobby-0", NetworkMode::Aggregate);
        let survival = module("survival-0", NetworkMode::Publish);
        lobby.start_with_store(store.clone()).await.unwrap();
        survival.start_with_store(store.clone()).await.unwrap();

        let p = Uuid::from_u128(42);
        assert_eq!(
            survival.record_player_join(p, "P").await.unwrap(),
            JoinOutcome::Joined
        );

        let cache = lobby.cache().clone();
        assert!(
            eventually(|| cache.player_location(p).as_deref() == Some("survival-0")).await,
            "lobby cache never saw P on survival-0"
        );

        let before_survival = store.player_count("survival-0");
        let before_lobby = store.player_count("lobby-0");
        let mut rx = lobby.subscribe();

        assert_eq!(
            lobby.record_player_join(p, "P").await.unwrap(),
            JoinOutcome::Relocated {
                from: "survival-0".to_string()
            }
        );
        assert_eq!(store.player_count("survival-0"), before_survival - 1);
        assert_eq!(store.player_count("lobby-0"), before_lobby + 1);

        let seen = collect_player_events(&mut rx, |e| {
            matches!(e, NetworkEvent::PlayerJoin { server_id, .. } if server_id == "lobby-0")
        })
        .await;
        assert_eq!(seen.len(), 2, "events: {:?}", seen);
        assert_eq!(
            seen[0],
            NetworkEvent::PlayerLeave {
                uuid: p,
                server_id: "survival-0".to_string()
            }
        );
        assert!(matches!(&seen[1], NetworkEvent::PlayerJoin { server_id, .. } if server_id == "lobby-0"));

        assert!(eventually(|| cache.player_location(p).as_deref() == Some("lobby-0")).await);
        let aggregated = lobby.aggregated_snapshot().unwrap();
        assert_eq!(aggregated.server("lobby-0").unwrap().player_count, 1);
        assert_eq!(aggregated.server("survival-0").unwrap().player_count, 0);

        survival.stop().await;
        lobby.stop().await;
    }

    #[tokio::test]
    async fn test_fire_and_forget_join() {
        let store = Arc::new(MemoryStateStore::new());
        let module = module("a", NetworkMode::Aggregate);
        module.start_with_store(store.clone()).await.unwrap();

        module.on_player_join(Uuid::from_u128(1), "p");
        let s = store.clone();
        assert!(eventually(|| s.player_count("a") == 1).await);

        module.on_player_leave(Uuid::from_u128(1));
        assert!(eventually(|| s.player_count("a") == 0).await);
        module.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_join_leave_leaves_nobody_online() {
        let store = Arc::new(MemoryStateStore::new());
        let module = module("lobby-0", NetworkMode::Publish);
        module.start_with_store(store.clone()).await.unwrap();

        for i in 0..2000u128 {
            let uuid = Uuid::from_u128(i + 1);
            module.on_player_join(uuid, format!("p{}", i));
            module.on_player_leave(uuid);
        }
        // Queued behind every event above.
        module
            .record_player_leave(Uuid::from_u128(u128::MAX))
            .await
            .unwrap();

        assert!(store.server_players("lobby-0").await.unwrap().is_empty());
        assert_eq!(store.player_count("lobby-0"), 0);
        module.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_queued_player_events() {
        let store = Arc::new(MemoryStateStore::new());
        let module = module("a", NetworkMode::Publish);
        module.start_with_store(store.clone()).await.unwrap();
        let before = store.log_len();

        for i in 0..50u128 {
            module.on_player_join(Uuid::from_u128(i + 1), format!("p{}", i));
        }
        module.stop().await;

        // Every join plus the offline entry.
        assert_eq!(store.log_len(), before + 51);
        module.on_player_join(Uuid::from_u128(99), "late");
        assert!(matches!(
            module.record_player_join(Uuid::from_u128(99), "late").await,
            Err(NetworkError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_fetch_requires_running() {
        let module = module("a", NetworkMode::Aggregate);
        assert!(matches!(
            module.fetch_network_snapshot().await,
            Err(NetworkError::NotRunning)
        ));
    }
}
