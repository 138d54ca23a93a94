//! Fleet-wide presence.
//!
//! - [`model`]: server, player and event records
//! - [`cache`]: in-process mirror used for aggregated answers
//! - [`store`]: shared store abstraction and its backends
//! - [`module`]: lifecycle and background synchronization

pub mod cache;
pub mod model;
pub mod module;
pub mod store;

pub use cache::LocalStateCache;
pub use model::{NetworkEvent, NetworkSnapshot, PlayerInfo, ServerState};
pub use module::{ModuleState, NetworkError, NetworkModule};
pub use store::{
    JoinOutcome, LeaveOutcome, MemoryStateStore, NetworkStateStore, RedisStateStore, StoreError,
};
