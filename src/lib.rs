//! # Fleet Query Server
//!
//! Authenticated UDP status queries for a game server, with optional
//! fleet-wide presence shared through a Redis-backed state store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    FLEET QUERY SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  server.rs       - UDP listener loop                         │
//! │  dispatcher.rs   - Per-datagram routing and replies          │
//! │  api.rs          - Read-only fleet facade for host code      │
//! │  provider.rs     - Host data interface (local server)        │
//! │  config.rs       - JSON config + env overrides               │
//! │                                                              │
//! │  auth/           - Request admission                         │
//! │  ├── challenge.rs- Stateless address-bound challenge tokens  │
//! │  └── access.rs   - Per-endpoint bearer token permissions     │
//! │                                                              │
//! │  protocol/       - Wire formats                              │
//! │  ├── wire.rs     - Magic, flags, TLV, byte codecs            │
//! │  ├── request.rs  - ONEQUERY requests                         │
//! │  ├── response.rs - ONEREPLY responses + pagination           │
//! │  └── legacy.rs   - HYQUERY compatibility                     │
//! │                                                              │
//! │  network/        - Fleet presence                            │
//! │  ├── model.rs    - Server/player records, log events         │
//! │  ├── cache.rs    - Local replica of fleet state              │
//! │  ├── module.rs   - PUBLISH / SYNC / AGGREGATE lifecycle      │
//! │  └── store/      - Redis and in-memory state stores          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Request Flow
//!
//! A client first asks for a challenge token, then repeats it in every
//! query. Tokens are stateless: an HMAC over the client address and a
//! 30 second time bucket, accepted for the current and previous buckets.
//! Datagrams without a valid token are dropped without a reply, so the
//! server cannot be used to reflect traffic at a spoofed address.
//!
//! The dispatcher never waits on the store. Fleet-wide answers come from
//! the module's cache, which is kept current by background tasks.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod api;
pub mod auth;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod network;
pub mod protocol;
pub mod provider;
pub mod server;

// Re-export commonly used types
pub use api::QueryApi;
pub use auth::{AccessValidator, ChallengeCodec};
pub use config::{NetworkMode, QueryConfig};
pub use dispatcher::QueryDispatcher;
pub use network::{NetworkModule, NetworkSnapshot, PlayerInfo, ServerState};
pub use provider::{LocalServer, ServerDataProvider, ServerIdentity};
pub use server::{QueryServer, QueryServerError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
