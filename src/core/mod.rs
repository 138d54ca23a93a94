//! Shared primitives.
//!
//! Wall-clock helpers and the small set of cryptographic utilities used by
//! the challenge token codec and the access token validator.

pub mod crypto;
pub mod time;

pub use crypto::{constant_time_eq, generate_secret, short_hex, SECRET_SIZE};
pub use time::{now_millis, now_secs};
