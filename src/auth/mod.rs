//! Query authentication.
//!
//! Two independent checks guard the query endpoint:
//! - [`ChallengeCodec`] proves the requester owns its source address.
//! - [`AccessValidator`] decides which endpoints a bearer token may read.

pub mod access;
pub mod challenge;

pub use access::AccessValidator;
pub use challenge::{AuthError, ChallengeCodec, ChallengeToken, TOKEN_SIZE};
