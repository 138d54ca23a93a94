//! Challenge Tokens
//!
//! Stateless anti-spoofing tokens. A token binds a 30-second time bucket and the
//! client IP through HMAC-SHA256 keyed with a per-process secret:
//!
//! ```text
//! +-------------+-------------+-------------------------------+
//! | bucket (BE) | reserved    | HMAC(secret, bucket || ip)    |
//! | 4 bytes     | 4 bytes (0) | first 24 bytes                |
//! +-------------+-------------+-------------------------------+
//! ```
//!
//! Nothing is stored server-side; validation recomputes the token for the
//! current bucket and the preceding ones that fall inside the validity window.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::IpAddr;
use thiserror::Error;

use crate::core::{constant_time_eq, generate_secret, now_secs};

type HmacSha256 = Hmac<Sha256>;

/// Token size in bytes.
pub const TOKEN_SIZE: usize = 32;

/// Bucket granularity in seconds.
pub const BUCKET_SECS: i64 = 30;

/// Default validity window in seconds.
pub const DEFAULT_VALIDITY_SECS: u64 = 120;

const MAC_OFFSET: usize = 8;
const MAC_LEN: usize = TOKEN_SIZE - MAC_OFFSET;

/// A 32-byte challenge token.
pub type ChallengeToken = [u8; TOKEN_SIZE];

/// Challenge codec errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The secret was empty.
    #[error("Challenge secret must not be empty")]
    EmptySecret,
    /// The MAC rejected the key material.
    #[error("Invalid challenge secret: {0}")]
    InvalidSecret(String),
}

/// Generates and validates challenge tokens.
#[derive(Clone)]
pub struct ChallengeCodec {
    mac: HmacSha256,
    windows: u32,
}

impl std::fmt::Debug for ChallengeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeCodec")
            .field("windows", &self.windows)
            .finish_non_exhaustive()
    }
}

impl ChallengeCodec {
    /// Codec keyed with `secret` and the default 120s window.
    pub fn new(secret: &[u8]) -> Result<Self, AuthError> {
        Self::with_validity(secret, DEFAULT_VALIDITY_SECS)
    }

    /// Codec keyed with `secret`, accepting tokens up to `validity_secs` old.
    pub fn with_validity(secret: &[u8], validity_secs: u64) -> Result<Self, AuthError> {
        if secret.is_empty() {
            return Err(AuthError::EmptySecret);
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| AuthError::InvalidSecret(e.to_string()))?;
        let windows = validity_secs.div_ceil(BUCKET_SECS as u64).max(1);

        Ok(Self {
            mac,
            windows: u32::try_from(windows).unwrap_or(u32::MAX),
        })
    }

    /// Codec keyed with a fresh random secret.
    pub fn random() -> Result<Self, AuthError> {
        Self::new(&generate_secret())
    }

    /// Number of buckets (current included) a token stays valid for.
    pub fn windows(&self) -> u32 {
        self.windows
    }

    /// Issue a token for `ip` at the current time.
    pub fn generate(&self, ip: IpAddr) -> ChallengeToken {
        self.generate_at(ip, now_secs())
    }

    /// Issue a token for `ip` as of `unix_secs`.
    pub fn generate_at(&self, ip: IpAddr, unix_secs: i64) -> ChallengeToken {
        self.token_for_bucket(ip, bucket_of(unix_secs))
    }

    /// Check `token` against `ip` at the current time.
    pub fn validate(&self, token: &[u8], ip: IpAddr) -> bool {
        self.validate_at(token, ip, now_secs())
    }

    /// Check `token` against `ip` as of `unix_secs`.
    ///
    /// Every candidate bucket is recomputed and compared; the loop does not
    /// exit early on a match.
    pub fn validate_at(&self, token: &[u8], ip: IpAddr, unix_secs: i64) -> bool {
        if token.len() != TOKEN_SIZE {
            return false;
        }

        let current = bucket_of(unix_secs);
        let mut matched = false;
        for age in 0..self.windows {
            let expected = self.token_for_bucket(ip, current.wrapping_sub(age as i32));
            matched |= constant_time_eq(token, &expected);
        }
        matched
    }

    fn token_for_bucket(&self, ip: IpAddr, bucket: i32) -> ChallengeToken {
        let bucket_bytes = bucket.to_be_bytes();

        let mut mac = self.mac.clone();
        mac.update(&bucket_bytes);
        match ip.to_canonical() {
            IpAddr::V4(v4) => mac.update(&v4.octets()),
            IpAddr::V6(v6) => mac.update(&v6.octets()),
        }
        let digest = mac.finalize().into_bytes();

        let mut token = [0u8; TOKEN_SIZE];
        token[..4].copy_from_slice(&bucket_bytes);
        token[MAC_OFFSET..].copy_from_slice(&digest[..MAC_LEN]);
        token
    }
}

#[inline]
fn bucket_of(unix_secs: i64) -> i32 {
    (unix_secs.div_euclid(BUCKET_SECS)) as i32
}
