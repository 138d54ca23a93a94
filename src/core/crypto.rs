//! Cryptographic helpers.

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

/// Size of the per-process challenge secret in bytes.
pub const SECRET_SIZE: usize = 32;

/// Generate a fresh random secret.
///
/// The secret lives only in memory; restarting the process invalidates every
/// outstanding challenge token.
pub fn generate_secret() -> [u8; SECRET_SIZE] {
    let mut secret = [0u8; SECRET_SIZE];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// Compare two byte slices without short-circuiting on the first difference.
///
/// Slices of different length are rejected immediately; the length of a
/// token is not secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// First bytes of a value as hex, for log lines.
pub fn short_hex(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(8)])
}
