//! Wall-clock time.
//!
//! Heartbeats and join times are stored as Unix milliseconds so records written
//! by different processes compare directly.

use chrono::Utc;

/// Current Unix time in milliseconds.
#[inline]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current Unix time in whole seconds.
#[inline]
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Milliseconds elapsed since `then`, saturating at zero for clock skew.
#[inline]
pub fn age_millis(then: i64, now: i64) -> i64 {
    now.saturating_sub(then).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_and_secs_agree() {
        let secs = now_secs();
        let millis = now_millis();
        assert!((millis / 1000 - secs).abs() <= 1);
    }

    #[test]
    fn test_age_never_negative() {
        assert_eq!(age_millis(2_000, 1_000), 0);
        assert_eq!(age_millis(1_000, 2_500), 1_500);
    }
}
