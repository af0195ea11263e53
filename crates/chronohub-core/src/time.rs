//! Clock helpers.
//!
//! All storage decisions work on millisecond-truncated UTC instants, so every "now" in the
//! engine goes through [`now`].

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Current time truncated to millisecond resolution.
pub fn now() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

pub fn truncate_millis(time: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(time.timestamp_millis()).unwrap_or(time)
}

pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Upper bound for stable reads: data newer than this may still be arriving.
pub fn stable(now: DateTime<Utc>, stable_seconds: u64) -> DateTime<Utc> {
    now - Duration::seconds(stable_seconds as i64)
}

/// Earliest instant any key can carry.
pub fn earliest() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(0).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_drops_sub_millis() {
        let t = Utc.timestamp_nanos(1_700_000_000_123_456_789);
        assert_eq!(truncate_millis(t).timestamp_millis(), 1_700_000_000_123);
        assert_eq!(truncate_millis(t).timestamp_subsec_nanos(), 123_000_000);
    }

    #[test]
    fn test_stable_lags_now() {
        let t = now();
        assert_eq!(t - stable(t, 5), Duration::seconds(5));
    }
}
