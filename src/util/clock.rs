//! Wall-clock helpers shared by triggers, schedulers and job stores.
//!
//! Triggers and persistent definitions speak in UTC wall-clock instants
//! (`DateTime<Utc>`), while the pools themselves wait on monotonic
//! `Duration`s. The conversions between the two live here so every caller
//! clamps and saturates the same way.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Current wall-clock instant.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Delay from now until `at`.
///
/// Instants in the past yield `Duration::ZERO`, so a start time that has
/// already passed means "run immediately".
#[must_use]
pub fn delay_until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Add a std `Duration` to a wall-clock instant, saturating on overflow.
#[must_use]
pub fn add_duration(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Convert epoch milliseconds (as stored by the SQLite job store) to an instant.
#[must_use]
pub fn from_epoch_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Convert an instant to epoch milliseconds.
#[must_use]
pub fn to_epoch_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_until_past_is_zero() {
        let past = Utc::now() - chrono::Duration::seconds(5);
        assert_eq!(delay_until(past), Duration::ZERO);
    }

    #[test]
    fn test_delay_until_future() {
        let future = Utc::now() + chrono::Duration::seconds(10);
        let delay = delay_until(future);
        assert!(delay > Duration::from_secs(9));
        assert!(delay <= Duration::from_secs(10));
    }

    #[test]
    fn test_add_duration_saturates() {
        let far = DateTime::<Utc>::MAX_UTC - chrono::Duration::seconds(1);
        assert_eq!(add_duration(far, Duration::from_secs(3600)), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_epoch_ms_roundtrip() {
        let at = from_epoch_ms(1_700_000_000_123).unwrap();
        assert_eq!(to_epoch_ms(at), 1_700_000_000_123);
    }
}
