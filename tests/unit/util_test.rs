//! Tests for utility functions

use chrono::{Duration as ChronoDuration, Utc};
use prometheus_scheduling::util::{add_duration, delay_until, from_epoch_ms, init_tracing, init_tracing_with, to_epoch_ms};
use std::time::Duration;

#[test]
fn test_delay_until_past_is_zero() {
    let past = Utc::now() - ChronoDuration::seconds(5);
    assert_eq!(delay_until(past), Duration::ZERO);
}

#[test]
fn test_delay_until_future_is_bounded() {
    let future = Utc::now() + ChronoDuration::seconds(2);
    let delay = delay_until(future);
    assert!(delay > Duration::from_millis(1500));
    assert!(delay <= Duration::from_secs(2));
}

#[test]
fn test_add_duration_saturates() {
    let now = Utc::now();
    assert_eq!(add_duration(now, Duration::from_secs(1)), now + ChronoDuration::seconds(1));
    assert!(add_duration(now, Duration::MAX) > now);
}

#[test]
fn test_epoch_millis_round_trip() {
    let at = from_epoch_ms(1_700_000_000_123).unwrap();
    assert_eq!(to_epoch_ms(at), 1_700_000_000_123);
}

#[test]
fn test_init_tracing_twice_is_harmless() {
    init_tracing();
    init_tracing();
}

#[test]
fn test_init_tracing_with_custom_fallback() {
    init_tracing_with("prometheus_scheduling=debug,rusqlite=warn");
    init_tracing();
}
