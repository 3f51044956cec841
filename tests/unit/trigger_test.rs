//! Tests for trigger evaluation

use chrono::{TimeZone, Utc};
use prometheus_scheduling::scheduling::{CronTrigger, PeriodicTrigger, Trigger, TriggerContext, TriggerError};
use std::time::Duration;

#[test]
fn test_cron_in_zone_reports_utc() {
    let trigger = CronTrigger::with_zone("0 0 9 * * *", "Europe/Paris").unwrap();
    // 2024-01-15 is winter time, Paris is UTC+1.
    let after = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
    assert_eq!(
        trigger.next_after(after),
        Some(Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap())
    );
}

#[test]
fn test_cron_never_fires_again() {
    let trigger = CronTrigger::new("0 0 0 1 1 * 2000").unwrap();
    assert_eq!(trigger.next_execution_time(&TriggerContext::default()), None);
}

#[test]
fn test_cron_reference_is_later_of_scheduled_and_completed() {
    let trigger = CronTrigger::new("0 */5 * * * *").unwrap();
    let scheduled = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let completed = Utc.with_ymd_and_hms(2024, 3, 1, 12, 7, 0).unwrap();
    let context = TriggerContext::new(Some(scheduled), Some(scheduled), Some(completed));
    assert_eq!(
        trigger.next_execution_time(&context),
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 10, 0).unwrap())
    );
}

#[test]
fn test_periodic_rejects_zero_period() {
    assert_eq!(PeriodicTrigger::new(Duration::ZERO).unwrap_err(), TriggerError::InvalidPeriod);
}

#[test]
fn test_periodic_fixed_delay_counts_from_completion() {
    let trigger = PeriodicTrigger::new(Duration::from_secs(10)).unwrap();
    let scheduled = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let completed = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 4).unwrap();
    let context = TriggerContext::new(Some(scheduled), Some(scheduled), Some(completed));
    assert_eq!(
        trigger.next_execution_time(&context),
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 14).unwrap())
    );
}

#[test]
fn test_periodic_fixed_rate_counts_from_schedule() {
    let trigger = PeriodicTrigger::new(Duration::from_secs(10)).unwrap().with_fixed_rate(true);
    let scheduled = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let completed = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 4).unwrap();
    let context = TriggerContext::new(Some(scheduled), Some(scheduled), Some(completed));
    assert_eq!(
        trigger.next_execution_time(&context),
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 10).unwrap())
    );
}
