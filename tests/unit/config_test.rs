//! Tests for configuration validation

use prometheus_scheduling::config::{ExecutorsConfig, PoolConfig, RejectionPolicy, SchedulerPoolConfig};
use std::time::Duration;

#[test]
fn test_pool_config_defaults() {
    let cfg = PoolConfig::default();
    assert_eq!(cfg.core_pool_size, 1);
    assert_eq!(cfg.max_pool_size, usize::MAX);
    assert_eq!(cfg.queue_capacity, None);
    assert_eq!(cfg.rejection_policy, RejectionPolicy::Abort);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_pool_config_invalid_max_pool_size() {
    let cfg = PoolConfig::new().with_core_pool_size(0).with_max_pool_size(0);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_core_timeout_needs_keep_alive() {
    let cfg = PoolConfig::new()
        .with_allow_core_thread_timeout(true)
        .with_keep_alive(Duration::ZERO);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_await_termination_round_trips_through_millis() {
    let cfg = PoolConfig::new().with_await_termination(Duration::from_millis(1500));
    assert_eq!(cfg.await_termination_ms, 1500);
    assert_eq!(cfg.await_termination(), Duration::from_millis(1500));
}

#[test]
fn test_scheduler_pool_config_rejects_zero_threads() {
    assert!(SchedulerPoolConfig::new().with_pool_size(0).validate().is_err());
    assert!(SchedulerPoolConfig::new().with_pool_size(3).validate().is_ok());
}

#[test]
fn test_executors_config_from_json() {
    let cfg = ExecutorsConfig::from_json_str(
        r#"{
            "executors": {
                "inference": {"core_pool_size": 2, "max_pool_size": 4, "queue_capacity": 0,
                              "rejection_policy": "caller_runs"}
            },
            "schedulers": {
                "timers": {"pool_size": 2, "remove_on_cancel": true}
            }
        }"#,
    )
    .unwrap();
    let inference = &cfg.executors["inference"];
    assert_eq!(inference.queue_capacity, Some(0));
    assert_eq!(inference.rejection_policy, RejectionPolicy::CallerRuns);
    assert!(cfg.schedulers["timers"].remove_on_cancel);
}

#[test]
fn test_executors_config_requires_an_entry() {
    let err = ExecutorsConfig::from_json_str("{}").unwrap_err();
    assert!(err.contains("at least one"));
}

#[test]
fn test_executors_config_names_invalid_entry() {
    let err = ExecutorsConfig::from_json_str(r#"{"schedulers": {"timers": {"pool_size": 0}}}"#).unwrap_err();
    assert!(err.contains("scheduler `timers`"));
}
