//! Tests for error types

use prometheus_scheduling::core::{PoolError, SchedulerError, TaskFailure};
use prometheus_scheduling::jobs::{EngineError, RegistrationError};
use prometheus_scheduling::scheduling::TriggerError;
use std::error::Error;

#[test]
fn test_task_rejected_display_names_executor_and_task() {
    let err = SchedulerError::rejected("ThreadPoolTaskExecutor[reports]", "nightly-report", PoolError::QueueFull);
    assert_eq!(
        err.to_string(),
        "executor [ThreadPoolTaskExecutor[reports]] did not accept task: nightly-report"
    );
    assert!(err.is_rejection());
}

#[test]
fn test_task_rejected_keeps_backend_cause() {
    let err = SchedulerError::rejected("exec", "task", PoolError::PoolShutdown);
    let cause = err.source().unwrap();
    assert_eq!(cause.to_string(), "pool has been shut down");
}

#[test]
fn test_not_initialized_is_not_a_rejection() {
    let err = SchedulerError::NotInitialized("reports".into());
    assert!(!err.is_rejection());
    assert_eq!(err.to_string(), "`reports` has not been initialized");
}

#[test]
fn test_task_failure_display() {
    assert_eq!(TaskFailure::Cancelled.to_string(), "task was cancelled");
    assert_eq!(TaskFailure::Panicked("boom".into()).to_string(), "task panicked: boom");
}

#[test]
fn test_invalid_cron_display() {
    let err = TriggerError::InvalidCron {
        expression: "* *".into(),
        reason: "too short".into(),
    };
    assert_eq!(err.to_string(), "invalid cron expression `* *`: too short");
}

#[test]
fn test_already_exists_is_recognised() {
    let err = EngineError::already_exists("trigger", "DEFAULT.nightly");
    assert!(err.is_already_exists());
    assert!(!EngineError::JobNotFound("DEFAULT.nightly".into()).is_already_exists());
}

#[test]
fn test_registration_failure_keeps_cause() {
    let err = RegistrationError::Failed(EngineError::JobNotFound("DEFAULT.report".into()));
    assert!(err.source().is_some());
}
