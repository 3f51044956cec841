//! Tests for builder modules

use prometheus_scheduling::builders::{build_executors, PoolBuilder};
use prometheus_scheduling::config::{ExecutorsConfig, PoolConfig, SchedulerPoolConfig};
use prometheus_scheduling::core::{AsyncTaskExecutor, LifecycleState, SchedulerError};
use std::time::Duration;

fn config() -> ExecutorsConfig {
    let mut cfg = ExecutorsConfig::default();
    cfg.executors
        .insert("inference".into(), PoolConfig::new().with_core_pool_size(2).with_max_pool_size(2));
    cfg.schedulers
        .insert("timers".into(), SchedulerPoolConfig::new().with_pool_size(1));
    cfg
}

#[test]
fn test_build_initialises_named_components() {
    let pools = PoolBuilder::new(config()).build().unwrap();
    let executor = pools.executor("inference").unwrap();
    assert_eq!(executor.name(), "inference");
    assert_eq!(executor.state(), LifecycleState::Running);
    let scheduler = pools.scheduler("timers").unwrap();
    assert_eq!(scheduler.state(), LifecycleState::Running);
    assert!(pools.executor("missing").is_none());
    assert!(pools.shutdown_all());
}

#[test]
fn test_component_name_is_thread_prefix() {
    let executors = build_executors(&config()).unwrap();
    let executor = &executors["inference"];
    let name = executor
        .submit(|| Ok(std::thread::current().name().map(str::to_owned)))
        .unwrap()
        .get(Duration::from_secs(5))
        .unwrap();
    assert!(name.unwrap().starts_with("inference"));
    executor.shutdown();
}

#[test]
fn test_invalid_config_is_reported() {
    let mut cfg = config();
    cfg.executors
        .insert("broken".into(), PoolConfig::new().with_core_pool_size(4).with_max_pool_size(1));
    let err = PoolBuilder::new(cfg).build().unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidConfig(_)));
}

#[test]
fn test_builder_from_json() {
    let builder = PoolBuilder::from_json_str(r#"{"executors": {"io": {"core_pool_size": 1}}}"#).unwrap();
    assert_eq!(builder.config().executors.len(), 1);
    assert!(PoolBuilder::from_json_str("not json").is_err());
}
