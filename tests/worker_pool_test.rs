//! Integration tests for the thread-pool executor and its backend pool
//!
//! These tests validate:
//! - Placement (core, queue, max, rejection policy)
//! - The single rejection error and its backend cause
//! - Synchronous hand-off queues
//! - Graceful and immediate shutdown
//! - Live resizing
//! - Value-returning submission and callbacks

use crossbeam_channel::{bounded, Receiver, Sender};
use prometheus_scheduling::config::{PoolConfig, RejectionPolicy};
use prometheus_scheduling::core::{
    AsyncTaskExecutor, PoolError, Runnable, SchedulerError, TaskExecutor, TaskFailure, ThreadPoolTaskExecutor,
    WorkerPool,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn executor(name: &str, config: PoolConfig) -> ThreadPoolTaskExecutor {
    let executor = ThreadPoolTaskExecutor::new(name, config);
    executor.initialize().unwrap();
    executor
}

/// A task that blocks until the returned sender sends (or is dropped).
fn gate() -> (Sender<()>, Receiver<()>) {
    bounded(0)
}

fn blocking_task(release: &Receiver<()>, started: &Sender<()>) -> Runnable {
    let release = release.clone();
    let started = started.clone();
    Runnable::new(move || {
        let _ = started.send(());
        let _ = release.recv_timeout(Duration::from_secs(10));
        Ok(())
    })
    .named("blocking")
}

fn counting_task(count: &Arc<AtomicUsize>) -> Runnable {
    let count = Arc::clone(count);
    Runnable::new(move || {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .named("counting")
}

// ============================================================================
// PLACEMENT AND REJECTION
// ============================================================================

#[test]
fn test_saturated_pool_rejects_with_single_error() {
    let exec = executor(
        "saturated",
        PoolConfig::new()
            .with_core_pool_size(1)
            .with_max_pool_size(1)
            .with_queue_capacity(Some(1)),
    );
    let (release, wait) = gate();
    let (started_tx, started_rx) = bounded(4);

    exec.execute(blocking_task(&wait, &started_tx)).unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    exec.execute(Runnable::new(|| Ok(())).named("queued")).unwrap();

    let err = exec.execute(Runnable::new(|| Ok(())).named("overflow")).unwrap_err();
    match err {
        SchedulerError::TaskRejected { executor, task, cause } => {
            assert!(executor.contains("saturated"));
            assert_eq!(task, "overflow");
            assert!(matches!(cause, PoolError::QueueFull));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(exec.stats().rejected_tasks, 1);

    drop(release);
    assert!(exec.shutdown_with(true, Duration::from_secs(5)));
}

#[test]
fn test_caller_runs_policy_runs_on_submitter() {
    let exec = executor(
        "caller",
        PoolConfig::new()
            .with_core_pool_size(1)
            .with_max_pool_size(1)
            .with_queue_capacity(Some(1))
            .with_rejection_policy(RejectionPolicy::CallerRuns),
    );
    let (release, wait) = gate();
    let (started_tx, started_rx) = bounded(4);
    exec.execute(blocking_task(&wait, &started_tx)).unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    exec.execute(Runnable::new(|| Ok(()))).unwrap();

    let caller = thread::current().id();
    let (ran_tx, ran_rx) = bounded(1);
    exec.execute(Runnable::once(move || {
        let _ = ran_tx.send(thread::current().id());
        Ok(())
    }))
    .unwrap();
    assert_eq!(ran_rx.try_recv().unwrap(), caller);

    drop(release);
    assert!(exec.shutdown_with(true, Duration::from_secs(5)));
}

#[test]
fn test_discard_policy_drops_silently() {
    let exec = executor(
        "discard",
        PoolConfig::new()
            .with_core_pool_size(1)
            .with_max_pool_size(1)
            .with_queue_capacity(Some(1))
            .with_rejection_policy(RejectionPolicy::Discard),
    );
    let count = Arc::new(AtomicUsize::new(0));
    let (release, wait) = gate();
    let (started_tx, started_rx) = bounded(4);
    exec.execute(blocking_task(&wait, &started_tx)).unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    exec.execute(counting_task(&count)).unwrap();
    exec.execute(counting_task(&count)).unwrap();

    drop(release);
    assert!(exec.shutdown_with(true, Duration::from_secs(5)));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_hand_off_queue_grows_to_max_then_rejects() {
    let exec = executor(
        "handoff",
        PoolConfig::new()
            .with_core_pool_size(1)
            .with_max_pool_size(2)
            .with_queue_capacity(Some(0)),
    );
    let (release, wait) = gate();
    let (started_tx, started_rx) = bounded(4);
    exec.execute(blocking_task(&wait, &started_tx)).unwrap();
    exec.execute(blocking_task(&wait, &started_tx)).unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(exec.pool_size(), 2);
    assert_eq!(exec.queue_size(), 0);

    let err = exec.execute(Runnable::new(|| Ok(()))).unwrap_err();
    assert!(err.is_rejection());

    drop(release);
    assert!(exec.shutdown_with(true, Duration::from_secs(5)));
}

#[test]
fn test_execute_before_initialize_is_not_a_rejection() {
    let exec = ThreadPoolTaskExecutor::new("lazy", PoolConfig::new());
    let err = exec.execute(Runnable::new(|| Ok(()))).unwrap_err();
    assert!(matches!(err, SchedulerError::NotInitialized(_)));
}

// ============================================================================
// SHUTDOWN
// ============================================================================

#[test]
fn test_graceful_shutdown_finishes_queued_work() {
    let exec = executor("graceful", PoolConfig::new().with_core_pool_size(1).with_max_pool_size(1));
    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        exec.execute(counting_task(&count)).unwrap();
    }
    assert!(exec.shutdown_with(true, Duration::from_secs(5)));
    assert_eq!(count.load(Ordering::SeqCst), 20);
}

#[test]
fn test_immediate_shutdown_cancels_queued_futures() {
    let exec = executor("immediate", PoolConfig::new().with_core_pool_size(1).with_max_pool_size(1));
    let (release, wait) = gate();
    let (started_tx, started_rx) = bounded(4);
    exec.execute(blocking_task(&wait, &started_tx)).unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let queued: Vec<_> = (0..3).map(|i| exec.submit(move || Ok(i)).unwrap()).collect();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        drop(release);
    });
    assert!(exec.shutdown_with(false, Duration::from_secs(5)));
    releaser.join().unwrap();

    for future in queued {
        assert!(matches!(future.get(Duration::from_secs(1)), Err(TaskFailure::Cancelled)));
    }
}

#[test]
fn test_bounded_shutdown_returns_within_budget() {
    let exec = executor("bounded", PoolConfig::new().with_core_pool_size(1).with_max_pool_size(1));
    let (started_tx, started_rx) = bounded(1);
    exec.execute(Runnable::once(move || {
        let _ = started_tx.send(());
        thread::sleep(Duration::from_millis(800));
        Ok(())
    }))
    .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let start = Instant::now();
    assert!(!exec.shutdown_with(true, Duration::from_millis(200)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_millis(700));
}

#[test]
fn test_execute_after_shutdown_is_rejected() {
    let exec = executor("closed", PoolConfig::new());
    assert!(exec.shutdown_with(true, Duration::from_secs(1)));
    assert!(exec.execute(Runnable::new(|| Ok(()))).is_err());
}

// ============================================================================
// LIVE CONFIGURATION
// ============================================================================

#[test]
fn test_live_resize_is_validated() {
    let exec = executor("resize", PoolConfig::new().with_core_pool_size(1).with_max_pool_size(4));
    assert!(exec.set_core_pool_size(8).is_err());
    exec.set_max_pool_size(8).unwrap();
    exec.set_core_pool_size(6).unwrap();
    assert_eq!(exec.core_pool_size(), 6);
    assert_eq!(exec.max_pool_size(), 8);
    assert!(exec.set_max_pool_size(2).is_err());
    exec.set_keep_alive(Duration::from_millis(250)).unwrap();
    assert_eq!(exec.keep_alive(), Duration::from_millis(250));
    exec.shutdown();
}

#[test]
fn test_surplus_workers_retire_after_keep_alive() {
    let pool = WorkerPool::new(
        &PoolConfig::new()
            .with_core_pool_size(1)
            .with_max_pool_size(3)
            .with_queue_capacity(Some(0))
            .with_keep_alive(Duration::from_millis(50)),
    )
    .unwrap();
    let (release, wait) = gate();
    let (started_tx, started_rx) = bounded(4);
    for _ in 0..3 {
        pool.execute(blocking_task(&wait, &started_tx)).unwrap();
    }
    for _ in 0..3 {
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    assert_eq!(pool.pool_size(), 3);
    drop(release);

    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.pool_size() > 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(pool.pool_size(), 1);
    assert_eq!(pool.largest_pool_size(), 3);
    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)));
}

// ============================================================================
// FUTURES
// ============================================================================

#[test]
fn test_submit_returns_value_and_failure() {
    let exec = executor("futures", PoolConfig::new().with_core_pool_size(2).with_max_pool_size(2));
    let ok = exec.submit(|| Ok(6 * 7)).unwrap();
    let failed = exec.submit::<u32, _>(|| Err(anyhow::anyhow!("model not loaded"))).unwrap();
    assert_eq!(ok.get(Duration::from_secs(5)).unwrap(), 42);
    match failed.get(Duration::from_secs(5)) {
        Err(TaskFailure::Failed(err)) => assert_eq!(err.to_string(), "model not loaded"),
        other => panic!("expected failure, got {other:?}"),
    }
    exec.shutdown();
}

#[test]
fn test_listenable_callbacks_fire_once() {
    let exec = executor("callbacks", PoolConfig::new());
    let successes = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&successes);
    let future = exec.submit_listenable(|| Ok("done")).unwrap();
    future.add_callback(
        move |_: &&str| {
            seen.fetch_add(1, Ordering::SeqCst);
        },
        |_: &TaskFailure| {},
    );
    assert_eq!(future.get(Duration::from_secs(5)).unwrap(), "done");
    let deadline = Instant::now() + Duration::from_secs(1);
    while successes.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(successes.load(Ordering::SeqCst), 1);
    exec.shutdown();
}
