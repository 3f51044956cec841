//! Backend thread pools.
//!
//! `WorkerPool` is a core/max/keep-alive pool of dedicated OS threads fed by a
//! crossbeam channel. `ScheduledWorkerPool` fronts one with a timer thread
//! and a delay queue for one-shot, fixed-rate and fixed-delay work.
//!
//! Idle workers block on the channel rather than polling. A panicking task is
//! caught on its worker, counted as failed, and never takes the thread down.
//!
//! # Example
//!
//! ```rust,ignore
//! use prometheus_scheduling::config::PoolConfig;
//! use prometheus_scheduling::core::{Runnable, WorkerPool};
//!
//! let pool = WorkerPool::new(&PoolConfig::new().with_core_pool_size(4).with_max_pool_size(8))?;
//! pool.execute(Runnable::new(|| Ok(())))?;
//! pool.shutdown();
//! pool.await_termination(Duration::from_secs(5));
//! ```

mod native;
mod scheduled;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;

pub use native::WorkerPool;
pub use scheduled::{ScheduledExecutor, ScheduledWorkerPool};

/// Refusals and failures of a backend pool.
///
/// Facades translate these into `SchedulerError::TaskRejected`.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No thread or queue slot was free and the policy is abort.
    #[error("pool is saturated: no free thread and the queue is full")]
    QueueFull,

    /// The pool no longer accepts work.
    #[error("pool has been shut down")]
    PoolShutdown,

    /// The pool could not be built from its configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A live parameter change or scheduling argument was refused.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A worker or timer thread could not be started or is gone.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live worker threads.
    pub pool_size: usize,

    /// Threads currently running a task.
    pub active_count: usize,

    /// Tasks waiting in the queue.
    pub queue_size: usize,

    /// Highest number of threads ever alive at once.
    pub largest_pool_size: usize,

    /// Tasks that finished running (successfully or not).
    pub completed_tasks: u64,

    /// Tasks that returned an error or panicked.
    pub failed_tasks: u64,

    /// Tasks handed to `execute`.
    pub submitted_tasks: u64,

    /// Tasks refused or discarded by the rejection policy.
    pub rejected_tasks: u64,
}

/// Live counters behind [`PoolStats`].
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub active_tasks: AtomicUsize,
    pub completed_tasks: AtomicU64,
    pub failed_tasks: AtomicU64,
    pub submitted_tasks: AtomicU64,
    pub rejected_tasks: AtomicU64,
}

impl PoolCounters {
    /// Point-in-time statistics.
    pub fn snapshot(&self, pool_size: usize, queue_size: usize, largest_pool_size: usize) -> PoolStats {
        PoolStats {
            pool_size,
            active_count: self.active_tasks.load(Ordering::Relaxed),
            queue_size,
            largest_pool_size,
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            submitted_tasks: self.submitted_tasks.load(Ordering::Relaxed),
            rejected_tasks: self.rejected_tasks.load(Ordering::Relaxed),
        }
    }
}
