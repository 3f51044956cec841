//! Core execution abstractions: units of work, futures, backend pools, and executors.

pub mod error;
pub mod error_handler;
pub mod executor;
pub mod future;
pub mod lifecycle;
pub mod simple_executor;
pub mod task;
pub mod worker_pool;

pub use error::{AppResult, SchedulerError};
pub use error_handler::{ErrorHandler, ErrorPolicy, LoggingErrorHandler, PropagatingErrorHandler};
pub use executor::{AsyncTaskExecutor, TaskExecutor, ThreadPoolTaskExecutor};
pub use future::{ListenableFuture, ScheduledFuture, ScheduledHandle, TaskFuture};
pub use lifecycle::{LifecycleState, ManagedPool, PoolLifecycle, ShutdownPolicy};
pub use simple_executor::SimpleAsyncTaskExecutor;
pub use task::{Runnable, TaskDecorator, TaskFailure};
pub use worker_pool::{PoolError, PoolStats, ScheduledExecutor, ScheduledWorkerPool, WorkerPool};
