//! Task executor contracts and the thread-pool-backed executor.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::PoolConfig;

use super::error::{AppResult, SchedulerError};
use super::future::{future_task, ListenableFuture, TaskFuture};
use super::lifecycle::{LifecycleState, PoolLifecycle, ShutdownPolicy};
use super::task::{Runnable, TaskDecorator};
use super::worker_pool::{PoolError, PoolStats, WorkerPool};

/// Fire-and-forget execution of units of work.
///
/// This is the object-safe seam that schedulers, engines and registrars
/// depend on.
///
/// # Example
///
/// ```rust,ignore
/// use prometheus_scheduling::core::{Runnable, TaskExecutor};
///
/// fn kick_off(executor: &dyn TaskExecutor) -> Result<(), SchedulerError> {
///     executor.execute(Runnable::new(|| Ok(())).named("warm-cache"))
/// }
/// ```
pub trait TaskExecutor: Send + Sync {
    /// Run `task` at some point in the future.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::TaskRejected` if the backend refuses the task,
    /// or `SchedulerError::NotInitialized` if the executor is not running.
    fn execute(&self, task: Runnable) -> Result<(), SchedulerError>;
}

/// Submission of value-returning work, available on every [`TaskExecutor`].
pub trait AsyncTaskExecutor: TaskExecutor {
    /// Submit work and get a future for its result.
    ///
    /// # Errors
    ///
    /// Same as [`TaskExecutor::execute`]; the returned future is only created
    /// for accepted work.
    fn submit<T, F>(&self, task: F) -> Result<TaskFuture<T>, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce() -> AppResult<T> + Send + 'static,
    {
        let (future, completer) = TaskFuture::new();
        self.execute(future_task(task, completer))?;
        Ok(future)
    }

    /// Submit work and get a future that accepts completion callbacks.
    ///
    /// # Errors
    ///
    /// Same as [`TaskExecutor::execute`].
    fn submit_listenable<T, F>(&self, task: F) -> Result<ListenableFuture<T>, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce() -> AppResult<T> + Send + 'static,
    {
        self.submit(task).map(ListenableFuture::from)
    }
}

impl<E: TaskExecutor + ?Sized> AsyncTaskExecutor for E {}

/// Executor backed by a managed [`WorkerPool`].
///
/// Core size, max size, keep-alive and core timeout may be changed while the
/// pool is live; each getter/setter pair is atomic under one monitor.
pub struct ThreadPoolTaskExecutor {
    lifecycle: PoolLifecycle<WorkerPool>,
    config: Mutex<PoolConfig>,
    decorator: Option<Arc<dyn TaskDecorator>>,
}

impl fmt::Debug for ThreadPoolTaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolTaskExecutor")
            .field("name", &self.lifecycle.name())
            .field("state", &self.lifecycle.state())
            .field("decorated", &self.decorator.is_some())
            .finish()
    }
}

impl ThreadPoolTaskExecutor {
    /// Create an executor called `name`; call [`Self::initialize`] before use.
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        let lifecycle = PoolLifecycle::new(name);
        lifecycle.set_shutdown_policy(ShutdownPolicy {
            wait_for_tasks_to_complete: config.wait_for_tasks_to_complete_on_shutdown,
            await_termination: config.await_termination(),
        });
        Self {
            lifecycle,
            config: Mutex::new(config),
            decorator: None,
        }
    }

    /// Wrap every submitted task with `decorator`.
    #[must_use]
    pub fn with_task_decorator(mut self, decorator: Arc<dyn TaskDecorator>) -> Self {
        self.decorator = Some(decorator);
        self
    }

    /// Create the backing pool.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::AlreadyInitialized` on a second call or after shutdown
    /// - `SchedulerError::InvalidConfig` if the configuration is invalid
    pub fn initialize(&self) -> Result<(), SchedulerError> {
        let config = self.config.lock();
        let prefix = self
            .lifecycle
            .thread_name_prefix(config.thread_name_prefix.as_deref());
        let pool_config = config.clone().with_thread_name_prefix(prefix);
        self.lifecycle.initialize(|| WorkerPool::new(&pool_config))?;
        Ok(())
    }

    /// Executor name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.lifecycle.name()
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// The live backing pool.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NotInitialized` when not running.
    pub fn pool(&self) -> Result<Arc<WorkerPool>, SchedulerError> {
        self.lifecycle.pool()
    }

    fn apply<F>(&self, update: impl FnOnce(&mut PoolConfig), live: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(&WorkerPool) -> Result<(), PoolError>,
    {
        let mut config = self.config.lock();
        let mut candidate = config.clone();
        update(&mut candidate);
        candidate.validate().map_err(SchedulerError::InvalidArgument)?;
        if let Some(pool) = self.lifecycle.try_pool() {
            live(&pool).map_err(|err| SchedulerError::InvalidArgument(err.to_string()))?;
        }
        *config = candidate;
        Ok(())
    }

    /// Core pool size.
    #[must_use]
    pub fn core_pool_size(&self) -> usize {
        self.config.lock().core_pool_size
    }

    /// Change the core pool size, live if the pool is running.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidArgument` if the size exceeds the max size.
    pub fn set_core_pool_size(&self, size: usize) -> Result<(), SchedulerError> {
        self.apply(|c| c.core_pool_size = size, |p| p.set_core_pool_size(size))
    }

    /// Maximum pool size.
    #[must_use]
    pub fn max_pool_size(&self) -> usize {
        self.config.lock().max_pool_size
    }

    /// Change the maximum pool size, live if the pool is running.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidArgument` for zero or a size below the core size.
    pub fn set_max_pool_size(&self, size: usize) -> Result<(), SchedulerError> {
        self.apply(|c| c.max_pool_size = size, |p| p.set_max_pool_size(size))
    }

    /// Keep-alive for surplus threads.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        self.config.lock().keep_alive()
    }

    /// Change the keep-alive, live if the pool is running.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidArgument` for a zero keep-alive with core timeout.
    pub fn set_keep_alive(&self, keep_alive: Duration) -> Result<(), SchedulerError> {
        self.apply(
            |c| *c = c.clone().with_keep_alive(keep_alive),
            |p| p.set_keep_alive(keep_alive),
        )
    }

    /// Allow core threads to time out, live if the pool is running.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidArgument` when enabling with a zero keep-alive.
    pub fn set_allow_core_thread_timeout(&self, allow: bool) -> Result<(), SchedulerError> {
        self.apply(
            |c| c.allow_core_thread_timeout = allow,
            |p| p.set_allow_core_thread_timeout(allow),
        )
    }

    /// Live threads; zero before initialization.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.lifecycle.try_pool().map_or(0, |p| p.pool_size())
    }

    /// Threads running a task; zero before initialization.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lifecycle.try_pool().map_or(0, |p| p.active_count())
    }

    /// Queued tasks; zero before initialization.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.lifecycle.try_pool().map_or(0, |p| p.queue_size())
    }

    /// Pool statistics; all zero before initialization.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.lifecycle.try_pool().map(|p| p.stats()).unwrap_or_default()
    }

    /// Identity used in rejection errors and logs.
    #[must_use]
    pub fn describe(&self) -> String {
        let stats = self.stats();
        format!(
            "ThreadPoolTaskExecutor[{}] (pool size = {}, active = {}, queued = {}, completed = {})",
            self.lifecycle.name(),
            stats.pool_size,
            stats.active_count,
            stats.queue_size,
            stats.completed_tasks
        )
    }

    /// Shut down with the configured policy; `true` if terminated in time.
    pub fn shutdown(&self) -> bool {
        self.lifecycle.shutdown()
    }

    /// Shut down with an explicit policy; `true` if terminated in time.
    pub fn shutdown_with(&self, wait_for_tasks: bool, await_termination: Duration) -> bool {
        self.lifecycle.shutdown_with(wait_for_tasks, await_termination)
    }
}

impl TaskExecutor for ThreadPoolTaskExecutor {
    fn execute(&self, task: Runnable) -> Result<(), SchedulerError> {
        let pool = self.lifecycle.pool()?;
        let task = match &self.decorator {
            Some(decorator) => decorator.decorate(task),
            None => task,
        };
        let description = task.description().to_owned();
        pool.execute(task).map_err(|cause| {
            debug!(executor = %self.lifecycle.name(), task = %description, error = %cause, "Task rejected");
            SchedulerError::rejected(self.describe(), description, cause)
        })
    }
}
