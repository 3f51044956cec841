//! Scheduler facade contract and the pool-backed scheduler.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::SchedulerPoolConfig;
use crate::core::error::SchedulerError;
use crate::core::error_handler::{with_error_handling, ErrorHandler};
use crate::core::executor::TaskExecutor;
use crate::core::future::ScheduledHandle;
use crate::core::lifecycle::{LifecycleState, PoolLifecycle, ShutdownPolicy};
use crate::core::task::Runnable;
use crate::core::worker_pool::{PoolError, PoolStats, ScheduledExecutor, ScheduledWorkerPool};
use crate::util::clock;

use super::rescheduling::{NextRun, ReschedulingRunnable};
use super::trigger::Trigger;

/// One contract for one-shot, periodic and trigger-driven scheduling.
///
/// Capacity failures surface as `SchedulerError::TaskRejected`. Start times
/// in the past mean "run now".
pub trait TaskScheduler: Send + Sync {
    /// Schedule `task` under `trigger`.
    ///
    /// Returns `Ok(None)` if the trigger has no first execution time.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::TaskRejected` if the first execution is refused.
    fn schedule(&self, task: Runnable, trigger: Arc<dyn Trigger>) -> Result<Option<ScheduledHandle>, SchedulerError>;

    /// Run `task` once at `start_time`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::TaskRejected` if the task is refused.
    fn schedule_at(&self, task: Runnable, start_time: DateTime<Utc>) -> Result<ScheduledHandle, SchedulerError>;

    /// Run `task` now and then every `period`, measured from scheduled starts.
    ///
    /// # Errors
    ///
    /// `SchedulerError::InvalidArgument` for a zero period, otherwise as [`Self::schedule_at`].
    fn schedule_at_fixed_rate(&self, task: Runnable, period: Duration) -> Result<ScheduledHandle, SchedulerError>;

    /// Run `task` at `start_time` and then every `period`, measured from scheduled starts.
    ///
    /// # Errors
    ///
    /// `SchedulerError::InvalidArgument` for a zero period, otherwise as [`Self::schedule_at`].
    fn schedule_at_fixed_rate_from(
        &self,
        task: Runnable,
        start_time: DateTime<Utc>,
        period: Duration,
    ) -> Result<ScheduledHandle, SchedulerError>;

    /// Run `task` now and then `delay` after each completion.
    ///
    /// # Errors
    ///
    /// `SchedulerError::InvalidArgument` for a zero delay, otherwise as [`Self::schedule_at`].
    fn schedule_with_fixed_delay(&self, task: Runnable, delay: Duration) -> Result<ScheduledHandle, SchedulerError>;

    /// Run `task` at `start_time` and then `delay` after each completion.
    ///
    /// # Errors
    ///
    /// `SchedulerError::InvalidArgument` for a zero delay, otherwise as [`Self::schedule_at`].
    fn schedule_with_fixed_delay_from(
        &self,
        task: Runnable,
        start_time: DateTime<Utc>,
        delay: Duration,
    ) -> Result<ScheduledHandle, SchedulerError>;
}

/// Translate a backend error; argument errors stay argument errors.
pub(crate) fn translate(describe: &str, task: &str, cause: PoolError) -> SchedulerError {
    match cause {
        PoolError::InvalidArgument(msg) => SchedulerError::InvalidArgument(msg),
        cause => {
            debug!(executor = %describe, task = %task, error = %cause, "Scheduled task rejected");
            SchedulerError::rejected(describe, task, cause)
        }
    }
}

/// Scheduling operations shared by the facades, over one standard backend.
pub(crate) struct Scheduling<'a, E: ScheduledExecutor + ?Sized> {
    pub(crate) backend: &'a E,
    pub(crate) error_handler: Option<&'a Arc<dyn ErrorHandler>>,
}

impl<E: ScheduledExecutor + ?Sized> Scheduling<'_, E> {
    pub(crate) fn execute(&self, task: Runnable) -> Result<(), SchedulerError> {
        let task = with_error_handling(task, self.error_handler, false);
        let description = task.description().to_owned();
        self.backend
            .execute(task)
            .map_err(|cause| translate(&self.backend.describe(), &description, cause))
    }

    pub(crate) fn once(&self, task: Runnable, start_time: DateTime<Utc>) -> Result<ScheduledHandle, SchedulerError> {
        let task = with_error_handling(task, self.error_handler, false);
        let description = task.description().to_owned();
        self.backend
            .schedule(task, clock::delay_until(start_time))
            .map_err(|cause| translate(&self.backend.describe(), &description, cause))
    }

    pub(crate) fn periodic(
        &self,
        task: Runnable,
        start_time: Option<DateTime<Utc>>,
        period: Duration,
        fixed_rate: bool,
    ) -> Result<ScheduledHandle, SchedulerError> {
        let task = with_error_handling(task, self.error_handler, true);
        let description = task.description().to_owned();
        let initial_delay = start_time.map_or(Duration::ZERO, clock::delay_until);
        let scheduled = if fixed_rate {
            self.backend.schedule_at_fixed_rate(task, initial_delay, period)
        } else {
            self.backend.schedule_with_fixed_delay(task, initial_delay, period)
        };
        scheduled.map_err(|cause| translate(&self.backend.describe(), &description, cause))
    }
}

/// Trigger scheduling through a self-rescheduling chain on `backend`.
pub(crate) fn schedule_rescheduling(
    backend: &Arc<dyn ScheduledExecutor>,
    task: Runnable,
    trigger: Arc<dyn Trigger>,
    error_handler: Option<&Arc<dyn ErrorHandler>>,
) -> Result<Option<ScheduledHandle>, SchedulerError> {
    let task = with_error_handling(task, error_handler, true);
    let description = task.description().to_owned();
    ReschedulingRunnable::new(task, NextRun::Trigger(trigger), backend)
        .start()
        .map_err(|cause| translate(&backend.describe(), &description, cause))
}

/// Scheduler backed by its own [`ScheduledWorkerPool`].
///
/// Trigger scheduling uses self-rescheduling chains on the pool. The pool
/// size and the remove-on-cancel policy may change while the pool is live.
pub struct ThreadPoolTaskScheduler {
    lifecycle: PoolLifecycle<ScheduledWorkerPool>,
    config: Mutex<SchedulerPoolConfig>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl fmt::Debug for ThreadPoolTaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolTaskScheduler")
            .field("name", &self.lifecycle.name())
            .field("state", &self.lifecycle.state())
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl ThreadPoolTaskScheduler {
    /// Create a scheduler called `name`; call [`Self::initialize`] before use.
    pub fn new(name: impl Into<String>, config: SchedulerPoolConfig) -> Self {
        let lifecycle = PoolLifecycle::new(name);
        lifecycle.set_shutdown_policy(ShutdownPolicy {
            wait_for_tasks_to_complete: config.wait_for_tasks_to_complete_on_shutdown,
            await_termination: config.await_termination(),
        });
        Self {
            lifecycle,
            config: Mutex::new(config),
            error_handler: None,
        }
    }

    /// Use `handler` for every task without its own error handler.
    #[must_use]
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Create the backing pool and start its timer.
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
        self.lifecycle.initialize(|| ScheduledWorkerPool::new(&pool_config))?;
        Ok(())
    }

    /// Scheduler name.
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
    pub fn pool(&self) -> Result<Arc<ScheduledWorkerPool>, SchedulerError> {
        self.lifecycle.pool()
    }

    fn backend(&self) -> Result<Arc<dyn ScheduledExecutor>, SchedulerError> {
        Ok(self.lifecycle.pool()? as Arc<dyn ScheduledExecutor>)
    }

    /// Configured worker count.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.config.lock().pool_size
    }

    /// Change the worker count, live if the pool is running.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidArgument` for a zero size.
    pub fn set_pool_size(&self, size: usize) -> Result<(), SchedulerError> {
        let mut config = self.config.lock();
        if size == 0 {
            return Err(SchedulerError::InvalidArgument("pool_size must be greater than 0".into()));
        }
        if let Some(pool) = self.lifecycle.try_pool() {
            pool.set_pool_size(size)
                .map_err(|err| SchedulerError::InvalidArgument(err.to_string()))?;
        }
        config.pool_size = size;
        Ok(())
    }

    /// Change the remove-on-cancel policy, live if the pool is running.
    pub fn set_remove_on_cancel(&self, remove: bool) {
        let mut config = self.config.lock();
        if let Some(pool) = self.lifecycle.try_pool() {
            pool.set_remove_on_cancel(remove);
        }
        config.remove_on_cancel = remove;
    }

    /// Threads running a task; zero before initialization.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lifecycle.try_pool().map_or(0, |p| p.active_count())
    }

    /// Tasks waiting for their due time; zero before initialization.
    #[must_use]
    pub fn scheduled_task_count(&self) -> usize {
        self.lifecycle.try_pool().map_or(0, |p| p.scheduled_task_count())
    }

    /// Worker statistics; all zero before initialization.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.lifecycle.try_pool().map(|p| p.stats()).unwrap_or_default()
    }

    /// Shut down with the configured policy; `true` if terminated in time.
    pub fn shutdown(&self) -> bool {
        self.lifecycle.shutdown()
    }

    /// Shut down with an explicit policy; `true` if terminated in time.
    pub fn shutdown_with(&self, wait_for_tasks: bool, await_termination: Duration) -> bool {
        self.lifecycle.shutdown_with(wait_for_tasks, await_termination)
    }

    fn ops<'a>(&'a self, backend: &'a Arc<dyn ScheduledExecutor>) -> Scheduling<'a, dyn ScheduledExecutor> {
        Scheduling {
            backend: backend.as_ref(),
            error_handler: self.error_handler.as_ref(),
        }
    }
}

impl TaskExecutor for ThreadPoolTaskScheduler {
    fn execute(&self, task: Runnable) -> Result<(), SchedulerError> {
        let backend = self.backend()?;
        self.ops(&backend).execute(task)
    }
}

impl TaskScheduler for ThreadPoolTaskScheduler {
    fn schedule(&self, task: Runnable, trigger: Arc<dyn Trigger>) -> Result<Option<ScheduledHandle>, SchedulerError> {
        let backend = self.backend()?;
        schedule_rescheduling(&backend, task, trigger, self.error_handler.as_ref())
    }

    fn schedule_at(&self, task: Runnable, start_time: DateTime<Utc>) -> Result<ScheduledHandle, SchedulerError> {
        let backend = self.backend()?;
        self.ops(&backend).once(task, start_time)
    }

    fn schedule_at_fixed_rate(&self, task: Runnable, period: Duration) -> Result<ScheduledHandle, SchedulerError> {
        let backend = self.backend()?;
        self.ops(&backend).periodic(task, None, period, true)
    }

    fn schedule_at_fixed_rate_from(
        &self,
        task: Runnable,
        start_time: DateTime<Utc>,
        period: Duration,
    ) -> Result<ScheduledHandle, SchedulerError> {
        let backend = self.backend()?;
        self.ops(&backend).periodic(task, Some(start_time), period, true)
    }

    fn schedule_with_fixed_delay(&self, task: Runnable, delay: Duration) -> Result<ScheduledHandle, SchedulerError> {
        let backend = self.backend()?;
        self.ops(&backend).periodic(task, None, delay, false)
    }

    fn schedule_with_fixed_delay_from(
        &self,
        task: Runnable,
        start_time: DateTime<Utc>,
        delay: Duration,
    ) -> Result<ScheduledHandle, SchedulerError> {
        let backend = self.backend()?;
        self.ops(&backend).periodic(task, Some(start_time), delay, false)
    }
}
