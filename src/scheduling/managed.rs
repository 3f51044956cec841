//! Trigger-aware ("managed") backend.
//!
//! A trigger-aware backend accepts its own trigger callback and keeps the
//! last-execution record itself. That record is the only history the trigger
//! sees, so racing reschedules cannot disagree about what happened last.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerPoolConfig;
use crate::core::future::ScheduledHandle;
use crate::core::task::Runnable;
use crate::core::worker_pool::{PoolError, ScheduledExecutor, ScheduledWorkerPool};

use super::rescheduling::{NextRun, ReschedulingRunnable};
use super::trigger::{Trigger, TriggerContext};

/// Backend record of one finished execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastExecution {
    /// Description of the task that ran.
    pub identity_name: String,
    /// When the run was planned to start.
    pub scheduled_start: DateTime<Utc>,
    /// When the run started.
    pub run_start: DateTime<Utc>,
    /// When the run ended.
    pub run_end: DateTime<Utc>,
}

impl LastExecution {
    /// Record for the execution described by `context`; `None` before the first run.
    #[must_use]
    pub fn from_context(identity_name: &str, context: &TriggerContext) -> Option<Self> {
        let scheduled_start = context.last_scheduled_time?;
        let run_start = context.last_actual_start_time.unwrap_or(scheduled_start);
        Some(Self {
            identity_name: identity_name.to_owned(),
            scheduled_start,
            run_start,
            run_end: context.last_completion_time.unwrap_or(run_start),
        })
    }

    /// The same history as a [`TriggerContext`].
    #[must_use]
    pub const fn to_context(&self) -> TriggerContext {
        TriggerContext::new(Some(self.scheduled_start), Some(self.run_start), Some(self.run_end))
    }
}

/// Trigger callback understood by a trigger-aware backend.
pub trait BackendTrigger: Send + Sync {
    /// Next run time given the backend's record of the last execution.
    ///
    /// `task_scheduled_time` is when the task was handed to the backend.
    fn next_run_time(&self, last: Option<&LastExecution>, task_scheduled_time: DateTime<Utc>) -> Option<DateTime<Utc>>;

    /// Whether the run planned for `scheduled_run_time` should be skipped.
    fn skip_run(&self, last: Option<&LastExecution>, scheduled_run_time: DateTime<Utc>) -> bool;
}

/// A scheduled executor that also schedules against [`BackendTrigger`]s.
pub trait TriggerAwareExecutor: ScheduledExecutor {
    /// Schedule `task` under `trigger`; `Ok(None)` if the trigger never fires.
    ///
    /// # Errors
    ///
    /// Returns a [`PoolError`] if the first execution cannot be accepted.
    fn schedule_with_trigger(
        &self,
        task: Runnable,
        trigger: Arc<dyn BackendTrigger>,
    ) -> Result<Option<ScheduledHandle>, PoolError>;
}

/// Presents a [`Trigger`] as a [`BackendTrigger`]. Runs are never skipped.
pub struct TriggerAdapter {
    trigger: Arc<dyn Trigger>,
}

impl fmt::Debug for TriggerAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerAdapter").finish_non_exhaustive()
    }
}

impl TriggerAdapter {
    /// Adapt `trigger`.
    #[must_use]
    pub fn new(trigger: Arc<dyn Trigger>) -> Self {
        Self { trigger }
    }
}

impl BackendTrigger for TriggerAdapter {
    fn next_run_time(&self, last: Option<&LastExecution>, _task_scheduled_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let context = last.map(LastExecution::to_context).unwrap_or_default();
        self.trigger.next_execution_time(&context)
    }

    fn skip_run(&self, _last: Option<&LastExecution>, _scheduled_run_time: DateTime<Utc>) -> bool {
        false
    }
}

/// Trigger-aware backend built on a [`ScheduledWorkerPool`].
pub struct ManagedScheduledPool {
    pool: Arc<ScheduledWorkerPool>,
    backend: Arc<dyn ScheduledExecutor>,
}

impl fmt::Debug for ManagedScheduledPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedScheduledPool")
            .field("pool", &self.pool)
            .finish()
    }
}

impl ManagedScheduledPool {
    /// Create the backend and its pool.
    ///
    /// # Errors
    ///
    /// Returns a [`PoolError`] if the pool cannot be created.
    pub fn new(config: &SchedulerPoolConfig) -> Result<Self, PoolError> {
        Ok(Self::from_pool(Arc::new(ScheduledWorkerPool::new(config)?)))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: Arc<ScheduledWorkerPool>) -> Self {
        let backend: Arc<dyn ScheduledExecutor> = Arc::clone(&pool) as Arc<dyn ScheduledExecutor>;
        Self { pool, backend }
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<ScheduledWorkerPool> {
        &self.pool
    }

    /// Shut the underlying pool down.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    /// Wait for the underlying pool to terminate.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.pool.await_termination(timeout)
    }
}

impl ScheduledExecutor for ManagedScheduledPool {
    fn execute(&self, task: Runnable) -> Result<(), PoolError> {
        self.backend.execute(task)
    }

    fn schedule(&self, task: Runnable, delay: Duration) -> Result<ScheduledHandle, PoolError> {
        self.backend.schedule(task, delay)
    }

    fn schedule_at_fixed_rate(
        &self,
        task: Runnable,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledHandle, PoolError> {
        self.backend.schedule_at_fixed_rate(task, initial_delay, period)
    }

    fn schedule_with_fixed_delay(
        &self,
        task: Runnable,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<ScheduledHandle, PoolError> {
        self.backend.schedule_with_fixed_delay(task, initial_delay, delay)
    }

    fn describe(&self) -> String {
        format!("Managed{}", self.backend.describe())
    }
}

impl TriggerAwareExecutor for ManagedScheduledPool {
    fn schedule_with_trigger(
        &self,
        task: Runnable,
        trigger: Arc<dyn BackendTrigger>,
    ) -> Result<Option<ScheduledHandle>, PoolError> {
        ReschedulingRunnable::new(task, NextRun::Backend(trigger), &self.backend).start()
    }
}
