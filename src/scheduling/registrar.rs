//! Declared scheduled tasks, scheduled together at startup.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::core::error::SchedulerError;
use crate::core::error_handler::ErrorPolicy;
use crate::core::future::ScheduledHandle;
use crate::core::task::Runnable;
use crate::util::clock;

use super::cron::CronTrigger;
use super::scheduler::TaskScheduler;
use super::trigger::{Trigger, TriggerError};

/// A declared one-shot or periodic task.
///
/// A zero period means one-shot; otherwise the task repeats at a fixed rate or
/// with a fixed delay, chosen at creation.
#[derive(Debug, Clone)]
pub struct ScheduledExecutorTask {
    task: Runnable,
    delay: Duration,
    period: Duration,
    fixed_rate: bool,
}

impl ScheduledExecutorTask {
    /// One-shot task with no delay.
    #[must_use]
    pub const fn new(task: Runnable) -> Self {
        Self {
            task,
            delay: Duration::ZERO,
            period: Duration::ZERO,
            fixed_rate: false,
        }
    }

    /// Delay before the first run.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Repeat every `period`; zero keeps the task one-shot.
    #[must_use]
    pub const fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Measure the period from scheduled starts instead of completions.
    #[must_use]
    pub const fn with_fixed_rate(mut self, fixed_rate: bool) -> Self {
        self.fixed_rate = fixed_rate;
        self
    }

    /// Error policy for this task, overriding the scheduler default.
    #[must_use]
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.task = self.task.with_error_policy(policy);
        self
    }

    /// Whether the task runs only once.
    #[must_use]
    pub const fn is_one_shot(&self) -> bool {
        self.period.is_zero()
    }

    fn schedule_on(self, scheduler: &dyn TaskScheduler) -> Result<ScheduledHandle, SchedulerError> {
        let start = clock::add_duration(clock::now(), self.delay);
        if self.is_one_shot() {
            scheduler.schedule_at(self.task, start)
        } else if self.fixed_rate {
            scheduler.schedule_at_fixed_rate_from(self.task, start, self.period)
        } else {
            scheduler.schedule_with_fixed_delay_from(self.task, start, self.period)
        }
    }
}

/// A declared task driven by a trigger.
#[derive(Clone)]
pub struct TriggerTask {
    task: Runnable,
    trigger: Arc<dyn Trigger>,
}

impl fmt::Debug for TriggerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerTask").field("task", &self.task).finish_non_exhaustive()
    }
}

impl TriggerTask {
    /// Pair `task` with `trigger`.
    #[must_use]
    pub fn new(task: Runnable, trigger: Arc<dyn Trigger>) -> Self {
        Self { task, trigger }
    }

    /// Error policy for this task, overriding the scheduler default.
    #[must_use]
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.task = self.task.with_error_policy(policy);
        self
    }
}

/// A declared task driven by a cron expression.
#[derive(Debug, Clone)]
pub struct CronTask {
    task: Runnable,
    trigger: CronTrigger,
}

impl CronTask {
    /// Parse `expression` (UTC) for `task`.
    ///
    /// # Errors
    ///
    /// Returns `TriggerError::InvalidCron` for a malformed expression.
    pub fn new(task: Runnable, expression: &str) -> Result<Self, TriggerError> {
        Ok(Self {
            task,
            trigger: CronTrigger::new(expression)?,
        })
    }

    /// Parse `expression` in the IANA zone `zone` for `task`.
    ///
    /// # Errors
    ///
    /// Returns `TriggerError` for a malformed expression or an unknown zone.
    pub fn with_zone(task: Runnable, expression: &str, zone: &str) -> Result<Self, TriggerError> {
        Ok(Self {
            task,
            trigger: CronTrigger::with_zone(expression, zone)?,
        })
    }

    /// Cron expression.
    #[must_use]
    pub fn expression(&self) -> &str {
        self.trigger.expression()
    }

    /// Error policy for this task, overriding the scheduler default.
    #[must_use]
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.task = self.task.with_error_policy(policy);
        self
    }
}

impl From<CronTask> for TriggerTask {
    fn from(cron: CronTask) -> Self {
        Self::new(cron.task, Arc::new(cron.trigger))
    }
}

/// Collects declared tasks and schedules them on one [`TaskScheduler`].
///
/// Handles of everything scheduled are kept so [`Self::destroy`] can cancel
/// them all.
pub struct ScheduledTaskRegistrar {
    scheduler: Arc<dyn TaskScheduler>,
    executor_tasks: Vec<ScheduledExecutorTask>,
    trigger_tasks: Vec<TriggerTask>,
    handles: Mutex<Vec<ScheduledHandle>>,
}

impl fmt::Debug for ScheduledTaskRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTaskRegistrar")
            .field("executor_tasks", &self.executor_tasks.len())
            .field("trigger_tasks", &self.trigger_tasks.len())
            .field("scheduled", &self.handles.lock().len())
            .finish()
    }
}

impl ScheduledTaskRegistrar {
    /// Registrar scheduling on `scheduler`.
    #[must_use]
    pub fn new(scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self {
            scheduler,
            executor_tasks: Vec::new(),
            trigger_tasks: Vec::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Declare a one-shot or periodic task.
    pub fn add_scheduled_task(&mut self, task: ScheduledExecutorTask) {
        self.executor_tasks.push(task);
    }

    /// Declare a fixed-rate task.
    pub fn add_fixed_rate_task(&mut self, task: Runnable, period: Duration) {
        self.add_scheduled_task(ScheduledExecutorTask::new(task).with_period(period).with_fixed_rate(true));
    }

    /// Declare a fixed-delay task.
    pub fn add_fixed_delay_task(&mut self, task: Runnable, delay: Duration) {
        self.add_scheduled_task(ScheduledExecutorTask::new(task).with_period(delay));
    }

    /// Declare a trigger-driven task.
    pub fn add_trigger_task(&mut self, task: TriggerTask) {
        self.trigger_tasks.push(task);
    }

    /// Declare a cron-driven task.
    pub fn add_cron_task(&mut self, task: CronTask) {
        self.trigger_tasks.push(task.into());
    }

    /// Whether any task has been declared.
    #[must_use]
    pub fn has_tasks(&self) -> bool {
        !self.executor_tasks.is_empty() || !self.trigger_tasks.is_empty()
    }

    /// Schedule every declared task; returns how many were scheduled.
    ///
    /// Trigger tasks whose trigger never fires are skipped. Declarations are
    /// consumed, so a second call only schedules tasks added since.
    ///
    /// # Errors
    ///
    /// Returns the first scheduling error; tasks scheduled before it stay scheduled.
    pub fn schedule_tasks(&mut self) -> Result<usize, SchedulerError> {
        let mut scheduled = 0;
        for task in std::mem::take(&mut self.executor_tasks) {
            let handle = task.schedule_on(self.scheduler.as_ref())?;
            self.handles.lock().push(handle);
            scheduled += 1;
        }
        for TriggerTask { task, trigger } in std::mem::take(&mut self.trigger_tasks) {
            let description = task.description().to_owned();
            match self.scheduler.schedule(task, trigger)? {
                Some(handle) => {
                    self.handles.lock().push(handle);
                    scheduled += 1;
                }
                None => debug!(task = %description, "Trigger task never fires; not scheduled"),
            }
        }
        info!(scheduled, "Scheduled declared tasks");
        Ok(scheduled)
    }

    /// Handles of everything scheduled so far.
    #[must_use]
    pub fn scheduled_handles(&self) -> Vec<ScheduledHandle> {
        self.handles.lock().clone()
    }

    /// Cancel everything scheduled by this registrar.
    pub fn destroy(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        let count = handles.len();
        for handle in handles {
            handle.cancel();
        }
        info!(cancelled = count, "Cancelled declared tasks");
    }
}
