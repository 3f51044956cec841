//! Scheduler facade over an externally owned backend.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::error::SchedulerError;
use crate::core::error_handler::{with_error_handling, ErrorHandler};
use crate::core::executor::TaskExecutor;
use crate::core::future::ScheduledHandle;
use crate::core::task::Runnable;
use crate::core::worker_pool::ScheduledExecutor;

use super::managed::{TriggerAdapter, TriggerAwareExecutor};
use super::scheduler::{schedule_rescheduling, translate, Scheduling, TaskScheduler};
use super::trigger::Trigger;

/// The backend a [`ConcurrentTaskScheduler`] drives, with its capability stated up front.
#[derive(Clone)]
pub enum SchedulerBackend {
    /// Plain scheduled executor; triggers run as self-rescheduling chains.
    Standard(Arc<dyn ScheduledExecutor>),
    /// Backend with native trigger support; triggers are handed to it.
    TriggerAware(Arc<dyn TriggerAwareExecutor>),
}

impl fmt::Debug for SchedulerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard(backend) => f.debug_tuple("Standard").field(&backend.describe()).finish(),
            Self::TriggerAware(backend) => f.debug_tuple("TriggerAware").field(&backend.describe()).finish(),
        }
    }
}

/// Scheduler facade over a backend owned by someone else.
///
/// The facade never shuts the backend down.
pub struct ConcurrentTaskScheduler {
    backend: SchedulerBackend,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl fmt::Debug for ConcurrentTaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentTaskScheduler")
            .field("backend", &self.backend)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl ConcurrentTaskScheduler {
    /// Facade over `backend`.
    #[must_use]
    pub fn new(backend: SchedulerBackend) -> Self {
        Self {
            backend,
            error_handler: None,
        }
    }

    /// Use `handler` for every task without its own error handler.
    #[must_use]
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Whether triggers go to the backend natively.
    #[must_use]
    pub const fn is_trigger_aware(&self) -> bool {
        matches!(self.backend, SchedulerBackend::TriggerAware(_))
    }

    fn with_ops<R>(&self, op: impl FnOnce(&Scheduling<'_, dyn ScheduledExecutor>) -> R) -> R {
        match &self.backend {
            SchedulerBackend::Standard(backend) => op(&Scheduling {
                backend: backend.as_ref(),
                error_handler: self.error_handler.as_ref(),
            }),
            SchedulerBackend::TriggerAware(backend) => {
                let backend: &dyn ScheduledExecutor = backend.as_ref();
                op(&Scheduling {
                    backend,
                    error_handler: self.error_handler.as_ref(),
                })
            }
        }
    }
}

impl TaskExecutor for ConcurrentTaskScheduler {
    fn execute(&self, task: Runnable) -> Result<(), SchedulerError> {
        self.with_ops(|ops| ops.execute(task))
    }
}

impl TaskScheduler for ConcurrentTaskScheduler {
    fn schedule(&self, task: Runnable, trigger: Arc<dyn Trigger>) -> Result<Option<ScheduledHandle>, SchedulerError> {
        match &self.backend {
            SchedulerBackend::Standard(backend) => {
                schedule_rescheduling(backend, task, trigger, self.error_handler.as_ref())
            }
            SchedulerBackend::TriggerAware(backend) => {
                let task = with_error_handling(task, self.error_handler.as_ref(), true);
                let description = task.description().to_owned();
                debug!(task = %description, "Delegating trigger to trigger-aware backend");
                backend
                    .schedule_with_trigger(task, Arc::new(TriggerAdapter::new(trigger)))
                    .map_err(|cause| translate(&backend.describe(), &description, cause))
            }
        }
    }

    fn schedule_at(&self, task: Runnable, start_time: DateTime<Utc>) -> Result<ScheduledHandle, SchedulerError> {
        self.with_ops(|ops| ops.once(task, start_time))
    }

    fn schedule_at_fixed_rate(&self, task: Runnable, period: Duration) -> Result<ScheduledHandle, SchedulerError> {
        self.with_ops(|ops| ops.periodic(task, None, period, true))
    }

    fn schedule_at_fixed_rate_from(
        &self,
        task: Runnable,
        start_time: DateTime<Utc>,
        period: Duration,
    ) -> Result<ScheduledHandle, SchedulerError> {
        self.with_ops(|ops| ops.periodic(task, Some(start_time), period, true))
    }

    fn schedule_with_fixed_delay(&self, task: Runnable, delay: Duration) -> Result<ScheduledHandle, SchedulerError> {
        self.with_ops(|ops| ops.periodic(task, None, delay, false))
    }

    fn schedule_with_fixed_delay_from(
        &self,
        task: Runnable,
        start_time: DateTime<Utc>,
        delay: Duration,
    ) -> Result<ScheduledHandle, SchedulerError> {
        self.with_ops(|ops| ops.periodic(task, Some(start_time), delay, false))
    }
}
