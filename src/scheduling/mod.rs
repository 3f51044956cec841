//! Trigger-driven scheduling.
//!
//! - [`Trigger`] computes the next execution from a [`TriggerContext`]
//! - [`TaskScheduler`] is the facade contract; [`ThreadPoolTaskScheduler`]
//!   owns its pool, [`ConcurrentTaskScheduler`] drives one it is given
//! - backends without native trigger support run triggers as
//!   self-rescheduling chains; a [`TriggerAwareExecutor`] gets the trigger
//!   through a [`TriggerAdapter`]

pub mod concurrent;
pub mod cron;
pub mod managed;
pub(crate) mod rescheduling;
pub mod registrar;
pub mod scheduler;
pub mod trigger;

pub use concurrent::{ConcurrentTaskScheduler, SchedulerBackend};
pub use cron::CronTrigger;
pub use managed::{BackendTrigger, LastExecution, ManagedScheduledPool, TriggerAdapter, TriggerAwareExecutor};
pub use registrar::{CronTask, ScheduledExecutorTask, ScheduledTaskRegistrar, TriggerTask};
pub use scheduler::{TaskScheduler, ThreadPoolTaskScheduler};
pub use trigger::{PeriodicTrigger, Trigger, TriggerContext, TriggerError};
