//! Persistent job scheduling.
//!
//! Jobs and triggers are definitions kept in a [`JobStore`]; a
//! [`PersistentScheduler`] fires due triggers and runs the registered
//! [`Job`] implementations on a task executor. [`JobRegistrar`] declares a
//! set of definitions idempotently at process start.

pub mod engine;
pub mod error;
pub mod job;
pub mod listeners;
pub mod model;
pub mod registration;
pub mod store;

pub use engine::{EngineSettings, PersistentScheduler, SchedulerEngine};
pub use error::{EngineError, RegistrationError};
pub use job::{Job, JobDataBinding, JobExecutionContext, JobRegistry};
pub use listeners::{JobListener, ListenerManager, SchedulerListener, TriggerListener};
pub use model::{
    Calendar, ConcurrencyMode, JobDataMap, JobDefinition, JobDefinitionBuilder, JobKey, StoredTrigger,
    TriggerDefinition, TriggerKey, TriggerSchedule, TriggerState, DEFAULT_GROUP,
};
pub use registration::{JobRegistrar, RegistrationReport, TriggerOutcome};
pub use store::{JobStore, TriggerFiredBundle};
