//! Job, trigger and scheduler listeners.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::error::EngineError;
use super::job::JobExecutionContext;
use super::model::{JobKey, StoredTrigger, TriggerKey};

/// Observes job runs.
pub trait JobListener: Send + Sync {
    /// Name; a second listener with the same name replaces the first.
    fn name(&self) -> &str;

    /// A run is about to start.
    fn job_to_be_executed(&self, _context: &JobExecutionContext) {}

    /// A trigger listener vetoed the run.
    fn job_execution_vetoed(&self, _context: &JobExecutionContext) {}

    /// A run finished; `error` is the job's failure message, if any.
    fn job_was_executed(&self, _context: &JobExecutionContext, _error: Option<&str>) {}
}

/// Observes trigger fires and may veto runs.
pub trait TriggerListener: Send + Sync {
    /// Name; a second listener with the same name replaces the first.
    fn name(&self) -> &str;

    /// The trigger fired and its job is about to run.
    fn trigger_fired(&self, _trigger: &StoredTrigger, _context: &JobExecutionContext) {}

    /// Return `true` to skip this run.
    fn veto_job_execution(&self, _trigger: &StoredTrigger, _context: &JobExecutionContext) -> bool {
        false
    }

    /// The fire time passed while the trigger could not fire.
    fn trigger_misfired(&self, _trigger: &StoredTrigger) {}

    /// The run started by this trigger finished.
    fn trigger_complete(&self, _trigger: &StoredTrigger, _context: &JobExecutionContext) {}
}

/// Observes engine-wide events.
pub trait SchedulerListener: Send + Sync {
    /// A job was added or replaced.
    fn job_added(&self, _job: &JobKey) {}

    /// A job was deleted.
    fn job_deleted(&self, _job: &JobKey) {}

    /// A trigger was scheduled or rescheduled.
    fn job_scheduled(&self, _trigger: &TriggerKey) {}

    /// A trigger was removed.
    fn job_unscheduled(&self, _trigger: &TriggerKey) {}

    /// A trigger has no further fire times.
    fn trigger_finalized(&self, _trigger: &TriggerKey) {}

    /// The engine hit an error it could not hand to anyone else.
    fn scheduler_error(&self, _message: &str, _error: &EngineError) {}

    /// The engine started firing.
    fn scheduler_started(&self) {}

    /// The engine stopped firing.
    fn scheduler_shutdown(&self) {}
}

/// Listener registrations of one engine.
#[derive(Default)]
pub struct ListenerManager {
    job_listeners: RwLock<Vec<Arc<dyn JobListener>>>,
    trigger_listeners: RwLock<Vec<Arc<dyn TriggerListener>>>,
    scheduler_listeners: RwLock<Vec<Arc<dyn SchedulerListener>>>,
}

impl fmt::Debug for ListenerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerManager")
            .field("job_listeners", &self.job_listeners.read().len())
            .field("trigger_listeners", &self.trigger_listeners.read().len())
            .field("scheduler_listeners", &self.scheduler_listeners.read().len())
            .finish()
    }
}

impl ListenerManager {
    /// No listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job listener, replacing one of the same name.
    pub fn add_job_listener(&self, listener: Arc<dyn JobListener>) {
        let mut listeners = self.job_listeners.write();
        listeners.retain(|existing| existing.name() != listener.name());
        listeners.push(listener);
    }

    /// Add a trigger listener, replacing one of the same name.
    pub fn add_trigger_listener(&self, listener: Arc<dyn TriggerListener>) {
        let mut listeners = self.trigger_listeners.write();
        listeners.retain(|existing| existing.name() != listener.name());
        listeners.push(listener);
    }

    /// Add a scheduler listener.
    pub fn add_scheduler_listener(&self, listener: Arc<dyn SchedulerListener>) {
        self.scheduler_listeners.write().push(listener);
    }

    /// Remove the job listener called `name`.
    pub fn remove_job_listener(&self, name: &str) -> bool {
        let mut listeners = self.job_listeners.write();
        let before = listeners.len();
        listeners.retain(|existing| existing.name() != name);
        listeners.len() != before
    }

    /// Remove the trigger listener called `name`.
    pub fn remove_trigger_listener(&self, name: &str) -> bool {
        let mut listeners = self.trigger_listeners.write();
        let before = listeners.len();
        listeners.retain(|existing| existing.name() != name);
        listeners.len() != before
    }

    /// Names of the job listeners.
    #[must_use]
    pub fn job_listener_names(&self) -> Vec<String> {
        self.job_listeners.read().iter().map(|l| l.name().to_owned()).collect()
    }

    /// Names of the trigger listeners.
    #[must_use]
    pub fn trigger_listener_names(&self) -> Vec<String> {
        self.trigger_listeners.read().iter().map(|l| l.name().to_owned()).collect()
    }

    /// Snapshot of the job listeners.
    #[must_use]
    pub fn job_listeners(&self) -> Vec<Arc<dyn JobListener>> {
        self.job_listeners.read().clone()
    }

    /// Snapshot of the trigger listeners.
    #[must_use]
    pub fn trigger_listeners(&self) -> Vec<Arc<dyn TriggerListener>> {
        self.trigger_listeners.read().clone()
    }

    /// Snapshot of the scheduler listeners.
    #[must_use]
    pub fn scheduler_listeners(&self) -> Vec<Arc<dyn SchedulerListener>> {
        self.scheduler_listeners.read().clone()
    }
}
