//! Job store contract.

use chrono::{DateTime, Utc};

use super::error::EngineError;
use super::model::{Calendar, JobDefinition, JobKey, StoredTrigger, TriggerKey};

/// Everything the engine needs to run one fire of a trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerFiredBundle {
    /// Job to run.
    pub job: JobDefinition,
    /// Trigger state after the fire was recorded.
    pub trigger: StoredTrigger,
    /// When the fire was planned.
    pub scheduled_fire_time: DateTime<Utc>,
    /// When the fire was recorded.
    pub fire_time: DateTime<Utc>,
    /// The fire before this one.
    pub previous_fire_time: Option<DateTime<Utc>>,
}

/// Persistence of jobs, triggers and calendars.
///
/// Stores are shared between the registration path and the engine's firing
/// pass, so every method takes `&self`.
pub trait JobStore: Send + Sync {
    /// One-time setup before first use.
    ///
    /// # Errors
    ///
    /// Returns the store's setup failure.
    fn initialize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Store `job`; with `replace` unset an existing key is an error.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ObjectAlreadyExists` when the key is taken and
    /// `replace` is unset.
    fn store_job(&self, job: &JobDefinition, replace: bool) -> Result<(), EngineError>;

    /// Job by key.
    ///
    /// # Errors
    ///
    /// Returns the store's read failure.
    fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDefinition>, EngineError>;

    /// Remove a job and all of its triggers; `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns the store's write failure.
    fn remove_job(&self, key: &JobKey) -> Result<bool, EngineError>;

    /// Keys of all stored jobs.
    ///
    /// # Errors
    ///
    /// Returns the store's read failure.
    fn job_keys(&self) -> Result<Vec<JobKey>, EngineError>;

    /// Store `trigger`; its job must already be stored.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::JobNotFound` for an unknown job and
    /// `EngineError::ObjectAlreadyExists` when the key is taken and `replace`
    /// is unset.
    fn store_trigger(&self, trigger: &StoredTrigger, replace: bool) -> Result<(), EngineError>;

    /// Trigger by key.
    ///
    /// # Errors
    ///
    /// Returns the store's read failure.
    fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<StoredTrigger>, EngineError>;

    /// Remove a trigger; a non-durable job left without triggers goes with it.
    ///
    /// # Errors
    ///
    /// Returns the store's write failure.
    fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, EngineError>;

    /// Swap the trigger stored under `key` for `trigger`; `false` if `key` is unknown.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::JobNotFound` if the new trigger's job is unknown.
    fn replace_trigger(&self, key: &TriggerKey, trigger: &StoredTrigger) -> Result<bool, EngineError>;

    /// Triggers of one job.
    ///
    /// # Errors
    ///
    /// Returns the store's read failure.
    fn triggers_for_job(&self, job: &JobKey) -> Result<Vec<StoredTrigger>, EngineError>;

    /// Store a calendar.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ObjectAlreadyExists` when the name is taken and
    /// `replace` is unset.
    fn store_calendar(&self, calendar: &Calendar, replace: bool) -> Result<(), EngineError>;

    /// Calendar by name.
    ///
    /// # Errors
    ///
    /// Returns the store's read failure.
    fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>, EngineError>;

    /// Remove a calendar; `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns the store's write failure.
    fn remove_calendar(&self, name: &str) -> Result<bool, EngineError>;

    /// Claim up to `max` waiting triggers due at or before `no_later_than`.
    ///
    /// Claimed triggers are ordered by fire time, then by descending priority.
    ///
    /// # Errors
    ///
    /// Returns the store's read or write failure.
    fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<StoredTrigger>, EngineError>;

    /// Return a claimed trigger to the waiting state without firing it.
    ///
    /// # Errors
    ///
    /// Returns the store's write failure.
    fn release_acquired_trigger(&self, key: &TriggerKey) -> Result<(), EngineError>;

    /// Put every claimed trigger back to waiting.
    ///
    /// Claims do not survive a restart; the engine calls this once on
    /// start-up. Returns the number of triggers released.
    ///
    /// # Errors
    ///
    /// Returns the store's write failure.
    fn recover_acquired_triggers(&self) -> Result<usize, EngineError>;

    /// Record the fire of a claimed trigger and advance it.
    ///
    /// `None` if the trigger was removed or released since it was claimed.
    /// A trigger that cannot be advanced is left in the `Error` state.
    ///
    /// # Errors
    ///
    /// Returns the store's failure, the advance failure, or
    /// `EngineError::JobNotFound` if the trigger's job vanished.
    fn triggered(&self, key: &TriggerKey, now: DateTime<Utc>) -> Result<Option<TriggerFiredBundle>, EngineError>;

    /// A fired job run finished; drop the trigger if it is complete.
    ///
    /// # Errors
    ///
    /// Returns the store's write failure.
    fn triggered_job_complete(&self, trigger: &TriggerKey, job: &JobKey) -> Result<(), EngineError>;

    /// Remove every job, trigger and calendar.
    ///
    /// # Errors
    ///
    /// Returns the store's write failure.
    fn clear(&self) -> Result<(), EngineError>;
}
