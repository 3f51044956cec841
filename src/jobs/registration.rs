//! Startup registration of jobs, triggers, calendars and listeners.
//!
//! Registration is idempotent and safe to run at every process start: jobs
//! and triggers that already exist are left alone unless overwriting is on,
//! and an "already exists" answer from a concurrent registration counts as
//! success.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::infra::datasource::TransactionManager;

use super::engine::SchedulerEngine;
use super::error::{EngineError, RegistrationError};
use super::listeners::{JobListener, SchedulerListener, TriggerListener};
use super::model::{Calendar, JobDefinition, TriggerDefinition};

/// What happened to one trigger during registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Newly scheduled, possibly by a concurrent registration.
    Scheduled,
    /// Replaced in place.
    Rescheduled,
    /// Left as it was.
    Skipped,
}

/// Counts of one registration batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationReport {
    /// Calendars stored.
    pub calendars: usize,
    /// Jobs added or replaced.
    pub jobs_added: usize,
    /// Jobs left as they were.
    pub jobs_skipped: usize,
    /// Triggers newly scheduled.
    pub triggers_scheduled: usize,
    /// Triggers replaced in place.
    pub triggers_rescheduled: usize,
    /// Triggers left as they were.
    pub triggers_skipped: usize,
    /// Listeners added.
    pub listeners: usize,
}

/// Registers a declared set of definitions with a [`SchedulerEngine`].
///
/// # Example
///
/// ```rust,ignore
/// let report = JobRegistrar::new(engine)
///     .with_transaction_manager(Arc::new(DataSourceTransactionManager::new(source)))
///     .job(JobDefinition::builder("report").build("nightlyReport"))
///     .trigger(nightly_trigger)
///     .register_jobs_and_triggers()?;
/// ```
pub struct JobRegistrar {
    engine: Arc<dyn SchedulerEngine>,
    overwrite_existing_jobs: bool,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    calendars: Vec<Calendar>,
    jobs: Vec<JobDefinition>,
    triggers: Vec<TriggerDefinition>,
    job_listeners: Vec<Arc<dyn JobListener>>,
    trigger_listeners: Vec<Arc<dyn TriggerListener>>,
    scheduler_listeners: Vec<Arc<dyn SchedulerListener>>,
}

impl fmt::Debug for JobRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistrar")
            .field("overwrite_existing_jobs", &self.overwrite_existing_jobs)
            .field("transactional", &self.transaction_manager.is_some())
            .field("calendars", &self.calendars.len())
            .field("jobs", &self.jobs.len())
            .field("triggers", &self.triggers.len())
            .finish_non_exhaustive()
    }
}

impl JobRegistrar {
    /// Registrar for `engine` that never overwrites.
    #[must_use]
    pub fn new(engine: Arc<dyn SchedulerEngine>) -> Self {
        Self {
            engine,
            overwrite_existing_jobs: false,
            transaction_manager: None,
            calendars: Vec::new(),
            jobs: Vec::new(),
            triggers: Vec::new(),
            job_listeners: Vec::new(),
            trigger_listeners: Vec::new(),
            scheduler_listeners: Vec::new(),
        }
    }

    /// Replace existing jobs and triggers with the declared ones.
    #[must_use]
    pub const fn with_overwrite_existing_jobs(mut self, overwrite: bool) -> Self {
        self.overwrite_existing_jobs = overwrite;
        self
    }

    /// Run each batch inside one transaction of `manager`.
    #[must_use]
    pub fn with_transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = Some(manager);
        self
    }

    /// Declare a calendar.
    #[must_use]
    pub fn calendar(mut self, calendar: Calendar) -> Self {
        self.calendars.push(calendar);
        self
    }

    /// Declare a job.
    #[must_use]
    pub fn job(mut self, job: JobDefinition) -> Self {
        self.jobs.push(job);
        self
    }

    /// Declare a trigger.
    #[must_use]
    pub fn trigger(mut self, trigger: TriggerDefinition) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Declare a job listener.
    #[must_use]
    pub fn job_listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.job_listeners.push(listener);
        self
    }

    /// Declare a trigger listener.
    #[must_use]
    pub fn trigger_listener(mut self, listener: Arc<dyn TriggerListener>) -> Self {
        self.trigger_listeners.push(listener);
        self
    }

    /// Declare a scheduler listener.
    #[must_use]
    pub fn scheduler_listener(mut self, listener: Arc<dyn SchedulerListener>) -> Self {
        self.scheduler_listeners.push(listener);
        self
    }

    /// Register everything declared: calendars, jobs, triggers, then listeners.
    ///
    /// With a transaction manager, a failure rolls back everything this batch
    /// wrote. A failing rollback is logged; the original cause is returned.
    ///
    /// # Errors
    ///
    /// `RegistrationError::Failed` wrapping the first failure, or
    /// `RegistrationError::Transaction` if the transaction cannot start or commit.
    pub fn register_jobs_and_triggers(&self) -> Result<RegistrationReport, RegistrationError> {
        let Some(manager) = &self.transaction_manager else {
            return self.register_all().map_err(RegistrationError::Failed);
        };
        let status = manager.begin()?;
        match self.register_all() {
            Ok(report) => {
                manager.commit(status)?;
                info!(?report, "Registered jobs and triggers");
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback) = manager.rollback(status) {
                    error!(error = %rollback, cause = %err, "Rolling back job registration failed");
                }
                Err(RegistrationError::Failed(err))
            }
        }
    }

    fn register_all(&self) -> Result<RegistrationReport, EngineError> {
        let mut report = RegistrationReport::default();
        for calendar in &self.calendars {
            self.engine.add_calendar(calendar.clone(), true)?;
            report.calendars += 1;
        }
        for job in &self.jobs {
            if self.add_job(job.clone())? {
                report.jobs_added += 1;
            } else {
                report.jobs_skipped += 1;
            }
        }
        for trigger in &self.triggers {
            match self.add_trigger(trigger.clone())? {
                TriggerOutcome::Scheduled => report.triggers_scheduled += 1,
                TriggerOutcome::Rescheduled => report.triggers_rescheduled += 1,
                TriggerOutcome::Skipped => report.triggers_skipped += 1,
            }
        }
        let listeners = self.engine.listener_manager();
        for listener in &self.job_listeners {
            listeners.add_job_listener(Arc::clone(listener));
            report.listeners += 1;
        }
        for listener in &self.trigger_listeners {
            listeners.add_trigger_listener(Arc::clone(listener));
            report.listeners += 1;
        }
        for listener in &self.scheduler_listeners {
            listeners.add_scheduler_listener(Arc::clone(listener));
            report.listeners += 1;
        }
        Ok(report)
    }

    /// Add `job` unless it exists and overwriting is off; `false` means not added.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure.
    pub fn add_job(&self, job: JobDefinition) -> Result<bool, EngineError> {
        if self.overwrite_existing_jobs {
            self.engine.add_job(job, true)?;
            return Ok(true);
        }
        if self.engine.job_definition(&job.key)?.is_some() {
            debug!(job = %job.key, "Job exists; not added");
            return Ok(false);
        }
        let key = job.key.clone();
        match self.engine.add_job(job, false) {
            Ok(()) => Ok(true),
            Err(err) if err.is_already_exists() => {
                warn!(job = %key, "Job added concurrently; not added");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Register `trigger`, rescheduling an existing one only when overwriting.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure; an "already exists" race is not one.
    pub fn add_trigger(&self, trigger: TriggerDefinition) -> Result<TriggerOutcome, EngineError> {
        let key = trigger.key.clone();
        if self.engine.trigger(&key)?.is_some() {
            if !self.overwrite_existing_jobs {
                debug!(trigger = %key, "Trigger exists; left as is");
                return Ok(TriggerOutcome::Skipped);
            }
            if let Some(job) = &trigger.job {
                if self.engine.job_definition(&job.key)?.is_none() {
                    self.add_job(job.clone())?;
                }
            }
            self.engine.reschedule_job(&key, trigger)?;
            return Ok(TriggerOutcome::Rescheduled);
        }

        let scheduled = match &trigger.job {
            Some(job) if self.engine.job_definition(&job.key)?.is_none() => {
                self.engine.schedule_job(job.clone(), trigger.clone())
            }
            _ => self.engine.schedule_trigger(trigger.clone()),
        };
        match scheduled {
            Ok(first_fire) => {
                debug!(trigger = %key, %first_fire, "Trigger scheduled");
                Ok(TriggerOutcome::Scheduled)
            }
            Err(err) if err.is_already_exists() => {
                warn!(trigger = %key, error = %err, "Trigger registered concurrently");
                if self.overwrite_existing_jobs {
                    self.engine.reschedule_job(&key, trigger)?;
                    return Ok(TriggerOutcome::Rescheduled);
                }
                Ok(TriggerOutcome::Scheduled)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::TaskExecutor;
    use crate::core::simple_executor::SimpleAsyncTaskExecutor;
    use crate::infra::store::RamJobStore;
    use crate::jobs::engine::{EngineSettings, PersistentScheduler};
    use crate::jobs::job::JobRegistry;
    use crate::jobs::model::{JobKey, TriggerKey, TriggerSchedule};
    use crate::util::clock;
    use std::time::Duration;

    fn engine() -> Arc<PersistentScheduler> {
        let settings = EngineSettings::new(
            "registration",
            Arc::new(RamJobStore::new()),
            Arc::new(SimpleAsyncTaskExecutor::new("registration-")) as Arc<dyn TaskExecutor>,
            Arc::new(JobRegistry::new()),
        );
        Arc::new(PersistentScheduler::new(settings).unwrap())
    }

    fn hourly(name: &str, job: &JobDefinition) -> TriggerDefinition {
        TriggerDefinition::for_job(
            TriggerKey::in_default_group(name),
            job.clone(),
            TriggerSchedule::every(clock::add_duration(clock::now(), Duration::from_secs(60)), Duration::from_secs(3600)),
        )
    }

    #[test]
    fn test_existing_job_not_added_without_overwrite() {
        let engine = engine();
        let registrar = JobRegistrar::new(Arc::clone(&engine) as Arc<dyn SchedulerEngine>);
        let job = JobDefinition::builder("report").data("v", 1).build("report");
        assert!(registrar.add_job(job.clone()).unwrap());
        let changed = JobDefinition::builder("report").data("v", 2).build("report");
        assert!(!registrar.add_job(changed).unwrap());
        assert_eq!(engine.job_definition(&job.key).unwrap().unwrap().data["v"], 1);
    }

    #[test]
    fn test_overwrite_replaces_job_and_reschedules_trigger() {
        let engine = engine();
        let job = JobDefinition::builder("report").build("report");
        JobRegistrar::new(Arc::clone(&engine) as Arc<dyn SchedulerEngine>)
            .trigger(hourly("hourly", &job))
            .register_jobs_and_triggers()
            .unwrap();

        let report = JobRegistrar::new(Arc::clone(&engine) as Arc<dyn SchedulerEngine>)
            .with_overwrite_existing_jobs(true)
            .trigger(hourly("hourly", &job).with_data("mode", "full"))
            .register_jobs_and_triggers()
            .unwrap();
        assert_eq!(report.triggers_rescheduled, 1);
        let stored = engine.trigger(&TriggerKey::in_default_group("hourly")).unwrap().unwrap();
        assert_eq!(stored.definition.data["mode"], "full");
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let engine = engine();
        let job = JobDefinition::builder("report").build("report");
        let registrar = JobRegistrar::new(Arc::clone(&engine) as Arc<dyn SchedulerEngine>)
            .job(job.clone())
            .trigger(hourly("hourly", &job));
        let first = registrar.register_jobs_and_triggers().unwrap();
        assert_eq!((first.jobs_added, first.triggers_scheduled), (1, 1));
        let second = registrar.register_jobs_and_triggers().unwrap();
        assert_eq!((second.jobs_skipped, second.triggers_skipped), (1, 1));
        assert_eq!(engine.store().job_keys().unwrap(), vec![JobKey::in_default_group("report")]);
    }

    #[test]
    fn test_failure_is_wrapped() {
        let engine = engine();
        let orphan = TriggerDefinition::new(
            TriggerKey::in_default_group("orphan"),
            JobKey::in_default_group("missing"),
            TriggerSchedule::once(clock::now()),
        );
        let err = JobRegistrar::new(engine as Arc<dyn SchedulerEngine>)
            .trigger(orphan)
            .register_jobs_and_triggers()
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Failed(EngineError::JobNotFound(_))));
    }
}
