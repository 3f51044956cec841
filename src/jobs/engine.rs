//! Long-lived scheduler engine over a [`JobStore`].
//!
//! The engine owns no threads. Each firing pass claims due triggers from the
//! store, records their fire, and hands the job runs to a [`TaskExecutor`].
//! [`PersistentScheduler::start`] drives passes with a fixed delay on a
//! [`TaskScheduler`].

use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::core::executor::TaskExecutor;
use crate::core::future::ScheduledHandle;
use crate::core::task::{panic_message, Runnable};
use crate::scheduling::scheduler::TaskScheduler;
use crate::util::clock;

use super::error::EngineError;
use super::job::{Job, JobExecutionContext, JobRegistry};
use super::listeners::ListenerManager;
use super::model::{
    Calendar, ConcurrencyMode, JobDefinition, JobKey, StoredTrigger, TriggerDefinition, TriggerKey, TriggerState,
};
use super::store::{JobStore, TriggerFiredBundle};

/// Operations of a persistent scheduler engine.
///
/// This is the surface the registration protocol works against.
pub trait SchedulerEngine: Send + Sync {
    /// Store a calendar.
    ///
    /// # Errors
    ///
    /// `EngineError::ObjectAlreadyExists` when it exists and `replace` is unset.
    fn add_calendar(&self, calendar: Calendar, replace: bool) -> Result<(), EngineError>;

    /// Store a job without triggers.
    ///
    /// # Errors
    ///
    /// `EngineError::ObjectAlreadyExists` when it exists and `replace` is unset.
    fn add_job(&self, job: JobDefinition, replace: bool) -> Result<(), EngineError>;

    /// Stored job by key.
    ///
    /// # Errors
    ///
    /// Returns the store's failure.
    fn job_definition(&self, key: &JobKey) -> Result<Option<JobDefinition>, EngineError>;

    /// Stored trigger by key.
    ///
    /// # Errors
    ///
    /// Returns the store's failure.
    fn trigger(&self, key: &TriggerKey) -> Result<Option<StoredTrigger>, EngineError>;

    /// Store `job` and `trigger` together; returns the first fire time.
    ///
    /// # Errors
    ///
    /// `EngineError::ObjectAlreadyExists` if either exists, or
    /// `EngineError::NeverFires` if the trigger has no fire time.
    fn schedule_job(&self, job: JobDefinition, trigger: TriggerDefinition) -> Result<DateTime<Utc>, EngineError>;

    /// Store a trigger for an already stored job; returns the first fire time.
    ///
    /// # Errors
    ///
    /// `EngineError::JobNotFound`, `EngineError::ObjectAlreadyExists` or
    /// `EngineError::NeverFires`.
    fn schedule_trigger(&self, trigger: TriggerDefinition) -> Result<DateTime<Utc>, EngineError>;

    /// Replace the trigger stored under `key`; `None` if there was none.
    ///
    /// # Errors
    ///
    /// `EngineError::JobNotFound` or `EngineError::NeverFires`.
    fn reschedule_job(
        &self,
        key: &TriggerKey,
        trigger: TriggerDefinition,
    ) -> Result<Option<DateTime<Utc>>, EngineError>;

    /// Remove a trigger.
    ///
    /// # Errors
    ///
    /// Returns the store's failure.
    fn unschedule_job(&self, key: &TriggerKey) -> Result<bool, EngineError>;

    /// Remove a job and its triggers.
    ///
    /// # Errors
    ///
    /// Returns the store's failure.
    fn delete_job(&self, key: &JobKey) -> Result<bool, EngineError>;

    /// Listener registrations.
    fn listener_manager(&self) -> &ListenerManager;
}

/// Everything a [`PersistentScheduler`] is built from.
#[derive(Clone)]
pub struct EngineSettings {
    /// Engine name used in logs and task descriptions.
    pub name: String,
    /// Where jobs and triggers live.
    pub store: Arc<dyn JobStore>,
    /// Runs the fired jobs.
    pub executor: Arc<dyn TaskExecutor>,
    /// Job implementations by type.
    pub registry: Arc<JobRegistry>,
    /// Most triggers claimed per pass.
    pub batch_size: usize,
    /// Delay between the end of one pass and the start of the next.
    pub idle_wait: Duration,
}

impl fmt::Debug for EngineSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSettings")
            .field("name", &self.name)
            .field("batch_size", &self.batch_size)
            .field("idle_wait", &self.idle_wait)
            .finish_non_exhaustive()
    }
}

impl EngineSettings {
    /// Settings with a batch of 10 and a one second idle wait.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn TaskExecutor>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            executor,
            registry,
            batch_size: 10,
            idle_wait: Duration::from_secs(1),
        }
    }

    /// Most triggers claimed per pass.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Delay between passes.
    #[must_use]
    pub const fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }
}

struct EngineInner {
    settings: EngineSettings,
    listeners: ListenerManager,
    running_exclusive: Mutex<HashSet<JobKey>>,
    in_flight: Mutex<usize>,
    idle: Condvar,
    started: AtomicBool,
    shut_down: AtomicBool,
    pass: Mutex<Option<ScheduledHandle>>,
}

/// Accounts for one dispatched run until it finishes or is dropped unrun.
struct RunGuard {
    engine: Arc<EngineInner>,
    exclusive: Option<JobKey>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(job) = self.exclusive.take() {
            self.engine.running_exclusive.lock().remove(&job);
        }
        let mut in_flight = self.engine.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.engine.idle.notify_all();
        }
    }
}

impl EngineInner {
    fn calendar_for(&self, trigger: &TriggerDefinition) -> Result<Option<Calendar>, EngineError> {
        match &trigger.calendar {
            Some(name) => self
                .settings
                .store
                .retrieve_calendar(name)?
                .map(Some)
                .ok_or_else(|| EngineError::CalendarNotFound(name.clone())),
            None => Ok(None),
        }
    }

    fn prepare(&self, trigger: TriggerDefinition) -> Result<(StoredTrigger, DateTime<Utc>), EngineError> {
        trigger.schedule.validate()?;
        let calendar = self.calendar_for(&trigger)?;
        let stored = StoredTrigger::new(trigger, calendar.as_ref(), clock::now())?;
        let first = stored
            .next_fire_time
            .ok_or_else(|| EngineError::NeverFires(stored.key().to_string()))?;
        Ok((stored, first))
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown(self.settings.name.clone()));
        }
        Ok(())
    }

    fn report(&self, message: &str, err: &EngineError) {
        error!(engine = %self.settings.name, error = %err, "{message}");
        for listener in self.listeners.scheduler_listeners() {
            listener.scheduler_error(message, err);
        }
    }

    fn fire_due(self: &Arc<Self>, now: DateTime<Utc>) -> Result<usize, EngineError> {
        self.ensure_open()?;
        let store = &self.settings.store;
        let acquired = store.acquire_next_triggers(now, self.settings.batch_size)?;
        let mut dispatched = 0;
        for trigger in acquired {
            let key = trigger.key().clone();
            let job = match store.retrieve_job(trigger.job_key()) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!(trigger = %key, job = %trigger.job_key(), "Trigger fired for a missing job");
                    self.release(&key);
                    continue;
                }
                Err(err) => {
                    self.report("Loading fired job failed", &err);
                    self.release(&key);
                    continue;
                }
            };
            let exclusive = job.concurrency == ConcurrencyMode::Exclusive;
            if exclusive && !self.running_exclusive.lock().insert(job.key.clone()) {
                debug!(trigger = %key, job = %job.key, "Exclusive job still running; trigger held back");
                self.release(&key);
                continue;
            }
            let guard = RunGuard {
                engine: Arc::clone(self),
                exclusive: exclusive.then(|| job.key.clone()),
            };
            *self.in_flight.lock() += 1;
            match store.triggered(&key, now) {
                Ok(Some(bundle)) => {
                    if self.dispatch(bundle, guard) {
                        dispatched += 1;
                    }
                }
                Ok(None) => debug!(trigger = %key, "Trigger changed after it was claimed"),
                Err(err) => {
                    self.report("Recording trigger fire failed", &err);
                    self.release(&key);
                }
            }
        }
        Ok(dispatched)
    }

    fn release(&self, key: &TriggerKey) {
        if let Err(err) = self.settings.store.release_acquired_trigger(key) {
            self.report("Releasing claimed trigger failed", &err);
        }
    }

    fn dispatch(self: &Arc<Self>, bundle: TriggerFiredBundle, guard: RunGuard) -> bool {
        let context = JobExecutionContext::from_bundle(&bundle);
        let Some(job) = self.settings.registry.get(&bundle.job.job_type) else {
            self.report(
                "Fired job has no implementation",
                &EngineError::UnknownJobType(bundle.job.job_type.clone()),
            );
            self.complete(&bundle, &context);
            return false;
        };
        for listener in self.listeners.trigger_listeners() {
            listener.trigger_fired(&bundle.trigger, &context);
        }
        let vetoed = self
            .listeners
            .trigger_listeners()
            .iter()
            .any(|listener| listener.veto_job_execution(&bundle.trigger, &context));
        if vetoed {
            info!(job = %bundle.job.key, trigger = %bundle.trigger.key(), "Job run vetoed");
            for listener in self.listeners.job_listeners() {
                listener.job_execution_vetoed(&context);
            }
            self.complete(&bundle, &context);
            return false;
        }

        let description = format!("{}:{}", self.settings.name, bundle.job.key);
        let engine = Arc::clone(self);
        let (fired, fired_context) = (bundle.clone(), context.clone());
        let task = Runnable::once(move || {
            engine.run(job.as_ref(), &fired, &fired_context);
            drop(guard);
            Ok(())
        })
        .named(description.clone());
        match self.settings.executor.execute(task) {
            Ok(()) => {
                debug!(job = %description, "Dispatched job run");
                true
            }
            Err(err) => {
                self.report("Executor refused job run", &EngineError::Scheduler(err));
                self.complete(&bundle, &context);
                false
            }
        }
    }

    fn run(&self, job: &dyn Job, bundle: &TriggerFiredBundle, context: &JobExecutionContext) {
        for listener in self.listeners.job_listeners() {
            listener.job_to_be_executed(context);
        }
        let started = Instant::now();
        let failure = match catch_unwind(AssertUnwindSafe(|| job.execute(context))) {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(payload) => Some(format!("job panicked: {}", panic_message(payload.as_ref()))),
        };
        match &failure {
            None => debug!(
                job = %bundle.job.key,
                fire_instance = %context.fire_instance_id,
                elapsed_ms = started.elapsed().as_millis(),
                "Job run completed"
            ),
            Some(message) => error!(
                job = %bundle.job.key,
                fire_instance = %context.fire_instance_id,
                error = %message,
                "Job run failed"
            ),
        }
        for listener in self.listeners.job_listeners() {
            listener.job_was_executed(context, failure.as_deref());
        }
        self.complete(bundle, context);
    }

    fn complete(&self, bundle: &TriggerFiredBundle, context: &JobExecutionContext) {
        for listener in self.listeners.trigger_listeners() {
            listener.trigger_complete(&bundle.trigger, context);
        }
        if let Err(err) = self
            .settings
            .store
            .triggered_job_complete(bundle.trigger.key(), &bundle.job.key)
        {
            self.report("Completing fired trigger failed", &err);
        }
        if bundle.trigger.state == TriggerState::Complete {
            for listener in self.listeners.scheduler_listeners() {
                listener.trigger_finalized(bundle.trigger.key());
            }
        }
    }
}

/// Scheduler engine persisting its state in a [`JobStore`].
#[derive(Clone)]
pub struct PersistentScheduler {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for PersistentScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentScheduler")
            .field("settings", &self.inner.settings)
            .field("started", &self.is_started())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl PersistentScheduler {
    /// Build the engine, initialize its store and release triggers left
    /// claimed by a previous run.
    ///
    /// # Errors
    ///
    /// Returns the store's initialization or recovery failure.
    pub fn new(settings: EngineSettings) -> Result<Self, EngineError> {
        settings.store.initialize()?;
        let recovered = settings.store.recover_acquired_triggers()?;
        if recovered > 0 {
            info!(engine = %settings.name, triggers = recovered, "Released triggers claimed before restart");
        }
        info!(
            engine = %settings.name,
            batch_size = settings.batch_size,
            idle_wait_ms = settings.idle_wait.as_millis(),
            "Created scheduler engine"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                settings,
                listeners: ListenerManager::new(),
                running_exclusive: Mutex::new(HashSet::new()),
                in_flight: Mutex::new(0),
                idle: Condvar::new(),
                started: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                pass: Mutex::new(None),
            }),
        })
    }

    /// Engine name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    /// Job implementations.
    #[must_use]
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.settings.registry
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.settings.store
    }

    /// Run one firing pass for triggers due at `now`; returns the runs dispatched.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Shutdown` after shutdown, or the store's failure
    /// to claim triggers. Failures of single triggers are reported to
    /// scheduler listeners and do not fail the pass.
    pub fn fire_due_triggers(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        self.inner.fire_due(now)
    }

    /// Drive firing passes on `scheduler`, `idle_wait` apart.
    ///
    /// Starting twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Shutdown` after shutdown, or the scheduler's
    /// refusal of the pass task.
    pub fn start(&self, scheduler: &dyn TaskScheduler) -> Result<(), EngineError> {
        self.inner.ensure_open()?;
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let pass = Runnable::new(move || {
            if let Some(engine) = weak.upgrade() {
                if let Err(err) = engine.fire_due(clock::now()) {
                    if !matches!(err, EngineError::Shutdown(_)) {
                        engine.report("Firing pass failed", &err);
                    }
                }
            }
            Ok(())
        })
        .named(format!("{}-firing-pass", self.name()));
        match scheduler.schedule_with_fixed_delay(pass, self.inner.settings.idle_wait) {
            Ok(handle) => *self.inner.pass.lock() = Some(handle),
            Err(err) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        }
        info!(engine = %self.name(), "Scheduler engine started");
        for listener in self.inner.listeners.scheduler_listeners() {
            listener.scheduler_started();
        }
        Ok(())
    }

    /// Stop firing; with `wait_for_jobs` set, wait up to `timeout` for running jobs.
    ///
    /// Returns `true` if no job run is left in flight.
    pub fn shutdown(&self, wait_for_jobs: bool, timeout: Duration) -> bool {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return self.running_jobs() == 0;
        }
        let pass = self.inner.pass.lock().take();
        if let Some(handle) = pass {
            handle.cancel();
        }
        let idle = if wait_for_jobs {
            self.await_jobs(timeout)
        } else {
            self.running_jobs() == 0
        };
        if !idle {
            warn!(engine = %self.name(), running = self.running_jobs(), "Job runs still in flight at shutdown");
        }
        info!(engine = %self.name(), "Scheduler engine shut down");
        for listener in self.inner.listeners.scheduler_listeners() {
            listener.scheduler_shutdown();
        }
        idle
    }

    /// Wait up to `timeout` for every dispatched run to finish.
    pub fn await_jobs(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.inner.in_flight.lock();
        while *in_flight > 0 {
            if self.inner.idle.wait_until(&mut in_flight, deadline).timed_out() {
                return *in_flight == 0;
            }
        }
        true
    }

    /// Dispatched runs not yet finished.
    #[must_use]
    pub fn running_jobs(&self) -> usize {
        *self.inner.in_flight.lock()
    }

    /// Whether [`Self::start`] has run.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Whether [`Self::shutdown`] has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn notify_scheduled(&self, key: &TriggerKey) {
        for listener in self.inner.listeners.scheduler_listeners() {
            listener.job_scheduled(key);
        }
    }
}

impl SchedulerEngine for PersistentScheduler {
    fn add_calendar(&self, calendar: Calendar, replace: bool) -> Result<(), EngineError> {
        self.inner.ensure_open()?;
        self.inner.settings.store.store_calendar(&calendar, replace)?;
        debug!(engine = %self.name(), calendar = %calendar.name, "Stored calendar");
        Ok(())
    }

    fn add_job(&self, job: JobDefinition, replace: bool) -> Result<(), EngineError> {
        self.inner.ensure_open()?;
        self.inner.settings.store.store_job(&job, replace)?;
        info!(engine = %self.name(), job = %job.key, replace, "Stored job");
        for listener in self.inner.listeners.scheduler_listeners() {
            listener.job_added(&job.key);
        }
        Ok(())
    }

    fn job_definition(&self, key: &JobKey) -> Result<Option<JobDefinition>, EngineError> {
        self.inner.settings.store.retrieve_job(key)
    }

    fn trigger(&self, key: &TriggerKey) -> Result<Option<StoredTrigger>, EngineError> {
        self.inner.settings.store.retrieve_trigger(key)
    }

    fn schedule_job(&self, job: JobDefinition, trigger: TriggerDefinition) -> Result<DateTime<Utc>, EngineError> {
        self.inner.ensure_open()?;
        if trigger.job_key != job.key {
            return Err(EngineError::Store(format!(
                "trigger `{}` references job `{}`, not `{}`",
                trigger.key, trigger.job_key, job.key
            )));
        }
        let store = &self.inner.settings.store;
        if store.retrieve_trigger(&trigger.key)?.is_some() {
            return Err(EngineError::already_exists("trigger", &trigger.key));
        }
        let (stored, first) = self.inner.prepare(trigger)?;
        store.store_job(&job, false)?;
        store.store_trigger(&stored, false)?;
        info!(engine = %self.name(), job = %job.key, trigger = %stored.key(), first_fire = %first, "Scheduled job");
        for listener in self.inner.listeners.scheduler_listeners() {
            listener.job_added(&job.key);
        }
        self.notify_scheduled(stored.key());
        Ok(first)
    }

    fn schedule_trigger(&self, trigger: TriggerDefinition) -> Result<DateTime<Utc>, EngineError> {
        self.inner.ensure_open()?;
        let store = &self.inner.settings.store;
        if store.retrieve_job(&trigger.job_key)?.is_none() {
            return Err(EngineError::JobNotFound(trigger.job_key.to_string()));
        }
        let (stored, first) = self.inner.prepare(trigger)?;
        store.store_trigger(&stored, false)?;
        info!(engine = %self.name(), trigger = %stored.key(), first_fire = %first, "Scheduled trigger");
        self.notify_scheduled(stored.key());
        Ok(first)
    }

    fn reschedule_job(
        &self,
        key: &TriggerKey,
        trigger: TriggerDefinition,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        self.inner.ensure_open()?;
        let (stored, first) = self.inner.prepare(trigger)?;
        if !self.inner.settings.store.replace_trigger(key, &stored)? {
            debug!(engine = %self.name(), trigger = %key, "Nothing to reschedule");
            return Ok(None);
        }
        info!(engine = %self.name(), trigger = %key, first_fire = %first, "Rescheduled trigger");
        self.notify_scheduled(stored.key());
        Ok(Some(first))
    }

    fn unschedule_job(&self, key: &TriggerKey) -> Result<bool, EngineError> {
        let removed = self.inner.settings.store.remove_trigger(key)?;
        if removed {
            info!(engine = %self.name(), trigger = %key, "Unscheduled trigger");
            for listener in self.inner.listeners.scheduler_listeners() {
                listener.job_unscheduled(key);
            }
        }
        Ok(removed)
    }

    fn delete_job(&self, key: &JobKey) -> Result<bool, EngineError> {
        let removed = self.inner.settings.store.remove_job(key)?;
        if removed {
            info!(engine = %self.name(), job = %key, "Deleted job");
            for listener in self.inner.listeners.scheduler_listeners() {
                listener.job_deleted(key);
            }
        }
        Ok(removed)
    }

    fn listener_manager(&self) -> &ListenerManager {
        &self.inner.listeners
    }
}
