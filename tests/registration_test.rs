//! Integration tests for startup job registration
//!
//! Covers idempotent re-registration, overwriting, tolerance of concurrent
//! registrations, and rollback of a failed batch inside the application's
//! transaction.

use prometheus_scheduling::core::{SimpleAsyncTaskExecutor, TaskExecutor};
use prometheus_scheduling::infra::datasource::DataSource;
use prometheus_scheduling::infra::{
    ConnectionBridge, DataSourceTransactionManager, RamJobStore, SqliteDataSource, SqliteJobStore,
};
use prometheus_scheduling::jobs::{
    Calendar, EngineError, EngineSettings, JobDefinition, JobKey, JobListener, JobRegistrar, JobRegistry, JobStore,
    PersistentScheduler, RegistrationError, SchedulerEngine, TriggerDefinition, TriggerKey, TriggerSchedule,
};
use prometheus_scheduling::util::clock;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn engine_over(store: Arc<dyn JobStore>) -> Arc<PersistentScheduler> {
    let settings = EngineSettings::new(
        "registration",
        store,
        Arc::new(SimpleAsyncTaskExecutor::new("registration-")) as Arc<dyn TaskExecutor>,
        Arc::new(JobRegistry::new()),
    );
    Arc::new(PersistentScheduler::new(settings).unwrap())
}

fn sqlite() -> (tempfile::TempDir, Arc<dyn DataSource>, Arc<SqliteJobStore>) {
    let dir = tempfile::tempdir().unwrap();
    let source: Arc<dyn DataSource> = Arc::new(SqliteDataSource::new(dir.path().join("jobs.db")));
    let store = Arc::new(SqliteJobStore::new(&ConnectionBridge::new(Arc::clone(&source), None)));
    (dir, source, store)
}

fn report_job() -> JobDefinition {
    JobDefinition::builder("report")
        .description("Nightly usage report")
        .data("recipients", "ops@example.com")
        .build("nightlyReport")
}

fn hourly(job: &JobDefinition) -> TriggerDefinition {
    TriggerDefinition::for_job(
        TriggerKey::in_default_group("nightlyReportTrigger"),
        job.clone(),
        TriggerSchedule::every(
            clock::add_duration(clock::now(), Duration::from_secs(60)),
            Duration::from_secs(3600),
        ),
    )
}

fn as_engine(engine: &Arc<PersistentScheduler>) -> Arc<dyn SchedulerEngine> {
    Arc::clone(engine) as Arc<dyn SchedulerEngine>
}

struct Named(&'static str);

impl JobListener for Named {
    fn name(&self) -> &str {
        self.0
    }
}

#[test]
fn test_restart_registration_is_idempotent() {
    let (_dir, _source, store) = sqlite();
    let engine = engine_over(store);
    let job = report_job();

    for round in 0..3 {
        let report = JobRegistrar::new(as_engine(&engine))
            .job(job.clone())
            .trigger(hourly(&job))
            .register_jobs_and_triggers()
            .unwrap();
        if round == 0 {
            assert_eq!((report.jobs_added, report.triggers_scheduled), (1, 1));
        } else {
            assert_eq!((report.jobs_skipped, report.triggers_skipped), (1, 1));
        }
    }
    assert_eq!(engine.store().job_keys().unwrap(), vec![JobKey::in_default_group("nightlyReport")]);
    assert_eq!(engine.store().triggers_for_job(&job.key).unwrap().len(), 1);
}

#[test]
fn test_existing_trigger_is_untouched_without_overwrite() {
    let engine = engine_over(Arc::new(RamJobStore::new()));
    let job = report_job();
    JobRegistrar::new(as_engine(&engine))
        .trigger(hourly(&job))
        .register_jobs_and_triggers()
        .unwrap();

    let report = JobRegistrar::new(as_engine(&engine))
        .trigger(hourly(&job).with_priority(9))
        .register_jobs_and_triggers()
        .unwrap();
    assert_eq!(report.triggers_skipped, 1);
    let stored = engine
        .trigger(&TriggerKey::in_default_group("nightlyReportTrigger"))
        .unwrap()
        .unwrap();
    assert_eq!(stored.definition.priority, 5);
}

#[test]
fn test_overwrite_replaces_job_and_trigger() {
    let engine = engine_over(Arc::new(RamJobStore::new()));
    let job = report_job();
    JobRegistrar::new(as_engine(&engine))
        .job(job.clone())
        .trigger(hourly(&job))
        .register_jobs_and_triggers()
        .unwrap();

    let changed = JobDefinition::builder("report")
        .data("recipients", "leads@example.com")
        .build("nightlyReport");
    let report = JobRegistrar::new(as_engine(&engine))
        .with_overwrite_existing_jobs(true)
        .job(changed.clone())
        .trigger(hourly(&changed).with_priority(9))
        .register_jobs_and_triggers()
        .unwrap();
    assert_eq!((report.jobs_added, report.triggers_rescheduled), (1, 1));

    let stored_job = engine.job_definition(&changed.key).unwrap().unwrap();
    assert_eq!(stored_job.data["recipients"], "leads@example.com");
    let stored_trigger = engine
        .trigger(&TriggerKey::in_default_group("nightlyReportTrigger"))
        .unwrap()
        .unwrap();
    assert_eq!(stored_trigger.definition.priority, 9);
}

#[test]
fn test_concurrent_registration_both_succeed() {
    let (_dir, _source, store) = sqlite();
    let engine = engine_over(store);
    let job = report_job();
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let engine = as_engine(&engine);
            let job = job.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let registrar = JobRegistrar::new(engine).trigger(hourly(&job));
                barrier.wait();
                registrar.register_jobs_and_triggers()
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap().unwrap();
    }

    assert_eq!(engine.store().triggers_for_job(&job.key).unwrap().len(), 1);
    assert_eq!(engine.store().job_keys().unwrap().len(), 1);
}

#[test]
fn test_concurrent_transactional_registration_both_succeed() {
    let (_dir, source, store) = sqlite();
    let engine = engine_over(store);
    let job = report_job();
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let engine = as_engine(&engine);
            let manager = Arc::new(DataSourceTransactionManager::new(Arc::clone(&source)));
            let job = job.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let registrar = JobRegistrar::new(engine)
                    .with_transaction_manager(manager)
                    .job(job.clone())
                    .trigger(hourly(&job));
                barrier.wait();
                registrar.register_jobs_and_triggers()
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap().unwrap();
    }

    assert_eq!(engine.store().triggers_for_job(&job.key).unwrap().len(), 1);
}

#[test]
fn test_failed_batch_rolls_back_everything() {
    let (_dir, source, store) = sqlite();
    let engine = engine_over(store);
    let manager = Arc::new(DataSourceTransactionManager::new(Arc::clone(&source)));
    let dangling = TriggerDefinition::new(
        TriggerKey::in_default_group("dangling"),
        JobKey::in_default_group("neverDeclared"),
        TriggerSchedule::once(clock::now()),
    );

    let err = JobRegistrar::new(as_engine(&engine))
        .with_transaction_manager(manager)
        .calendar(Calendar::new("holidays"))
        .job(report_job())
        .trigger(dangling)
        .register_jobs_and_triggers()
        .unwrap_err();

    assert!(matches!(err, RegistrationError::Failed(EngineError::JobNotFound(_))));
    assert!(engine.store().job_keys().unwrap().is_empty());
    assert!(engine.store().retrieve_calendar("holidays").unwrap().is_none());
}

#[test]
fn test_without_transaction_earlier_writes_stay() {
    let engine = engine_over(Arc::new(RamJobStore::new()));
    let dangling = TriggerDefinition::new(
        TriggerKey::in_default_group("dangling"),
        JobKey::in_default_group("neverDeclared"),
        TriggerSchedule::once(clock::now()),
    );
    let err = JobRegistrar::new(as_engine(&engine))
        .job(report_job())
        .trigger(dangling)
        .register_jobs_and_triggers()
        .unwrap_err();
    assert!(matches!(err, RegistrationError::Failed(_)));
    assert_eq!(engine.store().job_keys().unwrap().len(), 1);
}

#[test]
fn test_listeners_registered_last_and_replaced_by_name() {
    let engine = engine_over(Arc::new(RamJobStore::new()));
    let report = JobRegistrar::new(as_engine(&engine))
        .job_listener(Arc::new(Named("audit")))
        .job_listener(Arc::new(Named("audit")))
        .register_jobs_and_triggers()
        .unwrap();
    assert_eq!(report.listeners, 2);
    assert_eq!(engine.listener_manager().job_listener_names(), ["audit"]);
}
