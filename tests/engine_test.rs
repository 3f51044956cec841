//! Integration tests for the persistent scheduler engine over SQLite

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use prometheus_scheduling::config::{PoolConfig, SchedulerPoolConfig};
use prometheus_scheduling::core::{TaskExecutor, ThreadPoolTaskExecutor};
use prometheus_scheduling::infra::datasource::DataSource;
use prometheus_scheduling::infra::{ConnectionBridge, SqliteDataSource, SqliteJobStore};
use prometheus_scheduling::jobs::{
    Calendar, EngineError, EngineSettings, JobDataBinding, JobDefinition, JobExecutionContext, JobListener,
    JobRegistry, PersistentScheduler, SchedulerEngine, StoredTrigger, TriggerDefinition, TriggerKey, TriggerSchedule,
    TriggerState,
};
use prometheus_scheduling::scheduling::ThreadPoolTaskScheduler;
use prometheus_scheduling::util::clock;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    _dir: tempfile::TempDir,
    db: PathBuf,
    engine: PersistentScheduler,
    executor: Arc<ThreadPoolTaskExecutor>,
}

impl Harness {
    fn new(registry: JobRegistry) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("engine.db");
        let executor = Arc::new(ThreadPoolTaskExecutor::new("jobs", PoolConfig::new().with_core_pool_size(2)));
        executor.initialize().unwrap();
        let engine = open_engine(&db, &executor, registry);
        Self {
            _dir: dir,
            db,
            engine,
            executor,
        }
    }

    /// A second engine over the same database, as after a restart.
    fn restarted(&self) -> PersistentScheduler {
        open_engine(&self.db, &self.executor, JobRegistry::new())
    }
}

fn open_engine(db: &Path, executor: &Arc<ThreadPoolTaskExecutor>, registry: JobRegistry) -> PersistentScheduler {
    let source: Arc<dyn DataSource> = Arc::new(SqliteDataSource::new(db));
    let store = Arc::new(SqliteJobStore::new(&ConnectionBridge::new(source, None)));
    let settings = EngineSettings::new(
        "engine",
        store,
        Arc::clone(executor) as Arc<dyn TaskExecutor>,
        Arc::new(registry),
    )
    .with_idle_wait(Duration::from_millis(20));
    PersistentScheduler::new(settings).unwrap()
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.engine.shutdown(true, Duration::from_secs(5));
        self.executor.shutdown();
    }
}

fn signalling(tx: Sender<JobExecutionContext>) -> JobRegistry {
    let registry = JobRegistry::new();
    registry.register_fn("signal", move |ctx: &JobExecutionContext| {
        let _ = tx.send(ctx.clone());
        Ok(())
    });
    registry
}

/// Now, at the millisecond precision the store keeps.
fn now_ms() -> DateTime<Utc> {
    clock::from_epoch_ms(clock::to_epoch_ms(clock::now())).unwrap()
}

fn key(name: &str) -> TriggerKey {
    TriggerKey::in_default_group(name)
}

#[derive(Debug, Deserialize)]
struct ReportParams {
    model: String,
    #[serde(default)]
    max_tokens: u32,
}

#[test]
fn test_fire_cycle_merges_data_and_advances_trigger() {
    let (tx, rx) = bounded(4);
    let harness = Harness::new(signalling(tx));
    let engine = &harness.engine;
    let start = now_ms();
    let job = JobDefinition::builder("signal")
        .data("model", "llama-3-8b")
        .data("max_tokens", 128)
        .build("warmup");
    let trigger = TriggerDefinition::for_job(
        key("hourly"),
        job.clone(),
        TriggerSchedule::every(start, Duration::from_secs(3600)),
    )
    .with_data("max_tokens", 512);
    assert_eq!(engine.schedule_job(job, trigger).unwrap(), start);

    assert_eq!(engine.fire_due_triggers(clock::now()).unwrap(), 1);
    let ctx = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let params: ReportParams = ctx
        .bind(&JobDataBinding::allowing(["model", "max_tokens"]))
        .unwrap();
    assert_eq!(params.model, "llama-3-8b");
    assert_eq!(params.max_tokens, 512);
    assert_eq!(ctx.scheduled_fire_time, start);
    assert!(engine.await_jobs(Duration::from_secs(5)));

    let stored = engine.trigger(&key("hourly")).unwrap().unwrap();
    assert_eq!(stored.times_triggered, 1);
    assert_eq!(stored.previous_fire_time, Some(start));
    assert_eq!(
        stored.next_fire_time,
        Some(clock::add_duration(start, Duration::from_secs(3600)))
    );
    assert_eq!(engine.fire_due_triggers(clock::now()).unwrap(), 0);
}

#[test]
fn test_strict_binding_rejects_unknown_keys() {
    let (tx, rx) = bounded(1);
    let harness = Harness::new(signalling(tx));
    let job = JobDefinition::builder("signal")
        .data("model", "phi-3")
        .data("shell", "rm -rf /")
        .build("strict");
    harness
        .engine
        .schedule_job(job.clone(), TriggerDefinition::for_job(key("now"), job, TriggerSchedule::once(clock::now())))
        .unwrap();
    harness.engine.fire_due_triggers(clock::now()).unwrap();

    let ctx = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let lenient: ReportParams = ctx.bind(&JobDataBinding::allowing(["model"])).unwrap();
    assert_eq!((lenient.model.as_str(), lenient.max_tokens), ("phi-3", 0));
    let strict = ctx.bind::<ReportParams>(&JobDataBinding::allowing(["model"]).strict(true));
    assert!(matches!(strict, Err(EngineError::DataBinding(_))));
}

#[test]
fn test_one_shot_trigger_and_job_removed_after_run() {
    let (tx, rx) = bounded(1);
    let harness = Harness::new(signalling(tx));
    let engine = &harness.engine;
    let job = JobDefinition::builder("signal").build("once");
    engine
        .schedule_job(job.clone(), TriggerDefinition::for_job(key("once"), job.clone(), TriggerSchedule::once(clock::now())))
        .unwrap();
    engine.fire_due_triggers(clock::now()).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(engine.await_jobs(Duration::from_secs(5)));

    assert!(engine.trigger(&key("once")).unwrap().is_none());
    assert!(engine.job_definition(&job.key).unwrap().is_none());
}

#[test]
fn test_durable_job_outlives_its_triggers() {
    let (tx, rx) = bounded(1);
    let harness = Harness::new(signalling(tx));
    let engine = &harness.engine;
    let job = JobDefinition::builder("signal").durable(true).build("kept");
    engine.add_job(job.clone(), false).unwrap();
    engine
        .schedule_trigger(TriggerDefinition::new(key("once"), job.key.clone(), TriggerSchedule::once(clock::now())))
        .unwrap();
    engine.fire_due_triggers(clock::now()).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(engine.await_jobs(Duration::from_secs(5)));

    assert!(engine.trigger(&key("once")).unwrap().is_none());
    assert!(engine.job_definition(&job.key).unwrap().is_some());
}

#[test]
fn test_calendar_skips_excluded_dates() {
    let harness = Harness::new(JobRegistry::new());
    let engine = &harness.engine;
    let start: DateTime<Utc> = clock::add_duration(clock::now(), Duration::from_secs(60));
    engine
        .add_calendar(Calendar::new("maintenance").exclude_date(start.date_naive()), false)
        .unwrap();
    let job = JobDefinition::builder("signal").build("daily");
    let first = engine
        .schedule_job(
            job.clone(),
            TriggerDefinition::for_job(key("daily"), job, TriggerSchedule::every(start, Duration::from_secs(86_400)))
                .with_calendar("maintenance"),
        )
        .unwrap();
    assert_eq!(first, clock::add_duration(start, Duration::from_secs(86_400)));
}

#[test]
fn test_unknown_calendar_is_refused() {
    let harness = Harness::new(JobRegistry::new());
    let job = JobDefinition::builder("signal").build("orphan");
    let trigger = TriggerDefinition::for_job(key("t"), job.clone(), TriggerSchedule::once(clock::now()))
        .with_calendar("missing");
    assert!(matches!(
        harness.engine.schedule_job(job, trigger),
        Err(EngineError::CalendarNotFound(name)) if name == "missing"
    ));
}

#[test]
fn test_unknown_job_type_still_completes_trigger() {
    let harness = Harness::new(JobRegistry::new());
    let engine = &harness.engine;
    let job = JobDefinition::builder("unregistered").build("ghost");
    engine
        .schedule_job(job.clone(), TriggerDefinition::for_job(key("ghost"), job, TriggerSchedule::once(clock::now())))
        .unwrap();
    assert_eq!(engine.fire_due_triggers(clock::now()).unwrap(), 0);
    assert!(engine.await_jobs(Duration::from_secs(1)));
    assert!(engine.trigger(&key("ghost")).unwrap().is_none());
}

#[test]
fn test_repeating_trigger_survives_long_downtime() {
    let (tx, rx) = bounded(4);
    let harness = Harness::new(signalling(tx));
    let engine = &harness.engine;
    let start = clock::from_epoch_ms(clock::to_epoch_ms(now_ms()) - 3 * 3_600_000).unwrap();
    let job = JobDefinition::builder("signal").build("heartbeat");
    engine
        .schedule_job(
            job.clone(),
            TriggerDefinition::for_job(key("heartbeat"), job, TriggerSchedule::every(start, Duration::from_secs(1))),
        )
        .unwrap();

    let now = now_ms();
    assert_eq!(engine.fire_due_triggers(now).unwrap(), 1);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().scheduled_fire_time, start);
    assert!(engine.await_jobs(Duration::from_secs(5)));

    let stored = engine.trigger(&key("heartbeat")).unwrap().unwrap();
    assert_eq!(stored.state, TriggerState::Waiting);
    let next = stored.next_fire_time.unwrap();
    assert!(next >= now && next <= clock::add_duration(now, Duration::from_secs(1)));
}

#[test]
fn test_unadvanceable_trigger_is_parked_in_error() {
    let (tx, rx) = bounded(1);
    let harness = Harness::new(signalling(tx));
    let engine = &harness.engine;
    let job = JobDefinition::builder("signal").build("broken");
    engine.add_job(job.clone(), false).unwrap();
    let mut trigger = StoredTrigger::new(
        TriggerDefinition::new(key("broken"), job.key, TriggerSchedule::every(now_ms(), Duration::from_secs(60))),
        None,
        clock::now(),
    )
    .unwrap();
    trigger.definition.schedule = TriggerSchedule::cron("not a cron");
    engine.store().store_trigger(&trigger, false).unwrap();

    assert_eq!(engine.fire_due_triggers(clock::now()).unwrap(), 0);
    assert_eq!(engine.trigger(&key("broken")).unwrap().unwrap().state, TriggerState::Error);
    assert_eq!(engine.fire_due_triggers(clock::now()).unwrap(), 0);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_refused_run_still_finalizes_one_shot() {
    let (tx, rx) = bounded(1);
    let harness = Harness::new(signalling(tx));
    let engine = &harness.engine;
    let job = JobDefinition::builder("signal").build("refused");
    engine
        .schedule_job(job.clone(), TriggerDefinition::for_job(key("refused"), job.clone(), TriggerSchedule::once(clock::now())))
        .unwrap();
    harness.executor.shutdown();

    assert_eq!(engine.fire_due_triggers(clock::now()).unwrap(), 0);
    assert_eq!(engine.running_jobs(), 0);
    assert!(rx.try_recv().is_err());
    assert!(engine.trigger(&key("refused")).unwrap().is_none());
    assert!(engine.job_definition(&job.key).unwrap().is_none());
}

#[test]
fn test_corrupt_job_does_not_strand_the_batch() {
    let (tx, rx) = bounded(2);
    let harness = Harness::new(signalling(tx));
    let engine = &harness.engine;
    for (name, priority) in [("corrupt", 10), ("healthy", 1)] {
        let job = JobDefinition::builder("signal").build(name);
        engine
            .schedule_job(
                job.clone(),
                TriggerDefinition::for_job(key(name), job, TriggerSchedule::once(now_ms())).with_priority(priority),
            )
            .unwrap();
    }
    rusqlite::Connection::open(&harness.db)
        .unwrap()
        .execute("UPDATE sched_job_details SET definition = '{' WHERE job_name = 'corrupt'", [])
        .unwrap();

    assert_eq!(engine.fire_due_triggers(clock::now()).unwrap(), 1);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().trigger_key, key("healthy"));
    assert!(engine.await_jobs(Duration::from_secs(5)));
    assert_eq!(engine.trigger(&key("corrupt")).unwrap().unwrap().state, TriggerState::Waiting);
}

#[test]
fn test_restart_releases_claimed_triggers() {
    let harness = Harness::new(JobRegistry::new());
    let job = JobDefinition::builder("signal").build("claimed");
    harness
        .engine
        .schedule_job(job.clone(), TriggerDefinition::for_job(key("claimed"), job, TriggerSchedule::once(now_ms())))
        .unwrap();
    assert_eq!(harness.engine.store().acquire_next_triggers(clock::now(), 5).unwrap().len(), 1);
    assert_eq!(harness.engine.trigger(&key("claimed")).unwrap().unwrap().state, TriggerState::Acquired);

    let restarted = harness.restarted();
    assert_eq!(restarted.trigger(&key("claimed")).unwrap().unwrap().state, TriggerState::Waiting);
    assert!(restarted.shutdown(true, Duration::from_secs(1)));
}

#[derive(Default)]
struct Recording {
    events: Mutex<Vec<String>>,
}

impl JobListener for Recording {
    fn name(&self) -> &str {
        "recording"
    }

    fn job_to_be_executed(&self, context: &JobExecutionContext) {
        self.events.lock().push(format!("start {}", context.job.key));
    }

    fn job_was_executed(&self, context: &JobExecutionContext, error: Option<&str>) {
        self.events
            .lock()
            .push(format!("end {} {}", context.job.key, error.unwrap_or("ok")));
    }
}

#[test]
fn test_job_listeners_see_failures() {
    let registry = JobRegistry::new();
    registry.register_fn("broken", |_: &JobExecutionContext| Err(anyhow::anyhow!("model not loaded")));
    let harness = Harness::new(registry);
    let engine = &harness.engine;
    let listener = Arc::new(Recording::default());
    engine.listener_manager().add_job_listener(Arc::clone(&listener) as Arc<dyn JobListener>);

    let job = JobDefinition::builder("broken").build("inference");
    engine
        .schedule_job(job.clone(), TriggerDefinition::for_job(key("t"), job, TriggerSchedule::once(clock::now())))
        .unwrap();
    assert_eq!(engine.fire_due_triggers(clock::now()).unwrap(), 1);
    assert!(engine.await_jobs(Duration::from_secs(5)));

    let events = listener.events.lock().clone();
    assert_eq!(
        events,
        vec![
            "start DEFAULT.inference".to_owned(),
            "end DEFAULT.inference model not loaded".to_owned(),
        ]
    );
}

#[test]
fn test_started_engine_fires_on_its_own() {
    let (tx, rx) = bounded(1);
    let harness = Harness::new(signalling(tx));
    let scheduler = ThreadPoolTaskScheduler::new("engine-passes", SchedulerPoolConfig::new());
    scheduler.initialize().unwrap();
    harness.engine.start(&scheduler).unwrap();
    assert!(harness.engine.is_started());

    let job = JobDefinition::builder("signal").build("background");
    harness
        .engine
        .schedule_job(
            job.clone(),
            TriggerDefinition::for_job(
                key("soon"),
                job,
                TriggerSchedule::once(clock::add_duration(clock::now(), Duration::from_millis(50))),
            ),
        )
        .unwrap();
    let ctx = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(ctx.trigger_key, key("soon"));

    assert!(harness.engine.shutdown(true, Duration::from_secs(5)));
    scheduler.shutdown();
}
