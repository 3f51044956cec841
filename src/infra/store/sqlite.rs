//! SQLite job store over the transactional connection bridge.
//!
//! Registration writes go through the transactional provider, so they join a
//! unit of work the caller has open on the same data source. The engine's
//! firing pass goes through the non-transactional provider.

use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::infra::datasource::{ConnectionBridge, ConnectionProvider};
use crate::jobs::error::EngineError;
use crate::jobs::model::{Calendar, JobDefinition, JobKey, StoredTrigger, TriggerKey, TriggerState};
use crate::jobs::store::{JobStore, TriggerFiredBundle};
use crate::util::clock;

/// Default prefix of the store's tables.
pub const DEFAULT_TABLE_PREFIX: &str = "sched_";

/// How the firing pass serializes against other firing passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    /// An in-process semaphore; the database is only used for atomic updates.
    InProcess,
    /// A `BEGIN IMMEDIATE` write lock taken in the database.
    Database,
}

struct Tables {
    jobs: String,
    triggers: String,
    calendars: String,
}

impl Tables {
    fn new(prefix: &str) -> Self {
        Self {
            jobs: format!("{prefix}job_details"),
            triggers: format!("{prefix}triggers"),
            calendars: format!("{prefix}calendars"),
        }
    }
}

struct TriggerRow {
    definition: String,
    next_fire_time: Option<i64>,
    previous_fire_time: Option<i64>,
    times_triggered: i64,
    state: String,
}

impl TriggerRow {
    const COLUMNS: &'static str = "definition, next_fire_time, previous_fire_time, times_triggered, state";

    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            definition: row.get(0)?,
            next_fire_time: row.get(1)?,
            previous_fire_time: row.get(2)?,
            times_triggered: row.get(3)?,
            state: row.get(4)?,
        })
    }

    fn into_stored(self) -> Result<StoredTrigger, EngineError> {
        Ok(StoredTrigger {
            definition: serde_json::from_str(&self.definition)?,
            next_fire_time: self.next_fire_time.and_then(clock::from_epoch_ms),
            previous_fire_time: self.previous_fire_time.and_then(clock::from_epoch_ms),
            times_triggered: u32::try_from(self.times_triggered).unwrap_or(u32::MAX),
            state: self.state.parse().map_err(EngineError::Store)?,
        })
    }
}

fn is_primary_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn savepoint<R>(conn: &Connection, op: impl FnOnce(&Connection) -> Result<R, EngineError>) -> Result<R, EngineError> {
    // Outside a unit of work, take the write lock before the first read.
    let (open, commit, undo) = if conn.is_autocommit() {
        ("BEGIN IMMEDIATE", "COMMIT", "ROLLBACK")
    } else {
        ("SAVEPOINT job_store", "RELEASE job_store", "ROLLBACK TO job_store; RELEASE job_store")
    };
    conn.execute_batch(open)?;
    match op(conn) {
        Ok(value) => {
            conn.execute_batch(commit)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = conn.execute_batch(undo) {
                warn!(error = %rollback, "Rolling back job store write failed");
            }
            Err(err)
        }
    }
}

/// Job store persisted in SQLite tables.
///
/// Call [`JobStore::initialize`] once before use; it creates the tables and
/// picks the [`LockStrategy`].
pub struct SqliteJobStore {
    transactional: Arc<dyn ConnectionProvider>,
    non_transactional: Arc<dyn ConnectionProvider>,
    prefix: String,
    tables: Tables,
    lock_strategy: OnceLock<LockStrategy>,
    forced_strategy: Option<LockStrategy>,
    firing_lock: Mutex<()>,
}

impl fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteJobStore")
            .field("prefix", &self.prefix)
            .field("lock_strategy", &self.lock_strategy.get())
            .finish_non_exhaustive()
    }
}

impl SqliteJobStore {
    /// Store over both providers of `bridge`, with [`DEFAULT_TABLE_PREFIX`].
    #[must_use]
    pub fn new(bridge: &ConnectionBridge) -> Self {
        Self {
            transactional: bridge.transactional(),
            non_transactional: bridge.non_transactional(),
            prefix: DEFAULT_TABLE_PREFIX.to_owned(),
            tables: Tables::new(DEFAULT_TABLE_PREFIX),
            lock_strategy: OnceLock::new(),
            forced_strategy: None,
            firing_lock: Mutex::new(()),
        }
    }

    /// Use tables named `{prefix}job_details` and so on.
    ///
    /// The prefix may only contain ASCII letters, digits and underscores.
    #[must_use]
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self.tables = Tables::new(&self.prefix);
        self
    }

    /// Skip the capability probe and use `strategy`.
    #[must_use]
    pub const fn with_lock_strategy(mut self, strategy: LockStrategy) -> Self {
        self.forced_strategy = Some(strategy);
        self
    }

    /// Strategy picked at initialization.
    #[must_use]
    pub fn lock_strategy(&self) -> Option<LockStrategy> {
        self.lock_strategy.get().copied()
    }

    fn probe(conn: &Connection) -> Result<LockStrategy, EngineError> {
        let version: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
        // No row locks in SQLite; firing passes serialize in process.
        debug!(sqlite_version = %version, "Probed job store backend");
        Ok(LockStrategy::InProcess)
    }

    fn on_transactional<R>(&self, op: impl FnOnce(&Connection) -> Result<R, EngineError>) -> Result<R, EngineError> {
        let provided = self.transactional.acquire()?;
        let result = savepoint(&provided.lock(), op);
        self.transactional.release(provided);
        result
    }

    fn on_firing<R>(&self, op: impl FnOnce(&Connection) -> Result<R, EngineError>) -> Result<R, EngineError> {
        let strategy = self
            .lock_strategy()
            .ok_or_else(|| EngineError::Store("job store used before initialize".into()))?;
        let provided = self.non_transactional.acquire()?;
        let result = match strategy {
            LockStrategy::InProcess => {
                let _guard = self.firing_lock.lock();
                savepoint(&provided.lock(), op)
            }
            LockStrategy::Database => savepoint(&provided.lock(), op),
        };
        self.non_transactional.release(provided);
        result
    }

    fn job_exists(&self, conn: &Connection, key: &JobKey) -> Result<bool, EngineError> {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE job_group = ?1 AND job_name = ?2", self.tables.jobs),
            params![key.group(), key.name()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn read_job(&self, conn: &Connection, key: &JobKey) -> Result<Option<JobDefinition>, EngineError> {
        let raw: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT definition FROM {} WHERE job_group = ?1 AND job_name = ?2",
                    self.tables.jobs
                ),
                params![key.group(), key.name()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|json| serde_json::from_str(&json).map_err(EngineError::from)).transpose()
    }

    fn read_trigger(&self, conn: &Connection, key: &TriggerKey) -> Result<Option<StoredTrigger>, EngineError> {
        conn.query_row(
            &format!(
                "SELECT {} FROM {} WHERE trigger_group = ?1 AND trigger_name = ?2",
                TriggerRow::COLUMNS,
                self.tables.triggers
            ),
            params![key.group(), key.name()],
            TriggerRow::read,
        )
        .optional()?
        .map(TriggerRow::into_stored)
        .transpose()
    }

    fn read_calendar(&self, conn: &Connection, name: &str) -> Result<Option<Calendar>, EngineError> {
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT definition FROM {} WHERE name = ?1", self.tables.calendars),
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|json| serde_json::from_str(&json).map_err(EngineError::from)).transpose()
    }

    fn write_trigger(&self, conn: &Connection, trigger: &StoredTrigger, replace: bool) -> Result<(), EngineError> {
        let key = trigger.key();
        let job = trigger.job_key();
        let mut sql = format!(
            "INSERT INTO {} (trigger_group, trigger_name, job_group, job_name, definition,
                next_fire_time, previous_fire_time, times_triggered, state, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            self.tables.triggers
        );
        if replace {
            sql.push_str(
                " ON CONFLICT (trigger_group, trigger_name) DO UPDATE SET
                    job_group = excluded.job_group, job_name = excluded.job_name,
                    definition = excluded.definition, next_fire_time = excluded.next_fire_time,
                    previous_fire_time = excluded.previous_fire_time,
                    times_triggered = excluded.times_triggered, state = excluded.state,
                    priority = excluded.priority",
            );
        }
        let result = conn.execute(
            &sql,
            params![
                key.group(),
                key.name(),
                job.group(),
                job.name(),
                serde_json::to_string(&trigger.definition)?,
                trigger.next_fire_time.map(clock::to_epoch_ms),
                trigger.previous_fire_time.map(clock::to_epoch_ms),
                trigger.times_triggered,
                trigger.state.to_string(),
                trigger.definition.priority,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_primary_key_violation(&err) => Err(EngineError::already_exists("trigger", key)),
            Err(err) => Err(err.into()),
        }
    }

    fn set_state(&self, conn: &Connection, key: &TriggerKey, state: TriggerState) -> Result<(), EngineError> {
        conn.execute(
            &format!(
                "UPDATE {} SET state = ?1 WHERE trigger_group = ?2 AND trigger_name = ?3",
                self.tables.triggers
            ),
            params![state.to_string(), key.group(), key.name()],
        )?;
        Ok(())
    }

    fn delete_trigger(&self, conn: &Connection, key: &TriggerKey) -> Result<bool, EngineError> {
        let removed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE trigger_group = ?1 AND trigger_name = ?2",
                self.tables.triggers
            ),
            params![key.group(), key.name()],
        )?;
        Ok(removed > 0)
    }

    fn drop_orphaned_job(&self, conn: &Connection, job: &JobKey) -> Result<(), EngineError> {
        conn.execute(
            &format!(
                "DELETE FROM {jobs} WHERE job_group = ?1 AND job_name = ?2 AND durable = 0
                   AND NOT EXISTS (SELECT 1 FROM {triggers} WHERE job_group = ?1 AND job_name = ?2)",
                jobs = self.tables.jobs,
                triggers = self.tables.triggers
            ),
            params![job.group(), job.name()],
        )?;
        Ok(())
    }
}

impl JobStore for SqliteJobStore {
    fn initialize(&self) -> Result<(), EngineError> {
        if !self.prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(EngineError::Store(format!("invalid table prefix `{}`", self.prefix)));
        }
        let strategy = self.on_transactional(|conn| {
            conn.execute_batch(&format!(
                "
                CREATE TABLE IF NOT EXISTS {calendars} (
                    name        TEXT    NOT NULL PRIMARY KEY,
                    definition  TEXT    NOT NULL    -- JSON-encoded Calendar
                );

                CREATE TABLE IF NOT EXISTS {jobs} (
                    job_group   TEXT    NOT NULL,
                    job_name    TEXT    NOT NULL,
                    job_type    TEXT    NOT NULL,
                    durable     INTEGER NOT NULL DEFAULT 0,
                    definition  TEXT    NOT NULL,   -- JSON-encoded JobDefinition
                    PRIMARY KEY (job_group, job_name)
                );

                CREATE TABLE IF NOT EXISTS {triggers} (
                    trigger_group       TEXT    NOT NULL,
                    trigger_name        TEXT    NOT NULL,
                    job_group           TEXT    NOT NULL,
                    job_name            TEXT    NOT NULL,
                    definition          TEXT    NOT NULL,   -- JSON-encoded TriggerDefinition
                    next_fire_time      INTEGER,            -- epoch ms or NULL
                    previous_fire_time  INTEGER,            -- epoch ms or NULL
                    times_triggered     INTEGER NOT NULL DEFAULT 0,
                    state               TEXT    NOT NULL,
                    priority            INTEGER NOT NULL DEFAULT 5,
                    PRIMARY KEY (trigger_group, trigger_name),
                    FOREIGN KEY (job_group, job_name) REFERENCES {jobs} (job_group, job_name) ON DELETE CASCADE
                );

                CREATE INDEX IF NOT EXISTS idx_{triggers}_next_fire ON {triggers} (state, next_fire_time);
                ",
                calendars = self.tables.calendars,
                jobs = self.tables.jobs,
                triggers = self.tables.triggers,
            ))?;
            match self.forced_strategy {
                Some(strategy) => Ok(strategy),
                None => Self::probe(conn),
            }
        })?;
        let strategy = *self.lock_strategy.get_or_init(|| strategy);
        info!(prefix = %self.prefix, lock_strategy = ?strategy, "Initialized SQLite job store");
        Ok(())
    }

    fn store_job(&self, job: &JobDefinition, replace: bool) -> Result<(), EngineError> {
        self.on_transactional(|conn| {
            let mut sql = format!(
                "INSERT INTO {} (job_group, job_name, job_type, durable, definition) VALUES (?1, ?2, ?3, ?4, ?5)",
                self.tables.jobs
            );
            if replace {
                sql.push_str(
                    " ON CONFLICT (job_group, job_name) DO UPDATE SET
                        job_type = excluded.job_type, durable = excluded.durable, definition = excluded.definition",
                );
            }
            let result = conn.execute(
                &sql,
                params![
                    job.key.group(),
                    job.key.name(),
                    job.job_type,
                    job.durable,
                    serde_json::to_string(job)?
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(err) if is_primary_key_violation(&err) => Err(EngineError::already_exists("job", &job.key)),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDefinition>, EngineError> {
        self.on_transactional(|conn| self.read_job(conn, key))
    }

    fn remove_job(&self, key: &JobKey) -> Result<bool, EngineError> {
        self.on_transactional(|conn| {
            let removed = conn.execute(
                &format!("DELETE FROM {} WHERE job_group = ?1 AND job_name = ?2", self.tables.jobs),
                params![key.group(), key.name()],
            )?;
            Ok(removed > 0)
        })
    }

    fn job_keys(&self) -> Result<Vec<JobKey>, EngineError> {
        self.on_transactional(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT job_name, job_group FROM {} ORDER BY job_group, job_name",
                self.tables.jobs
            ))?;
            let keys = stmt
                .query_map([], |row| Ok(JobKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
    }

    fn store_trigger(&self, trigger: &StoredTrigger, replace: bool) -> Result<(), EngineError> {
        self.on_transactional(|conn| {
            if !self.job_exists(conn, trigger.job_key())? {
                return Err(EngineError::JobNotFound(trigger.job_key().to_string()));
            }
            self.write_trigger(conn, trigger, replace)
        })
    }

    fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<StoredTrigger>, EngineError> {
        self.on_transactional(|conn| self.read_trigger(conn, key))
    }

    fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, EngineError> {
        self.on_transactional(|conn| {
            let Some(existing) = self.read_trigger(conn, key)? else {
                return Ok(false);
            };
            self.delete_trigger(conn, key)?;
            self.drop_orphaned_job(conn, existing.job_key())?;
            Ok(true)
        })
    }

    fn replace_trigger(&self, key: &TriggerKey, trigger: &StoredTrigger) -> Result<bool, EngineError> {
        self.on_transactional(|conn| {
            if !self.job_exists(conn, trigger.job_key())? {
                return Err(EngineError::JobNotFound(trigger.job_key().to_string()));
            }
            let Some(old) = self.read_trigger(conn, key)? else {
                return Ok(false);
            };
            self.delete_trigger(conn, key)?;
            self.write_trigger(conn, trigger, true)?;
            if old.job_key() != trigger.job_key() {
                self.drop_orphaned_job(conn, old.job_key())?;
            }
            Ok(true)
        })
    }

    fn triggers_for_job(&self, job: &JobKey) -> Result<Vec<StoredTrigger>, EngineError> {
        self.on_transactional(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM {} WHERE job_group = ?1 AND job_name = ?2 ORDER BY trigger_group, trigger_name",
                TriggerRow::COLUMNS,
                self.tables.triggers
            ))?;
            let rows = stmt
                .query_map(params![job.group(), job.name()], TriggerRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(TriggerRow::into_stored).collect()
        })
    }

    fn store_calendar(&self, calendar: &Calendar, replace: bool) -> Result<(), EngineError> {
        self.on_transactional(|conn| {
            let mut sql = format!("INSERT INTO {} (name, definition) VALUES (?1, ?2)", self.tables.calendars);
            if replace {
                sql.push_str(" ON CONFLICT (name) DO UPDATE SET definition = excluded.definition");
            }
            match conn.execute(&sql, params![calendar.name, serde_json::to_string(calendar)?]) {
                Ok(_) => Ok(()),
                Err(err) if is_primary_key_violation(&err) => {
                    Err(EngineError::already_exists("calendar", &calendar.name))
                }
                Err(err) => Err(err.into()),
            }
        })
    }

    fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>, EngineError> {
        self.on_transactional(|conn| self.read_calendar(conn, name))
    }

    fn remove_calendar(&self, name: &str) -> Result<bool, EngineError> {
        self.on_transactional(|conn| {
            let removed = conn.execute(
                &format!("DELETE FROM {} WHERE name = ?1", self.tables.calendars),
                params![name],
            )?;
            Ok(removed > 0)
        })
    }

    fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<StoredTrigger>, EngineError> {
        self.on_firing(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM {} WHERE state = ?1 AND next_fire_time IS NOT NULL AND next_fire_time <= ?2
                 ORDER BY next_fire_time ASC, priority DESC LIMIT ?3",
                TriggerRow::COLUMNS,
                self.tables.triggers
            ))?;
            let rows = stmt
                .query_map(
                    params![
                        TriggerState::Waiting.to_string(),
                        clock::to_epoch_ms(no_later_than),
                        i64::try_from(max).unwrap_or(i64::MAX)
                    ],
                    TriggerRow::read,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            let mut acquired = Vec::with_capacity(rows.len());
            for row in rows {
                let mut trigger = row.into_stored()?;
                self.set_state(conn, trigger.key(), TriggerState::Acquired)?;
                trigger.state = TriggerState::Acquired;
                acquired.push(trigger);
            }
            Ok(acquired)
        })
    }

    fn release_acquired_trigger(&self, key: &TriggerKey) -> Result<(), EngineError> {
        self.on_firing(|conn| {
            conn.execute(
                &format!(
                    "UPDATE {} SET state = ?1 WHERE trigger_group = ?2 AND trigger_name = ?3 AND state = ?4",
                    self.tables.triggers
                ),
                params![
                    TriggerState::Waiting.to_string(),
                    key.group(),
                    key.name(),
                    TriggerState::Acquired.to_string()
                ],
            )?;
            Ok(())
        })
    }

    fn recover_acquired_triggers(&self) -> Result<usize, EngineError> {
        self.on_firing(|conn| {
            let released = conn.execute(
                &format!("UPDATE {} SET state = ?1 WHERE state = ?2", self.tables.triggers),
                params![TriggerState::Waiting.to_string(), TriggerState::Acquired.to_string()],
            )?;
            Ok(released)
        })
    }

    fn triggered(&self, key: &TriggerKey, now: DateTime<Utc>) -> Result<Option<TriggerFiredBundle>, EngineError> {
        // The inner error leaves the `Error` state committed.
        self.on_firing(|conn| {
            let Some(mut trigger) = self.read_trigger(conn, key)? else {
                return Ok(Ok(None));
            };
            if trigger.state != TriggerState::Acquired {
                return Ok(Ok(None));
            }
            let Some(job) = self.read_job(conn, trigger.job_key())? else {
                self.set_state(conn, key, TriggerState::Error)?;
                return Ok(Err(EngineError::JobNotFound(trigger.job_key().to_string())));
            };
            let calendar = match &trigger.definition.calendar {
                Some(name) => self.read_calendar(conn, name)?,
                None => None,
            };
            let scheduled_fire_time = trigger.next_fire_time.unwrap_or(now);
            let previous_fire_time = trigger.previous_fire_time;
            if let Err(err) = trigger.advance(now, calendar.as_ref()) {
                self.set_state(conn, key, TriggerState::Error)?;
                return Ok(Err(err));
            }
            self.write_trigger(conn, &trigger, true)?;
            Ok(Ok(Some(TriggerFiredBundle {
                job,
                trigger,
                scheduled_fire_time,
                fire_time: now,
                previous_fire_time,
            })))
        })?
    }

    fn triggered_job_complete(&self, trigger: &TriggerKey, job: &JobKey) -> Result<(), EngineError> {
        self.on_firing(|conn| {
            let removed = conn.execute(
                &format!(
                    "DELETE FROM {} WHERE trigger_group = ?1 AND trigger_name = ?2 AND state = ?3",
                    self.tables.triggers
                ),
                params![trigger.group(), trigger.name(), TriggerState::Complete.to_string()],
            )?;
            if removed > 0 {
                self.drop_orphaned_job(conn, job)?;
            }
            Ok(())
        })
    }

    fn clear(&self) -> Result<(), EngineError> {
        self.on_transactional(|conn| {
            conn.execute_batch(&format!(
                "DELETE FROM {}; DELETE FROM {}; DELETE FROM {};",
                self.tables.triggers, self.tables.jobs, self.tables.calendars
            ))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::datasource::{DataSource, SqliteDataSource};
    use crate::jobs::model::{TriggerDefinition, TriggerSchedule};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn store() -> (tempfile::TempDir, SqliteJobStore) {
        let dir = tempfile::tempdir().unwrap();
        let source: Arc<dyn DataSource> = Arc::new(SqliteDataSource::new(dir.path().join("store.db")));
        let store = SqliteJobStore::new(&ConnectionBridge::new(source, None)).with_table_prefix("t_");
        store.initialize().unwrap();
        (dir, store)
    }

    fn trigger(name: &str, job: &str, start: i64) -> StoredTrigger {
        let def = TriggerDefinition::new(
            TriggerKey::in_default_group(name),
            JobKey::in_default_group(job),
            TriggerSchedule::every(at(start), std::time::Duration::from_secs(1)),
        );
        StoredTrigger::new(def, None, at(0)).unwrap()
    }

    #[test]
    fn test_probe_selects_in_process_lock() {
        let (_dir, store) = store();
        assert_eq!(store.lock_strategy(), Some(LockStrategy::InProcess));
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source: Arc<dyn DataSource> = Arc::new(SqliteDataSource::new(dir.path().join("bad.db")));
        let store = SqliteJobStore::new(&ConnectionBridge::new(source, None)).with_table_prefix("x; DROP");
        assert!(matches!(store.initialize(), Err(EngineError::Store(_))));
    }

    #[test]
    fn test_job_round_trip_and_duplicate() {
        let (_dir, store) = store();
        let job = JobDefinition::builder("report").data("to", "ops").build("nightly");
        store.store_job(&job, false).unwrap();
        assert_eq!(store.retrieve_job(&job.key).unwrap(), Some(job.clone()));
        assert!(store.store_job(&job, false).unwrap_err().is_already_exists());
        store.store_job(&job, true).unwrap();
        assert_eq!(store.job_keys().unwrap(), vec![job.key]);
    }

    #[test]
    fn test_trigger_fire_cycle() {
        let (_dir, store) = store();
        store
            .store_job(&JobDefinition::builder("report").build("a"), false)
            .unwrap();
        store.store_trigger(&trigger("t", "a", 1), false).unwrap();
        assert!(store.store_trigger(&trigger("t", "a", 1), false).unwrap_err().is_already_exists());

        let acquired = store.acquire_next_triggers(at(1), 5).unwrap();
        assert_eq!(acquired.len(), 1);
        assert!(store.acquire_next_triggers(at(1), 5).unwrap().is_empty());

        let key = TriggerKey::in_default_group("t");
        let bundle = store.triggered(&key, at(1)).unwrap().unwrap();
        assert_eq!(bundle.scheduled_fire_time, at(1));
        assert_eq!(bundle.trigger.next_fire_time, Some(at(2)));
        let stored = store.retrieve_trigger(&key).unwrap().unwrap();
        assert_eq!(stored.state, TriggerState::Waiting);
        assert_eq!(stored.times_triggered, 1);
    }

    #[test]
    fn test_removing_last_trigger_drops_non_durable_job() {
        let (_dir, store) = store();
        let job = JobDefinition::builder("report").build("a");
        store.store_job(&job, false).unwrap();
        store.store_trigger(&trigger("t", "a", 1), false).unwrap();
        assert!(store.remove_trigger(&TriggerKey::in_default_group("t")).unwrap());
        assert!(store.retrieve_job(&job.key).unwrap().is_none());
    }

    #[test]
    fn test_remove_job_cascades_to_triggers() {
        let (_dir, store) = store();
        let job = JobDefinition::builder("report").durable(true).build("a");
        store.store_job(&job, false).unwrap();
        store.store_trigger(&trigger("t", "a", 1), false).unwrap();
        assert!(store.remove_job(&job.key).unwrap());
        assert!(store.triggers_for_job(&job.key).unwrap().is_empty());
    }

    #[test]
    fn test_unadvanceable_trigger_error_state_is_committed() {
        let (_dir, store) = store();
        store
            .store_job(&JobDefinition::builder("report").build("a"), false)
            .unwrap();
        let mut broken = trigger("t", "a", 1);
        broken.definition.schedule = TriggerSchedule::cron("not a cron");
        store.store_trigger(&broken, false).unwrap();
        let key = TriggerKey::in_default_group("t");
        store.acquire_next_triggers(at(1), 1).unwrap();

        assert!(matches!(store.triggered(&key, at(1)), Err(EngineError::Trigger(_))));
        let stored = store.retrieve_trigger(&key).unwrap().unwrap();
        assert_eq!(stored.state, TriggerState::Error);
        assert!(store.acquire_next_triggers(at(10), 5).unwrap().is_empty());
    }

    #[test]
    fn test_recover_returns_claimed_triggers_to_waiting() {
        let (_dir, store) = store();
        store
            .store_job(&JobDefinition::builder("report").build("a"), false)
            .unwrap();
        store.store_trigger(&trigger("t1", "a", 1), false).unwrap();
        store.store_trigger(&trigger("t2", "a", 1), false).unwrap();
        assert_eq!(store.acquire_next_triggers(at(1), 5).unwrap().len(), 2);

        assert_eq!(store.recover_acquired_triggers().unwrap(), 2);
        assert_eq!(store.recover_acquired_triggers().unwrap(), 0);
        assert_eq!(store.acquire_next_triggers(at(1), 5).unwrap().len(), 2);
    }
}
