//! In-memory job store.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::jobs::error::EngineError;
use crate::jobs::model::{Calendar, JobDefinition, JobKey, StoredTrigger, TriggerKey, TriggerState};
use crate::jobs::store::{JobStore, TriggerFiredBundle};

#[derive(Default)]
struct RamState {
    jobs: BTreeMap<JobKey, JobDefinition>,
    triggers: BTreeMap<TriggerKey, StoredTrigger>,
    calendars: HashMap<String, Calendar>,
}

impl RamState {
    fn drop_orphaned_job(&mut self, job: &JobKey) {
        let durable = self.jobs.get(job).is_some_and(|def| def.durable);
        if !durable && !self.triggers.values().any(|t| t.job_key() == job) {
            self.jobs.remove(job);
        }
    }

    fn mark_error(&mut self, key: &TriggerKey) {
        if let Some(trigger) = self.triggers.get_mut(key) {
            trigger.state = TriggerState::Error;
        }
    }
}

/// Job store that keeps everything in process memory.
///
/// Nothing survives a restart; useful for tests and for engines whose
/// registrations are replayed at every start.
#[derive(Default)]
pub struct RamJobStore {
    state: RwLock<RamState>,
}

impl std::fmt::Debug for RamJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("RamJobStore")
            .field("jobs", &state.jobs.len())
            .field("triggers", &state.triggers.len())
            .field("calendars", &state.calendars.len())
            .finish()
    }
}

impl RamJobStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for RamJobStore {
    fn store_job(&self, job: &JobDefinition, replace: bool) -> Result<(), EngineError> {
        let mut state = self.state.write();
        if !replace && state.jobs.contains_key(&job.key) {
            return Err(EngineError::already_exists("job", &job.key));
        }
        state.jobs.insert(job.key.clone(), job.clone());
        Ok(())
    }

    fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDefinition>, EngineError> {
        Ok(self.state.read().jobs.get(key).cloned())
    }

    fn remove_job(&self, key: &JobKey) -> Result<bool, EngineError> {
        let mut state = self.state.write();
        state.triggers.retain(|_, trigger| trigger.job_key() != key);
        Ok(state.jobs.remove(key).is_some())
    }

    fn job_keys(&self) -> Result<Vec<JobKey>, EngineError> {
        Ok(self.state.read().jobs.keys().cloned().collect())
    }

    fn store_trigger(&self, trigger: &StoredTrigger, replace: bool) -> Result<(), EngineError> {
        let mut state = self.state.write();
        if !state.jobs.contains_key(trigger.job_key()) {
            return Err(EngineError::JobNotFound(trigger.job_key().to_string()));
        }
        if !replace && state.triggers.contains_key(trigger.key()) {
            return Err(EngineError::already_exists("trigger", trigger.key()));
        }
        state.triggers.insert(trigger.key().clone(), trigger.clone());
        Ok(())
    }

    fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<StoredTrigger>, EngineError> {
        Ok(self.state.read().triggers.get(key).cloned())
    }

    fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, EngineError> {
        let mut state = self.state.write();
        let Some(removed) = state.triggers.remove(key) else {
            return Ok(false);
        };
        state.drop_orphaned_job(removed.job_key());
        Ok(true)
    }

    fn replace_trigger(&self, key: &TriggerKey, trigger: &StoredTrigger) -> Result<bool, EngineError> {
        let mut state = self.state.write();
        if !state.jobs.contains_key(trigger.job_key()) {
            return Err(EngineError::JobNotFound(trigger.job_key().to_string()));
        }
        let Some(old) = state.triggers.remove(key) else {
            return Ok(false);
        };
        state.triggers.insert(trigger.key().clone(), trigger.clone());
        if old.job_key() != trigger.job_key() {
            state.drop_orphaned_job(old.job_key());
        }
        Ok(true)
    }

    fn triggers_for_job(&self, job: &JobKey) -> Result<Vec<StoredTrigger>, EngineError> {
        Ok(self
            .state
            .read()
            .triggers
            .values()
            .filter(|trigger| trigger.job_key() == job)
            .cloned()
            .collect())
    }

    fn store_calendar(&self, calendar: &Calendar, replace: bool) -> Result<(), EngineError> {
        let mut state = self.state.write();
        if !replace && state.calendars.contains_key(&calendar.name) {
            return Err(EngineError::already_exists("calendar", &calendar.name));
        }
        state.calendars.insert(calendar.name.clone(), calendar.clone());
        Ok(())
    }

    fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>, EngineError> {
        Ok(self.state.read().calendars.get(name).cloned())
    }

    fn remove_calendar(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.state.write().calendars.remove(name).is_some())
    }

    fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<StoredTrigger>, EngineError> {
        let mut state = self.state.write();
        let mut due: Vec<(DateTime<Utc>, i32, TriggerKey)> = state
            .triggers
            .values()
            .filter(|trigger| trigger.state == TriggerState::Waiting)
            .filter_map(|trigger| {
                trigger
                    .next_fire_time
                    .filter(|at| *at <= no_later_than)
                    .map(|at| (at, trigger.definition.priority, trigger.key().clone()))
            })
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        due.truncate(max);
        let mut acquired = Vec::with_capacity(due.len());
        for (_, _, key) in due {
            if let Some(trigger) = state.triggers.get_mut(&key) {
                trigger.state = TriggerState::Acquired;
                acquired.push(trigger.clone());
            }
        }
        Ok(acquired)
    }

    fn release_acquired_trigger(&self, key: &TriggerKey) -> Result<(), EngineError> {
        if let Some(trigger) = self.state.write().triggers.get_mut(key) {
            if trigger.state == TriggerState::Acquired {
                trigger.state = TriggerState::Waiting;
            }
        }
        Ok(())
    }

    fn recover_acquired_triggers(&self) -> Result<usize, EngineError> {
        let mut state = self.state.write();
        let mut released = 0;
        for trigger in state.triggers.values_mut() {
            if trigger.state == TriggerState::Acquired {
                trigger.state = TriggerState::Waiting;
                released += 1;
            }
        }
        Ok(released)
    }

    fn triggered(&self, key: &TriggerKey, now: DateTime<Utc>) -> Result<Option<TriggerFiredBundle>, EngineError> {
        let mut state = self.state.write();
        let Some(trigger) = state.triggers.get(key).cloned() else {
            return Ok(None);
        };
        if trigger.state != TriggerState::Acquired {
            return Ok(None);
        }
        let calendar = trigger
            .definition
            .calendar
            .as_ref()
            .and_then(|name| state.calendars.get(name).cloned());
        let Some(job) = state.jobs.get(trigger.job_key()).cloned() else {
            state.mark_error(key);
            return Err(EngineError::JobNotFound(trigger.job_key().to_string()));
        };
        let scheduled_fire_time = trigger.next_fire_time.unwrap_or(now);
        let previous_fire_time = trigger.previous_fire_time;
        let mut advanced = trigger;
        if let Err(err) = advanced.advance(now, calendar.as_ref()) {
            state.mark_error(key);
            return Err(err);
        }
        state.triggers.insert(key.clone(), advanced.clone());
        Ok(Some(TriggerFiredBundle {
            job,
            trigger: advanced,
            scheduled_fire_time,
            fire_time: now,
            previous_fire_time,
        }))
    }

    fn triggered_job_complete(&self, trigger: &TriggerKey, job: &JobKey) -> Result<(), EngineError> {
        let mut state = self.state.write();
        let complete = state
            .triggers
            .get(trigger)
            .is_some_and(|stored| stored.state == TriggerState::Complete);
        if complete {
            state.triggers.remove(trigger);
            state.drop_orphaned_job(job);
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), EngineError> {
        *self.state.write() = RamState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{TriggerDefinition, TriggerSchedule};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn job(name: &str) -> JobDefinition {
        JobDefinition::builder("noop").build(name)
    }

    fn trigger(name: &str, job: &str, start: i64) -> StoredTrigger {
        let def = TriggerDefinition::new(
            TriggerKey::in_default_group(name),
            JobKey::in_default_group(job),
            TriggerSchedule::once(at(start)),
        );
        StoredTrigger::new(def, None, at(0)).unwrap()
    }

    #[test]
    fn test_duplicate_job_is_already_exists() {
        let store = RamJobStore::new();
        store.store_job(&job("a"), false).unwrap();
        assert!(store.store_job(&job("a"), false).unwrap_err().is_already_exists());
        store.store_job(&job("a"), true).unwrap();
        assert_eq!(store.job_keys().unwrap().len(), 1);
    }

    #[test]
    fn test_trigger_requires_job() {
        let store = RamJobStore::new();
        assert!(matches!(
            store.store_trigger(&trigger("t", "missing", 1), false),
            Err(EngineError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_acquire_orders_by_time_then_priority() {
        let store = RamJobStore::new();
        store.store_job(&job("a"), false).unwrap();
        store.store_trigger(&trigger("late", "a", 5), false).unwrap();
        let mut urgent = trigger("urgent", "a", 1);
        urgent.definition.priority = 10;
        store.store_trigger(&urgent, false).unwrap();
        store.store_trigger(&trigger("early", "a", 1), false).unwrap();
        store.store_trigger(&trigger("future", "a", 100), false).unwrap();

        let acquired = store.acquire_next_triggers(at(10), 10).unwrap();
        let names: Vec<&str> = acquired.iter().map(|t| t.key().name()).collect();
        assert_eq!(names, ["urgent", "early", "late"]);
        assert!(store.acquire_next_triggers(at(10), 10).unwrap().is_empty());
    }

    #[test]
    fn test_fire_and_complete_removes_one_shot_and_orphan() {
        let store = RamJobStore::new();
        store.store_job(&job("a"), false).unwrap();
        store.store_trigger(&trigger("t", "a", 1), false).unwrap();
        let key = TriggerKey::in_default_group("t");
        store.acquire_next_triggers(at(1), 1).unwrap();
        let bundle = store.triggered(&key, at(1)).unwrap().unwrap();
        assert_eq!(bundle.scheduled_fire_time, at(1));
        assert_eq!(bundle.trigger.state, TriggerState::Complete);
        store.triggered_job_complete(&key, &bundle.job.key).unwrap();
        assert!(store.retrieve_trigger(&key).unwrap().is_none());
        assert!(store.job_keys().unwrap().is_empty());
    }

    #[test]
    fn test_released_trigger_is_not_fired() {
        let store = RamJobStore::new();
        store.store_job(&job("a"), false).unwrap();
        store.store_trigger(&trigger("t", "a", 1), false).unwrap();
        let key = TriggerKey::in_default_group("t");
        store.acquire_next_triggers(at(1), 1).unwrap();
        store.release_acquired_trigger(&key).unwrap();
        assert!(store.triggered(&key, at(1)).unwrap().is_none());
        assert_eq!(store.acquire_next_triggers(at(1), 1).unwrap().len(), 1);
    }

    #[test]
    fn test_unadvanceable_trigger_is_left_in_error() {
        let store = RamJobStore::new();
        store.store_job(&job("a"), false).unwrap();
        let mut broken = trigger("t", "a", 1);
        broken.definition.schedule = TriggerSchedule::cron("not a cron");
        store.store_trigger(&broken, false).unwrap();
        let key = TriggerKey::in_default_group("t");
        store.acquire_next_triggers(at(1), 1).unwrap();

        assert!(matches!(store.triggered(&key, at(1)), Err(EngineError::Trigger(_))));
        let stored = store.retrieve_trigger(&key).unwrap().unwrap();
        assert_eq!(stored.state, TriggerState::Error);
        assert_eq!(stored.times_triggered, 0);
    }

    #[test]
    fn test_recover_returns_claimed_triggers_to_waiting() {
        let store = RamJobStore::new();
        store.store_job(&job("a"), false).unwrap();
        store.store_trigger(&trigger("t1", "a", 1), false).unwrap();
        store.store_trigger(&trigger("t2", "a", 50), false).unwrap();
        assert_eq!(store.acquire_next_triggers(at(1), 5).unwrap().len(), 1);

        assert_eq!(store.recover_acquired_triggers().unwrap(), 1);
        let recovered = store.retrieve_trigger(&TriggerKey::in_default_group("t1")).unwrap().unwrap();
        assert_eq!(recovered.state, TriggerState::Waiting);
    }
}
