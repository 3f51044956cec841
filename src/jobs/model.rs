//! Persistent job model: keys, job and trigger definitions, calendars.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::EngineError;
use crate::scheduling::cron::CronTrigger;
use crate::util::clock;

/// Group used when a definition names none.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Key-value data attached to jobs and triggers.
pub type JobDataMap = Map<String, Value>;

/// Upper bound on calendar-excluded fire times skipped for one trigger advance.
const MAX_CALENDAR_SKIPS: usize = 10_000;

macro_rules! define_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            name: String,
            group: String,
        }

        impl $name {
            /// Key `(name, group)`.
            pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
                Self {
                    name: name.into(),
                    group: group.into(),
                }
            }

            /// Key in [`DEFAULT_GROUP`].
            pub fn in_default_group(name: impl Into<String>) -> Self {
                Self::new(name, DEFAULT_GROUP)
            }

            /// Name part.
            #[must_use]
            pub fn name(&self) -> &str {
                &self.name
            }

            /// Group part.
            #[must_use]
            pub fn group(&self) -> &str {
                &self.group
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", self.group, self.name)
            }
        }
    };
}

define_key!(
    /// Identity of a job definition, unique per engine.
    JobKey
);
define_key!(
    /// Identity of a trigger definition, unique per engine.
    TriggerKey
);

/// Whether runs of one job may overlap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// Runs may overlap.
    #[default]
    Concurrent,
    /// A run is held back while a previous run of the same job is in flight.
    Exclusive,
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Identity.
    pub key: JobKey,
    /// Implementation name looked up in the job registry.
    pub job_type: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Job data, merged with trigger data at execution time.
    #[serde(default)]
    pub data: JobDataMap,
    /// Keep the job after its last trigger is removed.
    #[serde(default)]
    pub durable: bool,
    /// Re-run the job after a crash during execution.
    #[serde(default)]
    pub requests_recovery: bool,
    /// Overlap policy.
    #[serde(default)]
    pub concurrency: ConcurrencyMode,
}

impl JobDefinition {
    /// Start building a definition for the implementation `job_type`.
    pub fn builder(job_type: impl Into<String>) -> JobDefinitionBuilder {
        JobDefinitionBuilder {
            job_type: job_type.into(),
            name: None,
            group: None,
            description: None,
            data: JobDataMap::new(),
            durable: false,
            requests_recovery: false,
            concurrency: ConcurrencyMode::Concurrent,
        }
    }
}

/// Builder for [`JobDefinition`].
#[derive(Debug, Clone)]
pub struct JobDefinitionBuilder {
    job_type: String,
    name: Option<String>,
    group: Option<String>,
    description: Option<String>,
    data: JobDataMap,
    durable: bool,
    requests_recovery: bool,
    concurrency: ConcurrencyMode,
}

impl JobDefinitionBuilder {
    /// Explicit job name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Explicit group; defaults to [`DEFAULT_GROUP`].
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add one data entry.
    #[must_use]
    pub fn data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Keep the job without triggers.
    #[must_use]
    pub const fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Ask for re-execution after a crash.
    #[must_use]
    pub const fn requests_recovery(mut self, requests_recovery: bool) -> Self {
        self.requests_recovery = requests_recovery;
        self
    }

    /// Overlap policy.
    #[must_use]
    pub const fn concurrency(mut self, concurrency: ConcurrencyMode) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Finish; `identifier` names the job when no explicit name was given.
    #[must_use]
    pub fn build(self, identifier: &str) -> JobDefinition {
        JobDefinition {
            key: JobKey::new(
                self.name.unwrap_or_else(|| identifier.to_owned()),
                self.group.unwrap_or_else(|| DEFAULT_GROUP.to_owned()),
            ),
            job_type: self.job_type,
            description: self.description,
            data: self.data,
            durable: self.durable,
            requests_recovery: self.requests_recovery,
            concurrency: self.concurrency,
        }
    }
}

/// When a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSchedule {
    /// Fire at `start_time`, then every `repeat_interval_ms`.
    ///
    /// `repeat_count` is the number of repeats after the first fire; `None`
    /// repeats forever. A zero interval fires once.
    Simple {
        /// First fire time.
        start_time: DateTime<Utc>,
        /// Interval between fires in milliseconds.
        repeat_interval_ms: u64,
        /// Repeats after the first fire.
        repeat_count: Option<u32>,
    },
    /// Fire on a cron expression in an optional IANA time zone (UTC by default).
    Cron {
        /// Six or seven field expression, seconds first.
        expression: String,
        /// Zone name such as `Europe/Paris`.
        #[serde(default)]
        time_zone: Option<String>,
    },
}

impl TriggerSchedule {
    /// Fire once at `at`.
    #[must_use]
    pub const fn once(at: DateTime<Utc>) -> Self {
        Self::Simple {
            start_time: at,
            repeat_interval_ms: 0,
            repeat_count: Some(0),
        }
    }

    /// Fire at `start_time` and then every `interval`, forever.
    #[must_use]
    pub fn every(start_time: DateTime<Utc>, interval: Duration) -> Self {
        Self::Simple {
            start_time,
            repeat_interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            repeat_count: None,
        }
    }

    /// Fire on `expression` in UTC.
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
            time_zone: None,
        }
    }

    /// Check the schedule can be evaluated.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Trigger` for a malformed cron expression or zone.
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Self::Cron { .. } = self {
            self.cron_trigger()?;
        }
        Ok(())
    }

    fn cron_trigger(&self) -> Result<Option<CronTrigger>, EngineError> {
        match self {
            Self::Cron {
                expression,
                time_zone: Some(zone),
            } => Ok(Some(CronTrigger::with_zone(expression, zone)?)),
            Self::Cron { expression, .. } => Ok(Some(CronTrigger::new(expression)?)),
            Self::Simple { .. } => Ok(None),
        }
    }

    /// Move `previous` past every fire time earlier than `not_before`.
    ///
    /// Returns the last skipped fire time (or `previous` when nothing was
    /// missed) and the number of fires skipped. Simple schedules jump along
    /// their interval grid; cron schedules resume at `not_before`.
    #[must_use]
    pub fn skip_missed(&self, previous: DateTime<Utc>, not_before: DateTime<Utc>) -> (DateTime<Utc>, u32) {
        match self {
            Self::Simple {
                repeat_interval_ms, ..
            } if *repeat_interval_ms > 0 => {
                let interval = i64::try_from(*repeat_interval_ms).unwrap_or(i64::MAX);
                let behind = (not_before - previous).num_milliseconds();
                if behind <= interval {
                    return (previous, 0);
                }
                let missed = (behind - 1) / interval;
                let skipped_ms = u64::try_from(missed.saturating_mul(interval)).unwrap_or(0);
                (
                    clock::add_duration(previous, Duration::from_millis(skipped_ms)),
                    u32::try_from(missed).unwrap_or(u32::MAX),
                )
            }
            Self::Cron { .. } => {
                let resume = not_before
                    .checked_sub_signed(chrono::Duration::milliseconds(1))
                    .unwrap_or(not_before);
                (previous.max(resume), 0)
            }
            Self::Simple { .. } => (previous, 0),
        }
    }

    /// Next fire time after `previous`, given `times_triggered` fires so far.
    ///
    /// With no previous fire, simple schedules start at their start time and
    /// cron schedules at the first slot after `now`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Trigger` for a malformed cron schedule.
    pub fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        times_triggered: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        match self {
            Self::Simple {
                start_time,
                repeat_interval_ms,
                repeat_count,
            } => Ok(match previous {
                None => Some(*start_time),
                Some(_) if *repeat_interval_ms == 0 => None,
                Some(_) if repeat_count.is_some_and(|count| times_triggered > count) => None,
                Some(previous) => Some(clock::add_duration(previous, Duration::from_millis(*repeat_interval_ms))),
            }),
            Self::Cron { .. } => Ok(self
                .cron_trigger()?
                .and_then(|cron| cron.next_after(previous.unwrap_or(now)))),
        }
    }
}

/// Named set of excluded dates and weekdays, evaluated on the UTC date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    /// Unique name referenced by triggers.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Dates on which nothing fires.
    #[serde(default)]
    pub excluded_dates: BTreeSet<NaiveDate>,
    /// Weekdays on which nothing fires.
    #[serde(default)]
    pub excluded_weekdays: Vec<Weekday>,
}

impl Calendar {
    /// Empty calendar called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Exclude one date.
    #[must_use]
    pub fn exclude_date(mut self, date: NaiveDate) -> Self {
        self.excluded_dates.insert(date);
        self
    }

    /// Exclude a weekday.
    #[must_use]
    pub fn exclude_weekday(mut self, weekday: Weekday) -> Self {
        if !self.excluded_weekdays.contains(&weekday) {
            self.excluded_weekdays.push(weekday);
        }
        self
    }

    /// Whether a fire at `at` is allowed.
    #[must_use]
    pub fn is_time_included(&self, at: DateTime<Utc>) -> bool {
        let date = at.date_naive();
        !self.excluded_dates.contains(&date) && !self.excluded_weekdays.contains(&date.weekday())
    }
}

/// A trigger as registered by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    /// Identity.
    pub key: TriggerKey,
    /// Job fired by this trigger.
    pub job_key: JobKey,
    /// Fire-time policy.
    pub schedule: TriggerSchedule,
    /// Calendar whose exclusions apply.
    #[serde(default)]
    pub calendar: Option<String>,
    /// Job definition registered together with the trigger, if any.
    #[serde(default)]
    pub job: Option<JobDefinition>,
    /// Trigger data; wins over job data on key clashes.
    #[serde(default)]
    pub data: JobDataMap,
    /// Among triggers due at the same instant, higher fires first.
    #[serde(default)]
    pub priority: i32,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
}

impl TriggerDefinition {
    /// Trigger for an already registered job.
    #[must_use]
    pub fn new(key: TriggerKey, job_key: JobKey, schedule: TriggerSchedule) -> Self {
        Self {
            key,
            job_key,
            schedule,
            calendar: None,
            job: None,
            data: JobDataMap::new(),
            priority: 5,
            description: None,
        }
    }

    /// Trigger carrying its job inline.
    #[must_use]
    pub fn for_job(key: TriggerKey, job: JobDefinition, schedule: TriggerSchedule) -> Self {
        let mut trigger = Self::new(key, job.key.clone(), schedule);
        trigger.job = Some(job);
        trigger
    }

    /// Apply calendar `name`.
    #[must_use]
    pub fn with_calendar(mut self, name: impl Into<String>) -> Self {
        self.calendar = Some(name.into());
        self
    }

    /// Add one data entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Store-side state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Waiting for its next fire time.
    Waiting,
    /// Claimed by a firing pass.
    Acquired,
    /// No further fire times.
    Complete,
    /// The schedule could not be evaluated.
    Error,
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Acquired => "acquired",
            Self::Complete => "complete",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "acquired" => Ok(Self::Acquired),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown trigger state `{other}`")),
        }
    }
}

/// A trigger plus its firing history, as held by a job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTrigger {
    /// Definition as registered.
    pub definition: TriggerDefinition,
    /// Next planned fire.
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Last fire.
    pub previous_fire_time: Option<DateTime<Utc>>,
    /// Fires so far.
    pub times_triggered: u32,
    /// Store-side state.
    pub state: TriggerState,
}

impl StoredTrigger {
    /// Compute the first fire time of `definition`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Trigger` for a malformed schedule.
    pub fn new(
        definition: TriggerDefinition,
        calendar: Option<&Calendar>,
        now: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        let next_fire_time = Self::compute_next(&definition.schedule, None, 0, now, calendar, None)?;
        Ok(Self {
            state: if next_fire_time.is_some() {
                TriggerState::Waiting
            } else {
                TriggerState::Complete
            },
            definition,
            next_fire_time,
            previous_fire_time: None,
            times_triggered: 0,
        })
    }

    /// Trigger identity.
    #[must_use]
    pub const fn key(&self) -> &TriggerKey {
        &self.definition.key
    }

    /// Job identity.
    #[must_use]
    pub const fn job_key(&self) -> &JobKey {
        &self.definition.job_key
    }

    /// Record a fire at the planned time and move to the next one.
    ///
    /// Fire times already in the past at `now` are skipped, so a trigger that
    /// was held back fires once rather than catching up.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Trigger` for a malformed schedule and
    /// `EngineError::CalendarExhausted` when the calendar excludes every
    /// candidate.
    pub fn advance(&mut self, now: DateTime<Utc>, calendar: Option<&Calendar>) -> Result<(), EngineError> {
        let fired = self.next_fire_time.unwrap_or(now);
        self.previous_fire_time = Some(fired);
        self.times_triggered = self.times_triggered.saturating_add(1);
        let next = Self::compute_next(
            &self.definition.schedule,
            Some(fired),
            self.times_triggered,
            now,
            calendar,
            Some(now),
        )?;
        self.next_fire_time = next;
        self.state = if next.is_some() {
            TriggerState::Waiting
        } else {
            TriggerState::Complete
        };
        Ok(())
    }

    fn compute_next(
        schedule: &TriggerSchedule,
        mut previous: Option<DateTime<Utc>>,
        mut times: u32,
        now: DateTime<Utc>,
        calendar: Option<&Calendar>,
        mut not_before: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        for _ in 0..MAX_CALENDAR_SKIPS {
            if let (Some(last), Some(limit)) = (previous, not_before) {
                let (last, skipped) = schedule.skip_missed(last, limit);
                previous = Some(last);
                times = times.saturating_add(skipped);
            }
            let Some(candidate) = schedule.next_fire_time(previous, times, now)? else {
                return Ok(None);
            };
            if !calendar.is_some_and(|cal| !cal.is_time_included(candidate)) {
                return Ok(Some(candidate));
            }
            // Exclusions cover whole UTC days.
            previous = Some(candidate);
            times = times.saturating_add(1);
            not_before = candidate
                .date_naive()
                .succ_opt()
                .and_then(|day| day.and_hms_opt(0, 0, 0))
                .map(|midnight| midnight.and_utc());
        }
        Err(EngineError::CalendarExhausted(MAX_CALENDAR_SKIPS))
    }
}
