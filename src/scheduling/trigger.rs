//! Trigger contract and the periodic trigger.
//!
//! A trigger is a pure policy: given what happened last, when should the task
//! run next? `None` ends the schedule for good.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::clock;

/// Errors raised while building a trigger.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    /// The cron expression could not be parsed.
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidCron {
        /// Expression as given.
        expression: String,
        /// Parser message.
        reason: String,
    },
    /// The time zone name is not a known IANA zone.
    #[error("invalid time zone `{0}`")]
    InvalidTimezone(String),
    /// Periodic triggers need a period greater than zero.
    #[error("trigger period must be greater than zero")]
    InvalidPeriod,
}

/// Snapshot of the previous execution, handed to [`Trigger::next_execution_time`].
///
/// All fields are `None` before the first run. A fresh context is built after
/// every execution; contexts are never mutated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerContext {
    /// When the previous run was planned to start.
    pub last_scheduled_time: Option<DateTime<Utc>>,
    /// When the previous run actually started.
    pub last_actual_start_time: Option<DateTime<Utc>>,
    /// When the previous run completed.
    pub last_completion_time: Option<DateTime<Utc>>,
}

impl TriggerContext {
    /// Context describing one finished execution.
    #[must_use]
    pub const fn new(
        last_scheduled_time: Option<DateTime<Utc>>,
        last_actual_start_time: Option<DateTime<Utc>>,
        last_completion_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            last_scheduled_time,
            last_actual_start_time,
            last_completion_time,
        }
    }

    /// Whether no execution has happened yet.
    #[must_use]
    pub const fn is_first_run(&self) -> bool {
        self.last_scheduled_time.is_none()
            && self.last_actual_start_time.is_none()
            && self.last_completion_time.is_none()
    }
}

/// Computes the next execution instant from execution history.
///
/// Implementations must not return an instant before now for the first run.
/// Any `Fn(&TriggerContext) -> Option<DateTime<Utc>>` closure is a trigger.
pub trait Trigger: Send + Sync {
    /// Next execution instant, or `None` when the schedule is complete.
    fn next_execution_time(&self, context: &TriggerContext) -> Option<DateTime<Utc>>;
}

impl<F> Trigger for F
where
    F: Fn(&TriggerContext) -> Option<DateTime<Utc>> + Send + Sync,
{
    fn next_execution_time(&self, context: &TriggerContext) -> Option<DateTime<Utc>> {
        self(context)
    }
}

/// Fixed-rate or fixed-delay trigger.
///
/// - fixed rate: next = last *scheduled* time + period, so overruns do not drift
/// - fixed delay: next = last *completion* time + period
///
/// The first run fires `initial_delay` after the trigger is first evaluated.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeriodicTrigger {
    period: Duration,
    initial_delay: Duration,
    fixed_rate: bool,
}

impl fmt::Debug for PeriodicTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTrigger")
            .field("period_ms", &self.period.as_millis())
            .field("initial_delay_ms", &self.initial_delay.as_millis())
            .field("fixed_rate", &self.fixed_rate)
            .finish()
    }
}

impl PeriodicTrigger {
    /// Fixed-delay trigger with no initial delay.
    ///
    /// # Errors
    ///
    /// Returns `TriggerError::InvalidPeriod` for a zero period.
    pub fn new(period: Duration) -> Result<Self, TriggerError> {
        if period.is_zero() {
            return Err(TriggerError::InvalidPeriod);
        }
        Ok(Self {
            period,
            initial_delay: Duration::ZERO,
            fixed_rate: false,
        })
    }

    /// Delay before the first run.
    #[must_use]
    pub const fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Measure the period from scheduled start times instead of completions.
    #[must_use]
    pub const fn with_fixed_rate(mut self, fixed_rate: bool) -> Self {
        self.fixed_rate = fixed_rate;
        self
    }

    /// Period between runs.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Delay before the first run.
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Whether this is a fixed-rate trigger.
    #[must_use]
    pub const fn is_fixed_rate(&self) -> bool {
        self.fixed_rate
    }
}

impl Trigger for PeriodicTrigger {
    fn next_execution_time(&self, context: &TriggerContext) -> Option<DateTime<Utc>> {
        let anchor = if self.fixed_rate {
            context.last_scheduled_time
        } else {
            context.last_completion_time.or(context.last_scheduled_time)
        };
        match anchor {
            Some(last) => Some(clock::add_duration(last, self.period)),
            None => Some(clock::add_duration(clock::now(), self.initial_delay)),
        }
    }
}
