//! Cron-expression trigger.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use super::trigger::{Trigger, TriggerContext, TriggerError};
use crate::util::clock;

/// Trigger driven by a 6 or 7 field cron expression (seconds first).
///
/// Fire times are computed in the configured zone and reported in UTC. The
/// search starts from the later of the last completion and the last scheduled
/// time, so a slow run never causes the same slot to fire twice.
#[derive(Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: Schedule,
    zone: Tz,
}

impl fmt::Debug for CronTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronTrigger")
            .field("expression", &self.expression)
            .field("zone", &self.zone.name())
            .finish()
    }
}

impl CronTrigger {
    /// Parse `expression`, evaluated in UTC.
    ///
    /// # Errors
    ///
    /// Returns `TriggerError::InvalidCron` if the expression does not parse.
    pub fn new(expression: &str) -> Result<Self, TriggerError> {
        let schedule = Schedule::from_str(expression).map_err(|e| TriggerError::InvalidCron {
            expression: expression.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expression: expression.to_owned(),
            schedule,
            zone: Tz::UTC,
        })
    }

    /// Parse `expression`, evaluated in the IANA zone `zone` (e.g. `Europe/Berlin`).
    ///
    /// # Errors
    ///
    /// - `TriggerError::InvalidCron` if the expression does not parse
    /// - `TriggerError::InvalidTimezone` if the zone is unknown
    pub fn with_zone(expression: &str, zone: &str) -> Result<Self, TriggerError> {
        let zone = zone
            .parse::<Tz>()
            .map_err(|_| TriggerError::InvalidTimezone(zone.to_owned()))?;
        Ok(Self {
            zone,
            ..Self::new(expression)?
        })
    }

    /// The expression as given.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Evaluation zone.
    #[must_use]
    pub const fn zone(&self) -> Tz {
        self.zone
    }

    /// First fire time strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.zone))
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl Trigger for CronTrigger {
    fn next_execution_time(&self, context: &TriggerContext) -> Option<DateTime<Utc>> {
        let reference = match (context.last_completion_time, context.last_scheduled_time) {
            (Some(completed), Some(scheduled)) => completed.max(scheduled),
            (Some(completed), None) => completed,
            (None, Some(scheduled)) => scheduled,
            (None, None) => clock::now(),
        };
        self.next_after(reference)
    }
}
