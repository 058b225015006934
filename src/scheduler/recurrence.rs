//! When a scheduled job should fire.

use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;

use crate::Error;

/// A recurrence rule describing the occurrences of a scheduled job.
///
/// # Example
///
/// ```
/// # use taskmill::RecurrenceRule;
/// # use chrono::TimeDelta;
/// let every_five_minutes = RecurrenceRule::every(TimeDelta::minutes(5)).unwrap();
/// let weekdays_at_nine = RecurrenceRule::cron("0 0 9 * * Mon-Fri *").unwrap();
/// ```
#[derive(Debug, Clone)]
pub enum RecurrenceRule {
    /// Fires at a fixed interval from the previous occurrence.
    Every(TimeDelta),
    /// Fires according to a cron expression.
    Cron(Box<Schedule>),
}

impl RecurrenceRule {
    /// A fixed-interval rule. The interval must be positive.
    pub fn every(interval: TimeDelta) -> Result<Self, Error> {
        if interval <= TimeDelta::zero() {
            return Err(Error::InvalidRecurrenceRule(format!(
                "interval must be positive, got {interval}"
            )));
        }
        Ok(Self::Every(interval))
    }

    /// A cron rule, parsed with [`cron::Schedule`]'s seven-field grammar
    /// (seconds through years).
    pub fn cron(expression: &str) -> Result<Self, Error> {
        let schedule = Schedule::from_str(expression)
            .map_err(|err| Error::InvalidRecurrenceRule(err.to_string()))?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    /// The first occurrence strictly after `after`.
    ///
    /// For [`RecurrenceRule::Every`] the next occurrence is relative to
    /// `after` itself, so advancing from each fired occurrence keeps the
    /// series drift-free regardless of tick timing.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(interval) => after.checked_add_signed(*interval),
            Self::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}
