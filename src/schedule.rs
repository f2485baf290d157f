use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::EvaluationError;

/// One timed transition of a rule's schedule.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRule {
    /// The state the rule enters at `timestamp`.
    pub enabled: bool,
    /// When the transition takes effect. None means it is already in effect.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ScheduleRule {
    fn has_applied(&self, now: DateTime<Utc>) -> bool {
        self.timestamp.map(|t| t <= now).unwrap_or(true)
    }
}

fn window(schedule: &[ScheduleRule]) -> Result<Option<(&ScheduleRule, &ScheduleRule)>, EvaluationError> {
    match schedule {
        [] => Ok(None),
        [first, second] => {
            if let (Some(start), Some(end)) = (first.timestamp, second.timestamp) {
                if end < start {
                    return Err(EvaluationError::configuration(format!(
                        "schedule transitions are out of order: {} is before {}",
                        end, start
                    )));
                }
            }
            Ok(Some((first, second)))
        }
        other => Err(EvaluationError::configuration(format!(
            "a schedule needs exactly two transitions, found {}",
            other.len()
        ))),
    }
}

/// Returns whether a rule with this schedule is active at `now`.
///
/// The latest transition that has taken effect decides the state. Before the first transition the
/// rule is in the opposite of the first transition's state, so an "enable at T" schedule is off
/// until T. An empty schedule is always active.
pub fn is_active(schedule: &[ScheduleRule], now: DateTime<Utc>) -> Result<bool, EvaluationError> {
    let (first, second) = match window(schedule)? {
        Some(pair) => pair,
        None => return Ok(true),
    };
    Ok(if second.has_applied(now) {
        second.enabled
    } else if first.has_applied(now) {
        first.enabled
    } else {
        !first.enabled
    })
}

/// Returns the state the schedule will keep from `now` on, or None if a transition is still
/// pending. A malformed schedule never activates.
pub fn settled_state(schedule: &[ScheduleRule], now: DateTime<Utc>) -> Option<bool> {
    match window(schedule) {
        Ok(None) => Some(true),
        Ok(Some((_, second))) if second.has_applied(now) => Some(second.enabled),
        Ok(Some(_)) => None,
        Err(_) => Some(false),
    }
}
