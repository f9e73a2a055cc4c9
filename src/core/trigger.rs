//! Persistent trigger state and misfire handling.
//!
//! Every owned job has one [`TriggerState`]. It is stored in the state index
//! so that a node taking over a job (or a restarted node) resumes the same
//! rhythm instead of restarting the schedule from "now".

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::schedule::{MisfirePolicy, Schedule, ScheduleError};
use super::types::NodeId;

/// Lifecycle status of a trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    /// Waiting for its next fire time.
    #[default]
    Waiting,
    /// Picked up by a scheduler loop, about to be handed to the pool.
    Acquired,
    /// The job is currently executing.
    Executing,
    /// The schedule has no further occurrences.
    Complete,
    /// The schedule could not be evaluated.
    Error,
}

/// Outcome of a misfire check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misfire {
    /// The fire time is within the threshold.
    None,
    /// The trigger misfired and will fire once now.
    FireNow,
    /// The trigger misfired and the missed fire was dropped.
    Skipped,
}

/// Persisted state of one job's trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerState {
    /// Anchor of the schedule; preserved across restarts and fail-over.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    /// When the trigger fires next.
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub next_fire_time: Option<DateTime<Utc>>,
    /// When the trigger last fired.
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub previous_fire_time: Option<DateTime<Utc>>,
    /// Number of fires so far.
    #[serde(default)]
    pub times_triggered: u64,
    #[serde(default)]
    pub status: TriggerStatus,
    /// Node that last owned the trigger.
    #[serde(default)]
    pub node: Option<NodeId>,
}

impl TriggerState {
    /// Create a fresh trigger state for a schedule started at `now`.
    ///
    /// The schedule's initial delay is added to the start time.
    pub fn new(schedule: &Schedule, now: DateTime<Utc>) -> Result<Self, ScheduleError> {
        let delay = match schedule.delay() {
            Some(d) => TimeDelta::from_std(d)
                .map_err(|e| ScheduleError::InvalidInterval(e.to_string()))?,
            None => TimeDelta::zero(),
        };
        let start_time = truncate_to_millis(now + delay);
        let next_fire_time = schedule.first_fire_time(start_time)?;

        Ok(Self {
            start_time,
            next_fire_time: Some(next_fire_time),
            previous_fire_time: None,
            times_triggered: 0,
            status: TriggerStatus::Waiting,
            node: None,
        })
    }

    /// Resume from a persisted state. In-flight statuses left behind by a
    /// crashed or departed owner are reset so the trigger fires again.
    pub fn resume(mut self, node: &NodeId) -> Self {
        if matches!(
            self.status,
            TriggerStatus::Acquired | TriggerStatus::Executing
        ) {
            self.status = TriggerStatus::Waiting;
        }
        self.node = Some(node.clone());
        self
    }

    /// Whether another live node recorded a run of this trigger that has
    /// not finished yet.
    pub fn running_elsewhere(&self, local: &NodeId, live: &HashSet<NodeId>) -> bool {
        self.is_in_flight()
            && self
                .node
                .as_ref()
                .is_some_and(|owner| owner != local && live.contains(owner))
    }

    /// Acquired or executing.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.status,
            TriggerStatus::Acquired | TriggerStatus::Executing
        )
    }

    /// Whether the trigger should fire at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TriggerStatus::Waiting
            && self.next_fire_time.is_some_and(|next| next <= now)
    }

    /// Apply the misfire policy if the next fire time is older than
    /// `now - threshold`.
    pub fn check_misfire(
        &mut self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        threshold: Duration,
        policy: MisfirePolicy,
    ) -> Misfire {
        let Some(next) = self.next_fire_time else {
            return Misfire::None;
        };
        let threshold = TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX);
        let limit = now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC);
        if next >= limit {
            return Misfire::None;
        }

        match policy {
            MisfirePolicy::FireOnceNow => {
                self.next_fire_time = Some(now);
                Misfire::FireNow
            }
            MisfirePolicy::Skip => {
                self.apply_next(schedule.next_fire_time(self.start_time, now));
                Misfire::Skipped
            }
        }
    }

    /// Record a fire and advance to the following occurrence.
    ///
    /// Returns the fire time that was consumed.
    pub fn triggered(&mut self, schedule: &Schedule) -> Option<DateTime<Utc>> {
        let fired = self.next_fire_time?;
        self.previous_fire_time = Some(fired);
        self.times_triggered += 1;
        self.apply_next(schedule.next_fire_time(self.start_time, fired));
        if self.status != TriggerStatus::Complete && self.status != TriggerStatus::Error {
            self.status = TriggerStatus::Acquired;
        }
        Some(fired)
    }

    /// Mark the job as running.
    pub fn executing(&mut self) {
        if self.status == TriggerStatus::Acquired {
            self.status = TriggerStatus::Executing;
        }
    }

    /// Mark the run as finished.
    pub fn completed(&mut self) {
        if matches!(
            self.status,
            TriggerStatus::Acquired | TriggerStatus::Executing
        ) {
            self.status = TriggerStatus::Waiting;
        }
    }

    fn apply_next(&mut self, next: Result<DateTime<Utc>, ScheduleError>) {
        match next {
            Ok(next) => self.next_fire_time = Some(next),
            Err(ScheduleError::NoMoreOccurrences) => {
                self.next_fire_time = None;
                self.status = TriggerStatus::Complete;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to compute next fire time");
                self.next_fire_time = None;
                self.status = TriggerStatus::Error;
            }
        }
    }
}

fn truncate_to_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}
