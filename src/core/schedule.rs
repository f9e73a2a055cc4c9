//! Schedule parsing and fire time calculation.
//!
//! A schedule is either a fixed interval (`100ms`, `5s`, `1h30m`) or a set of
//! cron expressions. Cron expressions may use the standard 5-field form, the
//! 6-field form with seconds, or the 7-field form with a trailing year.
//! Shortcuts (`@daily`, `@hourly`, `@every 5m`, ...) are accepted as well.

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when parsing or using schedules.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid interval expression.
    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// A cron schedule without any expression.
    #[error("schedule has no cron expressions")]
    Empty,

    /// No more occurrences.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

/// What to do with a trigger whose fire time passed more than the misfire
/// threshold ago.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Fire once immediately, then continue with the regular schedule.
    #[default]
    FireOnceNow,
    /// Drop the missed fire and wait for the next regular occurrence.
    Skip,
}

/// A schedule for job execution.
#[derive(Debug, Clone)]
pub struct Schedule {
    kind: ScheduleKind,
    /// Timezone cron expressions are evaluated in.
    timezone: Tz,
    /// Delay added to the start time before the first fire.
    delay: Option<Duration>,
}

#[derive(Debug, Clone)]
enum ScheduleKind {
    /// Fixed interval, anchored at the trigger's start time.
    Interval(Duration),
    /// One or more cron expressions; the earliest upcoming one wins.
    Cron(Vec<CronEntry>),
}

#[derive(Debug, Clone)]
struct CronEntry {
    expression: String,
    schedule: Box<CronSchedule>,
}

impl Schedule {
    /// Create a schedule from a single cron expression or shortcut.
    ///
    /// Supports:
    /// - Standard 5-field cron: `minute hour day month weekday`
    /// - Extended 6-field cron: `second minute hour day month weekday`
    /// - 7-field cron with year, including the `?` placeholder
    /// - Shortcuts: `@yearly`, `@monthly`, `@weekly`, `@daily`, `@hourly`
    /// - Intervals: `@every 5m`, `@every 100ms`
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let trimmed = expression.trim();

        if let Some(rest) = trimmed.to_lowercase().strip_prefix("@every ") {
            return Self::parse_interval(rest);
        }

        Self::cron([trimmed])
    }

    /// Create an interval schedule.
    pub fn interval(interval: Duration) -> Result<Self, ScheduleError> {
        if interval.is_zero() {
            return Err(ScheduleError::InvalidInterval("0".into()));
        }

        Ok(Self {
            kind: ScheduleKind::Interval(interval),
            timezone: Tz::UTC,
            delay: None,
        })
    }

    /// Parse an interval expression such as `100ms`, `5s` or `1h30m`.
    pub fn parse_interval(expression: &str) -> Result<Self, ScheduleError> {
        Self::interval(parse_duration(expression)?)
    }

    /// Create a schedule from one or more cron expressions.
    pub fn cron<I, S>(expressions: I) -> Result<Self, ScheduleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = expressions
            .into_iter()
            .map(|e| parse_cron_entry(e.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        if entries.is_empty() {
            return Err(ScheduleError::Empty);
        }

        Ok(Self {
            kind: ScheduleKind::Cron(entries),
            timezone: Tz::UTC,
            delay: None,
        })
    }

    /// Evaluate cron expressions in the given timezone.
    pub fn with_timezone(mut self, timezone: &str) -> Result<Self, ScheduleError> {
        self.timezone = timezone
            .parse::<Tz>()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
        Ok(self)
    }

    /// Set an initial delay applied before the first fire.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = if delay.is_zero() { None } else { Some(delay) };
        self
    }

    /// The first fire time of a trigger started at `start`.
    pub fn first_fire_time(&self, start: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match &self.kind {
            ScheduleKind::Interval(_) => Ok(start),
            ScheduleKind::Cron(_) => self.next_after(start - TimeDelta::milliseconds(1)),
        }
    }

    /// The next fire time strictly after `after` for a trigger that started
    /// at `start_time`.
    ///
    /// Interval schedules stay on the grid `start_time + k * interval`, so a
    /// trigger keeps its rhythm no matter when it is evaluated.
    pub fn next_fire_time(
        &self,
        start_time: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        match &self.kind {
            ScheduleKind::Interval(interval) => {
                if after < start_time {
                    return Ok(start_time);
                }
                let interval_ms = interval_millis(*interval)?;
                let elapsed_ms = (after - start_time).num_milliseconds();
                let k = elapsed_ms / interval_ms + 1;
                k.checked_mul(interval_ms)
                    .and_then(|ms| start_time.checked_add_signed(TimeDelta::milliseconds(ms)))
                    .ok_or(ScheduleError::NoMoreOccurrences)
            }
            ScheduleKind::Cron(_) => self.next_after(after),
        }
    }

    /// Get the next occurrence after the given time.
    ///
    /// For interval schedules this is simply `after + interval`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match &self.kind {
            ScheduleKind::Cron(entries) => {
                let local_time = after.with_timezone(&self.timezone);
                entries
                    .iter()
                    .filter_map(|entry| entry.schedule.after(&local_time).next())
                    .map(|dt| dt.with_timezone(&Utc))
                    .min()
                    .ok_or(ScheduleError::NoMoreOccurrences)
            }
            ScheduleKind::Interval(interval) => {
                let delta = TimeDelta::from_std(*interval)
                    .map_err(|e| ScheduleError::InvalidInterval(e.to_string()))?;
                after
                    .checked_add_signed(delta)
                    .ok_or(ScheduleError::NoMoreOccurrences)
            }
        }
    }

    /// Get the next N occurrences after the given time.
    pub fn next_n_after(
        &self,
        after: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
        let mut results = Vec::with_capacity(n);
        let mut current = after;
        for _ in 0..n {
            match self.next_after(current) {
                Ok(next) => {
                    results.push(next);
                    current = next;
                }
                Err(ScheduleError::NoMoreOccurrences) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    /// Human-readable description, used in logs and listings.
    pub fn expression(&self) -> String {
        match &self.kind {
            ScheduleKind::Interval(interval) => format!("every {}ms", interval.as_millis()),
            ScheduleKind::Cron(entries) => entries
                .iter()
                .map(|e| e.expression.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        }
    }

    /// The interval, for interval schedules.
    pub fn interval_duration(&self) -> Option<Duration> {
        match &self.kind {
            ScheduleKind::Interval(interval) => Some(*interval),
            ScheduleKind::Cron(_) => None,
        }
    }

    /// The cron expressions, for cron schedules.
    pub fn cron_expressions(&self) -> Vec<&str> {
        match &self.kind {
            ScheduleKind::Interval(_) => Vec::new(),
            ScheduleKind::Cron(entries) => entries.iter().map(|e| e.expression.as_str()).collect(),
        }
    }

    /// The initial delay, if any.
    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    /// The timezone name.
    pub fn timezone(&self) -> &str {
        self.timezone.name()
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        let same_kind = match (&self.kind, &other.kind) {
            (ScheduleKind::Interval(a), ScheduleKind::Interval(b)) => a == b,
            (ScheduleKind::Cron(a), ScheduleKind::Cron(b)) => a
                .iter()
                .map(|e| &e.expression)
                .eq(b.iter().map(|e| &e.expression)),
            _ => false,
        };
        same_kind && self.timezone == other.timezone && self.delay == other.delay
    }
}

fn interval_millis(interval: Duration) -> Result<i64, ScheduleError> {
    let ms = i64::try_from(interval.as_millis())
        .map_err(|_| ScheduleError::InvalidInterval(format!("{:?}", interval)))?;
    if ms <= 0 {
        return Err(ScheduleError::InvalidInterval(format!("{:?}", interval)));
    }
    Ok(ms)
}

/// Parse a duration string like "100ms", "5m", "1h", "1h30m", "30s".
pub fn parse_duration(s: &str) -> Result<Duration, ScheduleError> {
    let trimmed = s.trim();
    let mut total_ms: u64 = 0;
    let mut current_num = String::new();
    let mut current_unit = String::new();

    let mut flush = |num: &mut String, unit: &mut String| -> Result<(), ScheduleError> {
        let value: u64 = num
            .parse()
            .map_err(|_| ScheduleError::InvalidInterval(trimmed.to_string()))?;
        let factor = match unit.as_str() {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 604_800_000,
            _ => return Err(ScheduleError::InvalidInterval(trimmed.to_string())),
        };
        total_ms = value
            .checked_mul(factor)
            .and_then(|v| total_ms.checked_add(v))
            .ok_or_else(|| ScheduleError::InvalidInterval(trimmed.to_string()))?;
        num.clear();
        unit.clear();
        Ok(())
    };

    for c in trimmed.chars() {
        if c.is_ascii_digit() {
            if !current_unit.is_empty() {
                flush(&mut current_num, &mut current_unit)?;
            }
            current_num.push(c);
        } else if c.is_ascii_alphabetic() {
            current_unit.push(c.to_ascii_lowercase());
        } else {
            return Err(ScheduleError::InvalidInterval(trimmed.to_string()));
        }
    }

    if current_num.is_empty() || current_unit.is_empty() {
        return Err(ScheduleError::InvalidInterval(trimmed.to_string()));
    }
    flush(&mut current_num, &mut current_unit)?;

    if total_ms == 0 {
        return Err(ScheduleError::InvalidInterval(trimmed.to_string()));
    }

    Ok(Duration::from_millis(total_ms))
}

fn parse_cron_entry(expression: &str) -> Result<CronEntry, ScheduleError> {
    let trimmed = expression.trim();
    let normalized = expand_shortcut(trimmed)?;

    // Quartz-style `?` means "no specific value"; the cron crate wants `*`.
    let normalized = normalized.replace('?', "*");
    let fields: Vec<&str> = normalized.split_whitespace().collect();

    let cron_expr = match fields.len() {
        5 => format!("0 {}", normalized),
        6 | 7 => normalized.clone(),
        n => {
            return Err(ScheduleError::InvalidCron(format!(
                "expected 5, 6 or 7 fields, got {} in '{}'",
                n, trimmed
            )));
        }
    };

    let schedule = CronSchedule::from_str(&cron_expr)
        .map_err(|e| ScheduleError::InvalidCron(format!("{}: {}", trimmed, e)))?;

    Ok(CronEntry {
        expression: trimmed.to_string(),
        schedule: Box::new(schedule),
    })
}

fn expand_shortcut(expression: &str) -> Result<String, ScheduleError> {
    if !expression.starts_with('@') {
        return Ok(expression.to_string());
    }

    let expanded = match expression.to_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * SUN",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        _ => {
            return Err(ScheduleError::InvalidCron(format!(
                "unknown shortcut: {}",
                expression
            )));
        }
    };
    Ok(expanded.to_string())
}
