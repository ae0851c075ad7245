//! ISO 8601 recurring-interval expressions.
//!
//! A recurrence is written `[Rn/][start/]P...` where `Rn` caps the number of
//! runs, `start` is an RFC 3339 datetime, and `P...` is an ISO 8601 duration.
//! Examples: `PT30M`, `R3/P1D`, `R5/2026-05-01T00:00:00Z/P1DT12H`.

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from parsing a recurrence expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecurrenceError {
    /// Expression has no duration component.
    #[error("recurrence is missing a duration: '{0}'")]
    MissingDuration(String),

    /// Repeat count is malformed.
    #[error("invalid repeat count: '{0}'")]
    InvalidRepeat(String),

    /// Start datetime is malformed.
    #[error("invalid start datetime: '{0}'")]
    InvalidStart(String),

    /// Duration component is malformed.
    #[error("invalid duration: '{0}'")]
    InvalidDuration(String),

    /// Duration has no fields, so it never advances time.
    #[error("duration is zero: '{0}'")]
    ZeroDuration(String),
}

/// Calendar-aware interval between runs.
///
/// Months and years follow the calendar when added to a timestamp; the
/// remaining fields are exact offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl Interval {
    /// Whether every field is zero.
    pub fn is_zero(&self) -> bool {
        *self == Interval::default()
    }

    /// Add one interval to a timestamp. Calendar fields first, then exact
    /// time fields.
    pub fn add_to(&self, when: DateTime<Utc>) -> DateTime<Utc> {
        let total_months = self.years * 12 + self.months;
        let shifted = when
            .checked_add_months(Months::new(total_months))
            .unwrap_or(when);
        shifted
            + Duration::weeks(i64::from(self.weeks))
            + Duration::days(i64::from(self.days))
            + Duration::hours(i64::from(self.hours))
            + Duration::minutes(i64::from(self.minutes))
            + Duration::seconds(i64::from(self.seconds))
    }
}

/// Parsed recurrence: optional run cap, optional start, and the interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    /// Expression as originally written.
    pub expression: String,
    /// Maximum number of runs, if capped.
    pub runs: Option<u64>,
    /// Explicit start datetime, if given.
    pub start: Option<DateTime<Utc>>,
    /// Interval between runs.
    pub interval: Interval,
}

impl Recurrence {
    /// The first run: the start instant itself when it is still in the
    /// future, otherwise the next on-grid time after `now`.
    pub fn first_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut first = self.start.unwrap_or(now);
        while first <= now {
            first = self.interval.add_to(first);
        }
        first
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for Recurrence {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut runs = None;
        let mut start = None;
        let mut duration_part = None;

        for part in s.split('/') {
            if let Some(count) = part.strip_prefix('R') {
                if runs.is_some() || start.is_some() || duration_part.is_some() {
                    return Err(RecurrenceError::InvalidRepeat(s.to_string()));
                }
                runs = Some(
                    count
                        .parse::<u64>()
                        .map_err(|_| RecurrenceError::InvalidRepeat(part.to_string()))?,
                );
            } else if part.starts_with('P') {
                if duration_part.is_some() {
                    return Err(RecurrenceError::InvalidDuration(s.to_string()));
                }
                duration_part = Some(part);
            } else {
                if start.is_some() || duration_part.is_some() {
                    return Err(RecurrenceError::InvalidStart(part.to_string()));
                }
                let parsed = DateTime::parse_from_rfc3339(part)
                    .map_err(|_| RecurrenceError::InvalidStart(part.to_string()))?;
                start = Some(parsed.with_timezone(&Utc));
            }
        }

        let duration_part =
            duration_part.ok_or_else(|| RecurrenceError::MissingDuration(s.to_string()))?;
        let interval = parse_duration(duration_part)?;
        if interval.is_zero() {
            return Err(RecurrenceError::ZeroDuration(duration_part.to_string()));
        }

        Ok(Recurrence {
            expression: s.to_string(),
            runs,
            start,
            interval,
        })
    }
}

/// Parse an ISO 8601 duration like `P1Y2M3DT4H5M6S`.
fn parse_duration(s: &str) -> Result<Interval, RecurrenceError> {
    let body = s
        .strip_prefix('P')
        .ok_or_else(|| RecurrenceError::InvalidDuration(s.to_string()))?;

    let mut interval = Interval::default();
    let mut in_time = false;
    let mut digits = String::new();

    for ch in body.chars() {
        match ch {
            '0'..='9' => digits.push(ch),
            'T' if digits.is_empty() => {
                if in_time {
                    return Err(RecurrenceError::InvalidDuration(s.to_string()));
                }
                in_time = true;
            }
            _ => {
                let value: u32 = digits
                    .parse()
                    .map_err(|_| RecurrenceError::InvalidDuration(s.to_string()))?;
                digits.clear();
                let field = match (ch, in_time) {
                    ('Y', false) => &mut interval.years,
                    ('M', false) => &mut interval.months,
                    ('W', false) => &mut interval.weeks,
                    ('D', false) => &mut interval.days,
                    ('H', true) => &mut interval.hours,
                    ('M', true) => &mut interval.minutes,
                    ('S', true) => &mut interval.seconds,
                    _ => return Err(RecurrenceError::InvalidDuration(s.to_string())),
                };
                *field = value;
            }
        }
    }

    if !digits.is_empty() {
        return Err(RecurrenceError::InvalidDuration(s.to_string()));
    }
    Ok(interval)
}
