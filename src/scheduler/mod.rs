//! Recurring schedules: the persisted record, its report view, tag
//! correlation helpers, and validation.

pub mod engine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Recurrence, RecurrenceError, ScheduleId, WorkItem};
use crate::storage::StorageError;

pub use engine::{Scheduler, SchedulerConfig};

/// Tag prefix linking a submitted work item back to its schedule.
const SCHEDULE_TAG_PREFIX: &str = "schedule:";

/// The correlation tag for a schedule id.
pub fn schedule_tag(id: ScheduleId) -> String {
    format!("{SCHEDULE_TAG_PREFIX}{id}")
}

/// Extract the schedule id from a tag list, if one is present.
pub fn extract_schedule_id(tags: &[String]) -> Option<ScheduleId> {
    tags.iter().find_map(|tag| {
        let raw = tag.strip_prefix(SCHEDULE_TAG_PREFIX)?;
        raw.parse::<uuid::Uuid>().ok().map(ScheduleId::from_uuid)
    })
}

/// Errors from scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A supplied value failed validation.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// No schedule exists with the given id.
    #[error("schedule not found: {0}")]
    MissingResource(ScheduleId),

    /// The underlying store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<RecurrenceError> for SchedulerError {
    fn from(err: RecurrenceError) -> Self {
        SchedulerError::InvalidValue {
            field: "schedule",
            reason: err.to_string(),
        }
    }
}

/// Optional settings for a new schedule.
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    /// Consecutive failures tolerated before the schedule is disabled.
    pub failure_threshold: Option<u32>,
    /// Seed the last-run time, e.g. when importing an existing schedule.
    pub last_run: Option<DateTime<Utc>>,
    /// Whether the schedule starts enabled.
    pub enabled: bool,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            failure_threshold: None,
            last_run: None,
            enabled: true,
        }
    }
}

impl ScheduleOptions {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.failure_threshold == Some(0) {
            return Err(SchedulerError::InvalidValue {
                field: "failure_threshold",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Field whitelist for `Scheduler::update`. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdates {
    pub work_item: Option<WorkItem>,
    pub schedule: Option<String>,
    /// `Some(None)` clears the threshold.
    pub failure_threshold: Option<Option<u32>>,
    /// `Some(None)` makes the schedule unbounded.
    pub remaining_runs: Option<Option<i64>>,
    pub enabled: Option<bool>,
}

impl ScheduleUpdates {
    pub fn with_work_item(mut self, item: WorkItem) -> Self {
        self.work_item = Some(item);
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn with_failure_threshold(mut self, threshold: Option<u32>) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    pub fn with_remaining_runs(mut self, runs: Option<i64>) -> Self {
        self.remaining_runs = Some(runs);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if let Some(schedule) = &self.schedule {
            schedule.parse::<Recurrence>()?;
        }
        if self.failure_threshold == Some(Some(0)) {
            return Err(SchedulerError::InvalidValue {
                field: "failure_threshold",
                reason: "must be greater than zero".to_string(),
            });
        }
        if let Some(Some(runs)) = self.remaining_runs {
            if runs < 0 {
                return Err(SchedulerError::InvalidValue {
                    field: "remaining_runs",
                    reason: "must not be negative".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Persisted template for a recurring submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledCall {
    pub id: ScheduleId,
    /// Work item cloned and resubmitted each run. Stored without hooks.
    pub work_item: WorkItem,
    /// ISO 8601 recurring-interval expression, validated on write.
    pub schedule: String,
    /// Consecutive failures tolerated before auto-disable.
    pub failure_threshold: Option<u32>,
    pub consecutive_failures: u32,
    /// Runs left when the recurrence caps them.
    pub remaining_runs: Option<i64>,
    pub enabled: bool,
    /// One period past the configured start (or creation time).
    pub first_run: DateTime<Utc>,
    /// Scheduled time of the most recent run.
    pub last_run: Option<DateTime<Utc>>,
    /// When the schedule is next due.
    pub next_run: DateTime<Utc>,
}

impl ScheduledCall {
    /// Whether this schedule's work item carries all the given tags.
    pub fn matches_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.work_item.tags.contains(t))
    }

    /// When the schedule should run next, or `None` when it has no runs
    /// left and should be deleted.
    ///
    /// Before the first run this is `first_run`. Afterwards the period is
    /// added to `last_run` repeatedly until the result is not in the past,
    /// so missed periods collapse into one catch-up run without drift.
    pub fn calculate_next_run(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, RecurrenceError> {
        if self.remaining_runs == Some(0) {
            return Ok(None);
        }
        let next = match self.last_run {
            None => self.first_run,
            Some(last) => {
                let recurrence: Recurrence = self.schedule.parse()?;
                let mut next = recurrence.interval.add_to(last);
                while next < now {
                    next = recurrence.interval.add_to(next);
                }
                next
            }
        };
        Ok(Some(next))
    }
}

/// Read-only view of a schedule, returned by queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleReport {
    pub id: ScheduleId,
    pub work_item: WorkItem,
    pub schedule: String,
    pub failure_threshold: Option<u32>,
    pub consecutive_failures: u32,
    pub remaining_runs: Option<i64>,
    pub enabled: bool,
    pub first_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
}

impl From<ScheduledCall> for ScheduleReport {
    fn from(call: ScheduledCall) -> Self {
        Self {
            id: call.id,
            work_item: call.work_item,
            schedule: call.schedule,
            failure_threshold: call.failure_threshold,
            consecutive_failures: call.consecutive_failures,
            remaining_runs: call.remaining_runs,
            enabled: call.enabled,
            first_run: call.first_run,
            last_run: call.last_run,
            next_run: call.next_run,
        }
    }
}
