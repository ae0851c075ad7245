//! The scheduler: polls for due schedules and resubmits their work items.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::coordinator::Coordinator;
use crate::core::{Recurrence, ScheduleId, TaskId, TaskState, WorkItem};
use crate::storage::{Storage, StorageError};

use super::{
    schedule_tag, ScheduleOptions, ScheduleReport, ScheduleUpdates, ScheduledCall, SchedulerError,
};

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due schedules are looked up.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

struct SchedulerInner<S> {
    storage: S,
    coordinator: Arc<dyn Coordinator>,
    config: SchedulerConfig,
    /// Schedules whose previous submission has not completed yet.
    in_flight: Mutex<HashSet<ScheduleId>>,
    shutdown: watch::Sender<bool>,
}

/// Manages recurring schedules and resubmits their work items when due.
///
/// Cheap to clone; clones share the same storage and in-flight state.
pub struct Scheduler<S> {
    inner: Arc<SchedulerInner<S>>,
}

impl<S> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Storage> Scheduler<S> {
    pub fn new(storage: S, coordinator: Arc<dyn Coordinator>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                storage,
                coordinator,
                config: SchedulerConfig::default(),
                in_flight: Mutex::new(HashSet::new()),
                shutdown,
            }),
        }
    }

    /// Set the poll interval. Only effective before the scheduler is cloned
    /// or started.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.config.poll_interval = interval;
        }
        self
    }

    /// Spawn the poll loop. `stop` signals it; await the handle to join.
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            info!(
                interval_secs = scheduler.inner.config.poll_interval.as_secs_f64(),
                "scheduler started"
            );
            let mut ticker = tokio::time::interval(scheduler.inner.config.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = scheduler.poll_once().await {
                            error!(%err, "schedule poll failed");
                        }
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("scheduler stopped");
        })
    }

    pub fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    /// Create a schedule. Returns `Ok(None)` without persisting anything
    /// when the recurrence yields no run at all (e.g. `R0/...`).
    pub async fn add(
        &self,
        work_item: WorkItem,
        schedule: &str,
        options: ScheduleOptions,
    ) -> Result<Option<ScheduleId>, SchedulerError> {
        options.validate()?;
        let recurrence: Recurrence = schedule.parse()?;
        let now = Utc::now();

        let mut record = ScheduledCall {
            id: ScheduleId::new(),
            work_item,
            schedule: schedule.to_string(),
            failure_threshold: options.failure_threshold,
            consecutive_failures: 0,
            remaining_runs: recurrence.runs.map(|r| r as i64),
            enabled: options.enabled,
            first_run: recurrence.first_run(now),
            last_run: options.last_run,
            next_run: recurrence.first_run(now),
        };

        match record.calculate_next_run(now)? {
            None => Ok(None),
            Some(next) => {
                record.next_run = next;
                let id = record.id;
                self.inner.storage.insert_schedule(record).await?;
                info!(%id, %schedule, "schedule added");
                Ok(Some(id))
            }
        }
    }

    /// Apply a set of field updates. A changed recurrence re-derives
    /// `remaining_runs` from its `R` count unless the update supplies one
    /// explicitly; `next_run` is deliberately left alone and corrects
    /// itself after the next run.
    pub async fn update(
        &self,
        id: ScheduleId,
        updates: ScheduleUpdates,
    ) -> Result<(), SchedulerError> {
        updates.validate()?;
        let mut record = self
            .inner
            .storage
            .get_schedule(&id)
            .await?
            .ok_or(SchedulerError::MissingResource(id))?;

        if let Some(item) = updates.work_item {
            record.work_item = item;
        }
        if let Some(schedule) = updates.schedule {
            let recurrence: Recurrence = schedule.parse()?;
            record.schedule = schedule;
            if updates.remaining_runs.is_none() {
                record.remaining_runs = recurrence.runs.map(|r| r as i64);
            }
        }
        if let Some(threshold) = updates.failure_threshold {
            record.failure_threshold = threshold;
        }
        if let Some(runs) = updates.remaining_runs {
            record.remaining_runs = runs;
        }
        if let Some(enabled) = updates.enabled {
            record.enabled = enabled;
        }

        self.write_back(id, record).await?;
        info!(%id, "schedule updated");
        Ok(())
    }

    pub async fn remove(&self, id: ScheduleId) -> Result<(), SchedulerError> {
        self.inner
            .storage
            .get_schedule(&id)
            .await?
            .ok_or(SchedulerError::MissingResource(id))?;
        self.inner.storage.delete_schedule(&id).await?;
        info!(%id, "schedule removed");
        Ok(())
    }

    pub async fn enable(&self, id: ScheduleId) -> Result<(), SchedulerError> {
        self.set_enabled(id, true).await
    }

    pub async fn disable(&self, id: ScheduleId) -> Result<(), SchedulerError> {
        self.set_enabled(id, false).await
    }

    pub async fn get(&self, id: ScheduleId) -> Result<ScheduleReport, SchedulerError> {
        self.inner
            .storage
            .get_schedule(&id)
            .await?
            .map(ScheduleReport::from)
            .ok_or(SchedulerError::MissingResource(id))
    }

    /// Schedules whose work item carries all the given tags.
    pub async fn find(&self, tags: &[String]) -> Result<Vec<ScheduleReport>, SchedulerError> {
        let found = self.inner.storage.find_schedules_by_tags(tags).await?;
        Ok(found.into_iter().map(ScheduleReport::from).collect())
    }

    pub async fn list(&self) -> Result<Vec<ScheduleReport>, SchedulerError> {
        let all = self.inner.storage.list_schedules().await?;
        Ok(all.into_iter().map(ScheduleReport::from).collect())
    }

    /// One pass over due schedules. Returns how many were submitted.
    pub async fn poll_once(&self) -> Result<usize, SchedulerError> {
        let now = Utc::now();
        let due = self.inner.storage.due_schedules(now).await?;
        debug!(count = due.len(), "due schedules");

        let mut submitted = 0;
        for schedule in due {
            let id = schedule.id;
            if !schedule.enabled {
                // Disabled schedules skip missed runs; re-enabling resumes
                // from the current time.
                if let Err(err) = self.advance_disabled(schedule, now).await {
                    error!(%id, %err, "failed to advance disabled schedule");
                }
                continue;
            }
            if !self.inner.in_flight.lock().await.insert(id) {
                debug!(%id, "previous run still in flight, skipping");
                continue;
            }
            self.submit(schedule);
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Submit a due schedule's work item and spawn the run bookkeeping.
    fn submit(&self, schedule: ScheduledCall) {
        let id = schedule.id;
        let scheduled_time = schedule.next_run;
        let mut item = schedule.work_item;
        item.id = TaskId::new();
        let tag = schedule_tag(id);
        if !item.tags.contains(&tag) {
            item.tags.push(tag);
        }

        debug!(schedule = %id, task = %item.id, call = %item.call, "submitting scheduled call");
        let this = self.clone();
        tokio::spawn(async move {
            let state = match this.inner.coordinator.execute(item).await {
                Ok(report) => report.state,
                Err(err) => {
                    error!(schedule = %id, %err, "scheduled submission failed");
                    TaskState::Error
                }
            };
            if let Err(err) = this.complete_scheduled_run(id, scheduled_time, state).await {
                error!(schedule = %id, %err, "run bookkeeping failed");
            }
            this.inner.in_flight.lock().await.remove(&id);
        });
    }

    /// Apply run bookkeeping after a scheduled submission completed.
    async fn complete_scheduled_run(
        &self,
        id: ScheduleId,
        scheduled_time: DateTime<Utc>,
        state: TaskState,
    ) -> Result<(), SchedulerError> {
        let now = Utc::now();
        let Some(mut record) = self.inner.storage.get_schedule(&id).await? else {
            debug!(%id, "schedule deleted mid-run, abandoning bookkeeping");
            return Ok(());
        };

        // The scheduled time, not the actual one, keeps the run grid stable.
        record.last_run = Some(scheduled_time);
        if state.is_failure() {
            record.consecutive_failures += 1;
            if let Some(threshold) = record.failure_threshold {
                if record.enabled && record.consecutive_failures >= threshold {
                    record.enabled = false;
                    error!(
                        %id,
                        failures = record.consecutive_failures,
                        "schedule disabled after consecutive failures"
                    );
                }
            }
        } else {
            record.consecutive_failures = 0;
        }
        if let Some(runs) = record.remaining_runs.as_mut() {
            *runs -= 1;
        }

        match record.calculate_next_run(now)? {
            None => {
                self.inner.storage.delete_schedule(&id).await?;
                info!(%id, "schedule exhausted, deleted");
            }
            Some(next) => {
                record.next_run = next;
                self.write_back(id, record).await?;
            }
        }
        Ok(())
    }

    /// Advance a disabled schedule's next run past `now` without running it.
    async fn advance_disabled(
        &self,
        mut record: ScheduledCall,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let id = record.id;
        match record.calculate_next_run(now)? {
            None => {
                self.inner.storage.delete_schedule(&id).await?;
            }
            Some(mut next) => {
                if next <= now {
                    let recurrence: Recurrence = record.schedule.parse()?;
                    while next <= now {
                        next = recurrence.interval.add_to(next);
                    }
                }
                record.next_run = next;
                self.write_back(id, record).await?;
            }
        }
        Ok(())
    }

    async fn set_enabled(&self, id: ScheduleId, enabled: bool) -> Result<(), SchedulerError> {
        let mut record = self
            .inner
            .storage
            .get_schedule(&id)
            .await?
            .ok_or(SchedulerError::MissingResource(id))?;
        record.enabled = enabled;
        self.write_back(id, record).await?;
        info!(%id, enabled, "schedule toggled");
        Ok(())
    }

    /// Whole-record update; a record deleted underneath us surfaces as
    /// `MissingResource`.
    async fn write_back(&self, id: ScheduleId, record: ScheduledCall) -> Result<(), SchedulerError> {
        match self.inner.storage.update_schedule(record).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound(_)) => Err(SchedulerError::MissingResource(id)),
            Err(err) => Err(err.into()),
        }
    }
}
