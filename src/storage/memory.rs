//! In-memory storage backend, the default for embedding and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::core::{ScheduleId, TaskId};
use crate::scheduler::ScheduledCall;

use super::{QueuedCall, Storage, StorageError};

/// Hash-map backend behind `RwLock`s. Locks are held only for the duration
/// of each operation.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    queued: RwLock<HashMap<TaskId, QueuedCall>>,
    schedules: RwLock<HashMap<ScheduleId, ScheduledCall>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn save_queued_call(&self, call: QueuedCall) -> Result<(), StorageError> {
        let mut queued = self.queued.write().map_err(|_| StorageError::LockPoisoned)?;
        queued.insert(call.task_id, call);
        Ok(())
    }

    async fn delete_queued_call(&self, id: &TaskId) -> Result<(), StorageError> {
        let mut queued = self.queued.write().map_err(|_| StorageError::LockPoisoned)?;
        queued.remove(id);
        Ok(())
    }

    async fn list_queued_calls(&self) -> Result<Vec<QueuedCall>, StorageError> {
        let queued = self.queued.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut calls: Vec<QueuedCall> = queued.values().cloned().collect();
        calls.sort_by_key(|c| c.queued_at);
        Ok(calls)
    }

    async fn insert_schedule(&self, schedule: ScheduledCall) -> Result<(), StorageError> {
        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if schedules.contains_key(&schedule.id) {
            return Err(StorageError::DuplicateKey(schedule.id.to_string()));
        }
        schedules.insert(schedule.id, schedule);
        Ok(())
    }

    async fn get_schedule(&self, id: &ScheduleId) -> Result<Option<ScheduledCall>, StorageError> {
        let schedules = self
            .schedules
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(schedules.get(id).cloned())
    }

    async fn update_schedule(&self, schedule: ScheduledCall) -> Result<(), StorageError> {
        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        match schedules.get_mut(&schedule.id) {
            Some(existing) => {
                *existing = schedule;
                Ok(())
            }
            None => Err(StorageError::NotFound(schedule.id.to_string())),
        }
    }

    async fn delete_schedule(&self, id: &ScheduleId) -> Result<(), StorageError> {
        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        schedules.remove(id);
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledCall>, StorageError> {
        let schedules = self
            .schedules
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut due: Vec<ScheduledCall> = schedules
            .values()
            .filter(|s| s.next_run <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run);
        Ok(due)
    }

    async fn find_schedules_by_tags(
        &self,
        tags: &[String],
    ) -> Result<Vec<ScheduledCall>, StorageError> {
        let schedules = self
            .schedules
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(schedules
            .values()
            .filter(|s| s.matches_tags(tags))
            .cloned()
            .collect())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduledCall>, StorageError> {
        let schedules = self
            .schedules
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(schedules.values().cloned().collect())
    }
}
