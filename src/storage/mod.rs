//! Persistence trait and record types.
//!
//! The engine persists two record families: queued calls, so an embedding
//! application can recover and resubmit work after a restart, and scheduled
//! calls, the recurring-submission templates. Backends are pluggable via the
//! `Storage` trait.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ScheduleId, TaskId, WorkItem};
use crate::scheduler::ScheduledCall;

pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

/// Errors from storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("storage lock poisoned")]
    LockPoisoned,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A work item admitted to the dispatcher, persisted until it completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedCall {
    pub task_id: TaskId,
    pub work_item: WorkItem,
    pub queued_at: DateTime<Utc>,
}

impl QueuedCall {
    pub fn new(work_item: &WorkItem) -> Self {
        Self {
            task_id: work_item.id,
            work_item: work_item.clone(),
            queued_at: Utc::now(),
        }
    }
}

/// Pluggable persistence backend.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // Queue records.

    /// Persist a queued call, replacing any record with the same task id.
    async fn save_queued_call(&self, call: QueuedCall) -> Result<(), StorageError>;

    /// Delete a queued call. Deleting an absent record is not an error.
    async fn delete_queued_call(&self, id: &TaskId) -> Result<(), StorageError>;

    /// All persisted queued calls, oldest first.
    async fn list_queued_calls(&self) -> Result<Vec<QueuedCall>, StorageError>;

    // Schedule records.

    /// Insert a new schedule. Fails with `DuplicateKey` if the id exists.
    async fn insert_schedule(&self, schedule: ScheduledCall) -> Result<(), StorageError>;

    async fn get_schedule(&self, id: &ScheduleId) -> Result<Option<ScheduledCall>, StorageError>;

    /// Replace the whole record keyed by its id. Fails with `NotFound` if
    /// the schedule was deleted in the meantime.
    async fn update_schedule(&self, schedule: ScheduledCall) -> Result<(), StorageError>;

    /// Delete a schedule. Deleting an absent record is not an error.
    async fn delete_schedule(&self, id: &ScheduleId) -> Result<(), StorageError>;

    /// Schedules with `next_run` at or before `now`.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledCall>, StorageError>;

    /// Schedules whose work item carries all the given tags.
    async fn find_schedules_by_tags(
        &self,
        tags: &[String],
    ) -> Result<Vec<ScheduledCall>, StorageError>;

    async fn list_schedules(&self) -> Result<Vec<ScheduledCall>, StorageError>;
}

// Engines take ownership of their storage; sharing one backend between an
// engine and its embedder goes through Arc.
#[async_trait]
impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    async fn save_queued_call(&self, call: QueuedCall) -> Result<(), StorageError> {
        (**self).save_queued_call(call).await
    }

    async fn delete_queued_call(&self, id: &TaskId) -> Result<(), StorageError> {
        (**self).delete_queued_call(id).await
    }

    async fn list_queued_calls(&self) -> Result<Vec<QueuedCall>, StorageError> {
        (**self).list_queued_calls().await
    }

    async fn insert_schedule(&self, schedule: ScheduledCall) -> Result<(), StorageError> {
        (**self).insert_schedule(schedule).await
    }

    async fn get_schedule(&self, id: &ScheduleId) -> Result<Option<ScheduledCall>, StorageError> {
        (**self).get_schedule(id).await
    }

    async fn update_schedule(&self, schedule: ScheduledCall) -> Result<(), StorageError> {
        (**self).update_schedule(schedule).await
    }

    async fn delete_schedule(&self, id: &ScheduleId) -> Result<(), StorageError> {
        (**self).delete_schedule(id).await
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledCall>, StorageError> {
        (**self).due_schedules(now).await
    }

    async fn find_schedules_by_tags(
        &self,
        tags: &[String],
    ) -> Result<Vec<ScheduledCall>, StorageError> {
        (**self).find_schedules_by_tags(tags).await
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduledCall>, StorageError> {
        (**self).list_schedules().await
    }
}
