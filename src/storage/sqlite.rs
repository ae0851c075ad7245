//! Sqlite storage backend (`sqlite` feature).
//!
//! Records are serialized to JSON documents; `next_run` and `queued_at` are
//! mirrored into indexed columns (microsecond unix timestamps) so due and
//! ordering queries stay in SQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::core::{ScheduleId, TaskId};
use crate::scheduler::ScheduledCall;

use super::{QueuedCall, Storage, StorageError};

const SCHEMA: &str = include_str!("../../migrations/001_initial_schema.sql");

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if missing) the database at the given sqlite URL and
    /// apply the schema.
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Throwaway in-memory database, mainly for tests.
    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::new("sqlite::memory:").await
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_queued_call(&self, call: QueuedCall) -> Result<(), StorageError> {
        let document = serde_json::to_string(&call)?;
        sqlx::query(
            "INSERT OR REPLACE INTO queued_calls (task_id, document, queued_at) VALUES (?, ?, ?)",
        )
        .bind(call.task_id.to_string())
        .bind(document)
        .bind(call.queued_at.timestamp_micros())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_queued_call(&self, id: &TaskId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM queued_calls WHERE task_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_queued_calls(&self) -> Result<Vec<QueuedCall>, StorageError> {
        let rows = sqlx::query("SELECT document FROM queued_calls ORDER BY queued_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| Ok(serde_json::from_str(row.get::<&str, _>("document"))?))
            .collect()
    }

    async fn insert_schedule(&self, schedule: ScheduledCall) -> Result<(), StorageError> {
        let document = serde_json::to_string(&schedule)?;
        let result = sqlx::query(
            "INSERT INTO scheduled_calls (id, document, next_run, enabled) VALUES (?, ?, ?, ?)",
        )
        .bind(schedule.id.to_string())
        .bind(document)
        .bind(schedule.next_run.timestamp_micros())
        .bind(schedule.enabled)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::DuplicateKey(schedule.id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_schedule(&self, id: &ScheduleId) -> Result<Option<ScheduledCall>, StorageError> {
        let row = sqlx::query("SELECT document FROM scheduled_calls WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Ok(serde_json::from_str(row.get::<&str, _>("document"))?))
            .transpose()
    }

    async fn update_schedule(&self, schedule: ScheduledCall) -> Result<(), StorageError> {
        let document = serde_json::to_string(&schedule)?;
        let result = sqlx::query(
            "UPDATE scheduled_calls SET document = ?, next_run = ?, enabled = ? WHERE id = ?",
        )
        .bind(document)
        .bind(schedule.next_run.timestamp_micros())
        .bind(schedule.enabled)
        .bind(schedule.id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(schedule.id.to_string()));
        }
        Ok(())
    }

    async fn delete_schedule(&self, id: &ScheduleId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM scheduled_calls WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledCall>, StorageError> {
        let rows = sqlx::query(
            "SELECT document FROM scheduled_calls WHERE next_run <= ? ORDER BY next_run ASC",
        )
        .bind(now.timestamp_micros())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| Ok(serde_json::from_str(row.get::<&str, _>("document"))?))
            .collect()
    }

    async fn find_schedules_by_tags(
        &self,
        tags: &[String],
    ) -> Result<Vec<ScheduledCall>, StorageError> {
        // Tags live inside the JSON document; filter after the scan.
        let all = self.list_schedules().await?;
        Ok(all.into_iter().filter(|s| s.matches_tags(tags)).collect())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduledCall>, StorageError> {
        let rows = sqlx::query("SELECT document FROM scheduled_calls")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| Ok(serde_json::from_str(row.get::<&str, _>("document"))?))
            .collect()
    }
}
