//! Core identifier types for the dispatch engine.
//!
//! These types provide type-safe identifiers for tasks and schedules.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a unit of work and the task wrapping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

/// Unique identifier for a persisted scheduled call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleId(Uuid);

impl TaskId {
    /// Generate a new random TaskId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a TaskId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleId {
    /// Generate a new random ScheduleId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a ScheduleId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_is_unique() {
        let id1 = TaskId::new();
        let id2 = TaskId::new();

        assert_ne!(id1, id2);
    }

    #[test]
    fn test_task_id_from_uuid() {
        let uuid = Uuid::new_v4();
        let id = TaskId::from_uuid(uuid);

        assert_eq!(id.as_uuid(), &uuid);
    }

    #[test]
    fn test_schedule_id_is_unique() {
        let id1 = ScheduleId::new();
        let id2 = ScheduleId::new();

        assert_ne!(id1, id2);
    }

    #[test]
    fn test_ids_are_hashable() {
        use std::collections::HashSet;

        let id = TaskId::new();
        let mut ids: HashSet<TaskId> = HashSet::new();
        ids.insert(id);
        ids.insert(TaskId::new());
        ids.insert(id); // duplicate

        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_id_display_round_trip() {
        let id = ScheduleId::new();
        let parsed: Uuid = id.to_string().parse().unwrap();

        assert_eq!(&parsed, id.as_uuid());
    }
}
