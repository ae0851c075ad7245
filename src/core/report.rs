//! Task state machine and call reports.
//!
//! A `CallReport` is the engine's answer to "what happened to my work item":
//! live state, timestamps, result or failure detail. All query surfaces hand
//! out report copies, never live references into engine state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::types::TaskId;

/// Execution state of a task.
///
/// `Waiting → Running → {Succeeded, Failed, Error, Canceled}`; a waiting task
/// can also move directly to `Skipped` or `Canceled` without ever running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Task is queued, waiting for dependencies and budget.
    Waiting,
    /// Task's work function is executing.
    Running,
    /// Work function returned successfully.
    Succeeded,
    /// Work function returned an error.
    Failed,
    /// Execution was lost (panic or runtime failure).
    Error,
    /// Task was canceled before or during execution.
    Canceled,
    /// Task never ran: an upstream dependency resolved unacceptably,
    /// or it was skipped explicitly.
    Skipped,
}

impl TaskState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Waiting | TaskState::Running)
    }

    /// Whether this state counts as a failed execution for the
    /// scheduler's consecutive-failure policy.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Error)
    }
}

/// Recorded mismatch between a dependency's accepted terminal states and the
/// state it actually finished in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyFailure {
    /// Terminal states the downstream task would have accepted.
    pub expected: Vec<TaskState>,
    /// State the upstream task actually finished in.
    pub actual: TaskState,
}

/// Report of a single task's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallReport {
    /// Id of the work item this report describes.
    pub task_id: TaskId,
    /// Callable reference name from the work item.
    pub call: String,
    /// Current state.
    pub state: TaskState,
    /// Tags copied from the work item.
    pub tags: Vec<String>,
    /// When the work function started executing.
    pub start_time: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub finish_time: Option<DateTime<Utc>>,
    /// Result value on success.
    pub result: Option<Value>,
    /// Failure detail on failure/error/skip.
    pub error: Option<String>,
    /// Upstream dependencies that resolved into non-accepted states.
    pub dependency_failures: HashMap<TaskId, DependencyFailure>,
}

impl CallReport {
    /// Create a waiting report for a work item.
    pub fn new(task_id: TaskId, call: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            task_id,
            call: call.into(),
            state: TaskState::Waiting,
            tags,
            start_time: None,
            finish_time: None,
            result: None,
            error: None,
            dependency_failures: HashMap::new(),
        }
    }

    /// Mark the report as running.
    pub fn mark_running(&mut self) {
        self.state = TaskState::Running;
        self.start_time = Some(Utc::now());
    }

    /// Mark the report as succeeded with a result value.
    pub fn mark_succeeded(&mut self, result: Value) {
        self.state = TaskState::Succeeded;
        self.result = Some(result);
        self.finish_time = Some(Utc::now());
    }

    /// Mark the report as failed with an error message.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.state = TaskState::Failed;
        self.error = Some(error.into());
        self.finish_time = Some(Utc::now());
    }

    /// Mark the report as errored (execution lost).
    pub fn mark_error(&mut self, error: impl Into<String>) {
        self.state = TaskState::Error;
        self.error = Some(error.into());
        self.finish_time = Some(Utc::now());
    }

    /// Mark the report as canceled.
    pub fn mark_canceled(&mut self) {
        self.state = TaskState::Canceled;
        self.finish_time = Some(Utc::now());
    }

    /// Mark the report as skipped with an optional reason.
    pub fn mark_skipped(&mut self, reason: Option<String>) {
        self.state = TaskState::Skipped;
        self.error = reason;
        self.finish_time = Some(Utc::now());
    }

    /// Whether the report carries all of the given tags.
    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }
}
