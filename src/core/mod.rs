//! Core domain types shared by the dispatcher and the scheduler.

pub mod recurrence;
pub mod report;
pub mod types;
pub mod work_item;

pub use recurrence::{Interval, Recurrence, RecurrenceError};
pub use report::{CallReport, DependencyFailure, TaskState};
pub use types::{ScheduleId, TaskId};
pub use work_item::{
    LifecycleEvent, LifecycleHook, LifecycleHooks, WorkContext, WorkError, WorkItem, WorkUnit,
};
