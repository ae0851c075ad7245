//! Weight-budgeted task dispatch.

pub mod queue;
pub mod task;

pub use queue::{DependencyPolicy, QueueConfig, QueueError, TaskQueue, TaskQueueHandle};
pub use task::{Task, TaskOutcome};
