//! conveyor: a concurrency-budgeted task dispatcher and recurring-schedule
//! engine.
//!
//! Two engines share a small core vocabulary:
//!
//! - [`dispatch::TaskQueue`] admits queued work items against a total
//!   concurrency-weight budget, honoring inter-task dependencies, and runs
//!   their work functions in spawned tokio tasks.
//! - [`scheduler::Scheduler`] resubmits templated work items on an ISO 8601
//!   recurring interval, tracking consecutive failures and auto-disabling
//!   schedules that keep failing.
//!
//! Both persist their records through the pluggable [`storage::Storage`]
//! trait; [`storage::InMemoryStorage`] is the default backend and a sqlite
//! backend is available behind the `sqlite` feature.
//!
//! ```no_run
//! use std::sync::Arc;
//! use conveyor::core::{WorkContext, WorkError, WorkItem, WorkUnit};
//! use conveyor::dispatch::{Task, TaskQueue};
//! use conveyor::storage::InMemoryStorage;
//!
//! struct SyncRepo;
//!
//! #[async_trait::async_trait]
//! impl WorkUnit for SyncRepo {
//!     async fn execute(
//!         &self,
//!         _ctx: &mut WorkContext,
//!     ) -> Result<serde_json::Value, WorkError> {
//!         Ok(serde_json::json!("synced"))
//!     }
//! }
//!
//! # async fn demo() -> Result<(), conveyor::dispatch::QueueError> {
//! let (queue, _worker) = TaskQueue::new(InMemoryStorage::new()).start();
//! let (task, done) = Task::new(WorkItem::new("sync_repo").with_weight(2), Arc::new(SyncRepo));
//! queue.enqueue(task).await?;
//! let report = done.await.expect("queue dropped the task");
//! println!("{:?}", report.state);
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod core;
pub mod dispatch;
pub mod scheduler;
pub mod storage;

pub use coordinator::{Coordinator, CoordinatorError};
pub use core::{CallReport, TaskId, TaskState, WorkItem, WorkUnit};
pub use dispatch::{TaskQueue, TaskQueueHandle};
pub use scheduler::{ScheduleOptions, ScheduleUpdates, Scheduler, SchedulerError};
pub use storage::{InMemoryStorage, Storage};
