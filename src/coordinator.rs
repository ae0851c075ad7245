//! Execution boundary the scheduler submits work through.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{CallReport, WorkItem};

/// Errors from accepting or executing a submitted work item.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The coordinator refused the work item.
    #[error("submission rejected: {0}")]
    Rejected(String),

    /// The coordinator is shutting down or gone.
    #[error("coordinator unavailable")]
    Unavailable,
}

/// Accepts work items for execution and resolves to the final report.
///
/// The scheduler only knows this boundary; how the work item is resolved to
/// a work function and run (locally on a `TaskQueue`, or somewhere else
/// entirely) is the embedder's concern.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn execute(&self, item: WorkItem) -> Result<CallReport, CoordinatorError>;
}
