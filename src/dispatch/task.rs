//! Runtime pairing of a work item with its executable and report.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::warn;

use crate::core::{
    CallReport, LifecycleEvent, TaskId, TaskState, WorkContext, WorkError, WorkItem, WorkUnit,
};

/// How a work function's execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(Value),
    Failed(String),
    /// The work function panicked or was otherwise lost by the runtime.
    Error(String),
    Canceled,
}

/// A work item tracked by the dispatcher, with its executable, live report,
/// cancel signal, and completion channel.
pub struct Task {
    pub item: WorkItem,
    pub work: Arc<dyn WorkUnit>,
    pub report: CallReport,
    cancel: watch::Sender<bool>,
    completion: Option<oneshot::Sender<CallReport>>,
}

impl Task {
    /// Wrap a work item and its executable. The returned receiver resolves
    /// with the final report exactly once, when the task reaches a terminal
    /// state.
    pub fn new(item: WorkItem, work: Arc<dyn WorkUnit>) -> (Self, oneshot::Receiver<CallReport>) {
        let report = CallReport::new(item.id, &item.call, item.tags.clone());
        let (cancel, _) = watch::channel(false);
        let (completion_tx, completion_rx) = oneshot::channel();
        (
            Self {
                item,
                work,
                report,
                cancel,
                completion: Some(completion_tx),
            },
            completion_rx,
        )
    }

    pub fn id(&self) -> TaskId {
        self.item.id
    }

    /// Build the execution context handed to the work function.
    pub fn context(&self) -> WorkContext {
        WorkContext::new(&self.item, self.cancel.subscribe())
    }

    /// Raise the cooperative cancel signal. The work function decides
    /// whether and when to honor it.
    pub fn request_cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Run the hooks registered for an event.
    pub fn fire(&self, event: LifecycleEvent) {
        for hook in self.item.hooks.get(event) {
            hook(&self.item, &self.report);
        }
    }

    /// Mark the report running and fire the `Run` hooks.
    pub fn start_running(&mut self) {
        self.report.mark_running();
        self.fire(LifecycleEvent::Run);
    }

    /// Drive the task to a terminal state: update the report, fire the
    /// state-specific hooks then `Complete`, and deliver the final report.
    /// A task already terminal is left untouched.
    pub fn complete(&mut self, outcome: TaskOutcome) {
        if self.report.state.is_terminal() {
            return;
        }

        let event = match outcome {
            TaskOutcome::Succeeded(result) => {
                self.report.mark_succeeded(result);
                LifecycleEvent::Succeeded
            }
            TaskOutcome::Failed(error) => {
                self.report.mark_failed(error);
                LifecycleEvent::Failed
            }
            TaskOutcome::Error(error) => {
                self.report.mark_error(error);
                LifecycleEvent::Failed
            }
            TaskOutcome::Canceled => {
                self.report.mark_canceled();
                LifecycleEvent::Canceled
            }
        };
        self.fire(event);
        self.fire(LifecycleEvent::Complete);

        if let Some(tx) = self.completion.take() {
            if tx.send(self.report.clone()).is_err() {
                warn!(id = %self.id(), "completion receiver dropped before task finished");
            }
        }
    }

    /// Mark the task skipped because a dependency finished in an unaccepted
    /// state. Terminal handling matches `complete`.
    pub fn skip(&mut self, reason: impl Into<String>) {
        if self.report.state.is_terminal() {
            return;
        }
        self.report.mark_skipped(Some(reason.into()));
        self.fire(LifecycleEvent::Complete);
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(self.report.clone());
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.item.id)
            .field("call", &self.item.call)
            .field("state", &self.report.state)
            .finish()
    }
}

/// Execute a task's work function and report how it ended.
///
/// The work function runs in its own spawned task so a panic is contained
/// and surfaced as `TaskOutcome::Error` instead of taking the caller down.
pub async fn execute_work(work: Arc<dyn WorkUnit>, mut ctx: WorkContext) -> TaskOutcome {
    let handle = tokio::spawn(async move { work.execute(&mut ctx).await });
    match handle.await {
        Ok(Ok(result)) => TaskOutcome::Succeeded(result),
        Ok(Err(WorkError::Canceled)) => TaskOutcome::Canceled,
        Ok(Err(err)) => TaskOutcome::Failed(err.to_string()),
        Err(join_err) => TaskOutcome::Error(format!("work function aborted: {join_err}")),
    }
}
