//! Work-item model and the `WorkUnit` trait.
//!
//! A `WorkItem` is the immutable description of a unit of work: the callable
//! reference, its arguments, grouping tags, a concurrency weight, its
//! declared dependencies, and lifecycle-event hooks. The `WorkUnit` trait is
//! the executable side; implement it to define what a callable reference
//! actually does.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use super::report::{CallReport, TaskState};
use super::types::TaskId;

/// Errors returned by a work function.
#[derive(Debug, Error)]
pub enum WorkError {
    /// Execution failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Execution observed the cancel signal and stopped.
    #[error("execution canceled")]
    Canceled,

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Lifecycle events a work item can register hooks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// Task was added to the dispatcher's waiting set.
    Enqueue,
    /// Task was removed from the dispatcher.
    Dequeue,
    /// Task's work function is about to execute.
    Run,
    /// Task finished successfully.
    Succeeded,
    /// Task finished in a failure state.
    Failed,
    /// Task was canceled.
    Canceled,
    /// Task reached any terminal state. Fires after the state-specific event.
    Complete,
}

/// A lifecycle callback. Invoked with the work item and its current report.
pub type LifecycleHook = Arc<dyn Fn(&WorkItem, &CallReport) + Send + Sync>;

/// Ordered hook registrations per lifecycle event.
///
/// Hooks are in-process callbacks and are never persisted; a work item
/// deserialized from storage starts with an empty registry.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    hooks: HashMap<LifecycleEvent, Vec<LifecycleHook>>,
}

impl LifecycleHooks {
    /// Register a hook for an event, after any already registered.
    pub fn register(&mut self, event: LifecycleEvent, hook: LifecycleHook) {
        self.hooks.entry(event).or_default().push(hook);
    }

    /// The hooks registered for an event, in registration order.
    pub fn get(&self, event: LifecycleEvent) -> &[LifecycleHook] {
        self.hooks.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    /// Whether no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("registered", &self.len())
            .finish()
    }
}

/// Immutable description of a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Process-unique identifier.
    pub id: TaskId,
    /// Callable reference name, resolved to a `WorkUnit` by the caller.
    pub call: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: HashMap<String, Value>,
    /// Grouping/lookup labels.
    pub tags: Vec<String>,
    /// Cost charged against the dispatcher's concurrency budget.
    pub weight: u32,
    /// Upstream work-item id to the set of terminal states it may finish in
    /// without skipping this item.
    pub dependencies: HashMap<TaskId, HashSet<TaskState>>,
    /// Lifecycle-event callbacks. Not serialized.
    #[serde(skip)]
    pub hooks: LifecycleHooks,
}

impl WorkItem {
    /// Create a work item for the named callable with default weight 1.
    pub fn new(call: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            call: call.into(),
            args: Vec::new(),
            kwargs: HashMap::new(),
            tags: Vec::new(),
            weight: 1,
            dependencies: HashMap::new(),
            hooks: LifecycleHooks::default(),
        }
    }

    /// Set the positional arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Set a keyword argument.
    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set the concurrency weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Declare a dependency on an upstream work item, accepting the given
    /// terminal states.
    pub fn with_dependency(
        mut self,
        upstream: TaskId,
        accepted: impl IntoIterator<Item = TaskState>,
    ) -> Self {
        self.dependencies
            .insert(upstream, accepted.into_iter().collect());
        self
    }

    /// Register a lifecycle hook.
    pub fn with_hook(mut self, event: LifecycleEvent, hook: LifecycleHook) -> Self {
        self.hooks.register(event, hook);
        self
    }
}

/// Per-execution context handed to a work function.
///
/// Carries the work item's arguments and a cooperative cancellation signal.
/// The engine never interrupts a running work function; observing the signal
/// and stopping early is the work function's own responsibility.
pub struct WorkContext {
    /// Positional arguments from the work item.
    pub args: Vec<Value>,
    /// Keyword arguments from the work item.
    pub kwargs: HashMap<String, Value>,
    cancel: watch::Receiver<bool>,
}

impl WorkContext {
    /// Build a context from a work item and a cancel receiver.
    pub fn new(item: &WorkItem, cancel: watch::Receiver<bool>) -> Self {
        Self {
            args: item.args.clone(),
            kwargs: item.kwargs.clone(),
            cancel,
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Wait until cancellation is requested.
    pub async fn canceled(&mut self) {
        // wait_for returns Err only if the sender is dropped, which means the
        // task is gone and the work function is being abandoned anyway.
        let _ = self.cancel.wait_for(|c| *c).await;
    }
}

/// The executable side of a work item.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    /// Execute the unit of work.
    ///
    /// Returns the result value on success. Errors are recorded in the call
    /// report and drive the task into the `Failed` state.
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Value, WorkError>;
}
