//! Shared helpers for the integration suite.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use conveyor::coordinator::{Coordinator, CoordinatorError};
use conveyor::core::{CallReport, TaskId, TaskState, WorkContext, WorkError, WorkItem, WorkUnit};
use conveyor::dispatch::{Task, TaskQueueHandle};

pub const TICK: Duration = Duration::from_millis(10);

/// Route engine tracing through the test harness, honoring `RUST_LOG`.
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Succeeds immediately.
pub struct Instant;

#[async_trait]
impl WorkUnit for Instant {
    async fn execute(&self, _ctx: &mut WorkContext) -> Result<Value, WorkError> {
        Ok(json!("done"))
    }
}

/// Fails immediately.
pub struct Failing;

#[async_trait]
impl WorkUnit for Failing {
    async fn execute(&self, _ctx: &mut WorkContext) -> Result<Value, WorkError> {
        Err(WorkError::ExecutionFailed("simulated failure".to_string()))
    }
}

/// Runs until its gate opens, then succeeds.
pub struct Gated {
    gate: watch::Receiver<bool>,
}

impl Gated {
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { gate: rx })
    }
}

#[async_trait]
impl WorkUnit for Gated {
    async fn execute(&self, _ctx: &mut WorkContext) -> Result<Value, WorkError> {
        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;
        Ok(json!("released"))
    }
}

/// Coordinator that resolves call names against a registry and runs the
/// work on a task queue, resolving to the final report.
pub struct QueueCoordinator {
    queue: TaskQueueHandle,
    registry: HashMap<String, Arc<dyn WorkUnit>>,
}

impl QueueCoordinator {
    pub fn new(queue: TaskQueueHandle) -> Self {
        Self {
            queue,
            registry: HashMap::new(),
        }
    }

    pub fn register(mut self, call: impl Into<String>, work: Arc<dyn WorkUnit>) -> Self {
        self.registry.insert(call.into(), work);
        self
    }
}

#[async_trait]
impl Coordinator for QueueCoordinator {
    async fn execute(&self, item: WorkItem) -> Result<CallReport, CoordinatorError> {
        let work = self
            .registry
            .get(&item.call)
            .cloned()
            .ok_or_else(|| CoordinatorError::Rejected(format!("unknown call: {}", item.call)))?;
        let (task, done) = Task::new(item, work);
        self.queue
            .enqueue(task)
            .await
            .map_err(|err| CoordinatorError::Rejected(err.to_string()))?;
        done.await.map_err(|_| CoordinatorError::Unavailable)
    }
}

/// Poll the queue until the task reports the wanted state.
pub async fn wait_for_task_state(
    queue: &TaskQueueHandle,
    id: TaskId,
    state: TaskState,
) -> CallReport {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(report) = queue.get(&id).await.unwrap() {
            if report.state == state {
                return report;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for task {id} to reach {state:?}"
        );
        sleep(TICK).await;
    }
}
