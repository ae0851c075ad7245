//! The task queue: a concurrency-weight-budgeted dispatcher.
//!
//! A single worker task owns the waiting/running/completed collections and
//! receives commands over an mpsc channel, so no lock is ever held while a
//! work function executes. Work functions run in spawned tokio tasks and
//! report back with an internal completion message.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::{CallReport, DependencyFailure, LifecycleEvent, TaskId, TaskState};
use crate::storage::{QueuedCall, Storage, StorageError};

use super::task::{execute_work, Task, TaskOutcome};

const COMMAND_CHANNEL_CAPACITY: usize = 128;

/// Errors from task-queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Declared dependencies name tasks the queue does not know about.
    /// Returned only under `DependencyPolicy::Reject`.
    #[error("task {task_id} depends on unknown tasks: {missing:?}")]
    UnknownDependency {
        task_id: TaskId,
        missing: Vec<TaskId>,
    },

    /// The queue worker is no longer running.
    #[error("task queue is not running")]
    EngineStopped,

    /// The underlying store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What to do with dependency entries naming tasks the queue does not hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Silently drop unknown entries at enqueue. A dependency that already
    /// finished (or never existed) is treated as satisfied.
    #[default]
    Prune,
    /// Fail the enqueue instead.
    Reject,
}

/// Dispatcher tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Total weight of work allowed to run at once.
    pub concurrency_threshold: u32,
    /// How often the dispatch pass runs.
    pub dispatch_interval: Duration,
    /// How long completed reports stay queryable.
    pub completed_cache_life: Duration,
    pub dependency_policy: DependencyPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency_threshold: 9,
            dispatch_interval: Duration::from_millis(500),
            completed_cache_life: Duration::from_secs(20),
            dependency_policy: DependencyPolicy::Prune,
        }
    }
}

enum QueueCommand {
    Enqueue {
        task: Box<Task>,
        respond: oneshot::Sender<Result<(), QueueError>>,
    },
    EnqueueBatch {
        tasks: Vec<Task>,
        respond: oneshot::Sender<Result<(), QueueError>>,
    },
    Dequeue {
        id: TaskId,
        respond: oneshot::Sender<Option<CallReport>>,
    },
    Cancel {
        id: TaskId,
        respond: oneshot::Sender<Option<bool>>,
    },
    Skip {
        id: TaskId,
        respond: oneshot::Sender<bool>,
    },
    Get {
        id: TaskId,
        respond: oneshot::Sender<Option<CallReport>>,
    },
    Find {
        tags: Vec<String>,
        respond: oneshot::Sender<Vec<CallReport>>,
    },
    Waiting {
        respond: oneshot::Sender<Vec<CallReport>>,
    },
    Running {
        respond: oneshot::Sender<Vec<CallReport>>,
    },
    Completed {
        respond: oneshot::Sender<Vec<CallReport>>,
    },
    All {
        respond: oneshot::Sender<Vec<CallReport>>,
    },
    TaskFinished {
        id: TaskId,
        outcome: TaskOutcome,
    },
    Stop {
        clear_pending: bool,
        respond: oneshot::Sender<()>,
    },
}

/// Builder for the dispatcher worker.
pub struct TaskQueue<S> {
    storage: S,
    config: QueueConfig,
}

impl<S: Storage> TaskQueue<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            config: QueueConfig::default(),
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_concurrency_threshold(mut self, threshold: u32) -> Self {
        self.config.concurrency_threshold = threshold;
        self
    }

    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.config.dispatch_interval = interval;
        self
    }

    pub fn with_completed_cache_life(mut self, life: Duration) -> Self {
        self.config.completed_cache_life = life;
        self
    }

    pub fn with_dependency_policy(mut self, policy: DependencyPolicy) -> Self {
        self.config.dependency_policy = policy;
        self
    }

    /// Spawn the worker. The returned handle is cheap to clone; the join
    /// handle resolves once the worker stops.
    pub fn start(self) -> (TaskQueueHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let worker = QueueWorker {
            storage: self.storage,
            config: self.config,
            waiting: Vec::new(),
            running: HashMap::new(),
            running_weight: 0,
            completed: Vec::new(),
            tx: tx.clone(),
            rx,
        };
        let join = tokio::spawn(worker.run());
        (TaskQueueHandle { tx }, join)
    }
}

/// Cloneable handle to a running task queue.
#[derive(Clone)]
pub struct TaskQueueHandle {
    tx: mpsc::Sender<QueueCommand>,
}

impl TaskQueueHandle {
    async fn send_command<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> QueueCommand,
    ) -> Result<T, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| QueueError::EngineStopped)?;
        rx.await.map_err(|_| QueueError::EngineStopped)
    }

    /// Admit a task to the queue. Await the receiver returned by
    /// `Task::new` for the final report.
    pub async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.send_command(|respond| QueueCommand::Enqueue {
            task: Box::new(task),
            respond,
        })
        .await?
    }

    /// Admit several tasks at once. Dependency validation sees the whole
    /// batch, so members may depend on each other regardless of order.
    pub async fn batch_enqueue(&self, tasks: Vec<Task>) -> Result<(), QueueError> {
        self.send_command(|respond| QueueCommand::EnqueueBatch { tasks, respond })
            .await?
    }

    /// Remove a task without completing it. Dependents treat the removed
    /// task as satisfied. Unknown id returns `None`.
    pub async fn dequeue(&self, id: &TaskId) -> Result<Option<CallReport>, QueueError> {
        let id = *id;
        self.send_command(|respond| QueueCommand::Dequeue { id, respond })
            .await
    }

    /// Cancel a task. Waiting tasks complete as `Canceled` immediately;
    /// running tasks get the cooperative cancel signal raised and complete
    /// as `Canceled` without waiting for the work function. Returns `None`
    /// when the task is unknown or already terminal.
    pub async fn cancel(&self, id: &TaskId) -> Result<Option<bool>, QueueError> {
        let id = *id;
        self.send_command(|respond| QueueCommand::Cancel { id, respond })
            .await
    }

    /// Skip a waiting task. Returns false when the task is not waiting.
    pub async fn skip(&self, id: &TaskId) -> Result<bool, QueueError> {
        let id = *id;
        self.send_command(|respond| QueueCommand::Skip { id, respond })
            .await
    }

    pub async fn get(&self, id: &TaskId) -> Result<Option<CallReport>, QueueError> {
        let id = *id;
        self.send_command(|respond| QueueCommand::Get { id, respond })
            .await
    }

    /// Reports for tasks carrying all the given tags.
    pub async fn find(&self, tags: &[String]) -> Result<Vec<CallReport>, QueueError> {
        let tags = tags.to_vec();
        self.send_command(|respond| QueueCommand::Find { tags, respond })
            .await
    }

    pub async fn waiting_tasks(&self) -> Result<Vec<CallReport>, QueueError> {
        self.send_command(|respond| QueueCommand::Waiting { respond })
            .await
    }

    pub async fn running_tasks(&self) -> Result<Vec<CallReport>, QueueError> {
        self.send_command(|respond| QueueCommand::Running { respond })
            .await
    }

    pub async fn completed_tasks(&self) -> Result<Vec<CallReport>, QueueError> {
        self.send_command(|respond| QueueCommand::Completed { respond })
            .await
    }

    /// Snapshot of every known task, ordered completed, running, waiting.
    pub async fn all_tasks(&self) -> Result<Vec<CallReport>, QueueError> {
        self.send_command(|respond| QueueCommand::All { respond })
            .await
    }

    /// Stop the worker. With `clear_pending` the persisted records of
    /// still-waiting tasks are deleted too.
    pub async fn stop(&self, clear_pending: bool) -> Result<(), QueueError> {
        self.send_command(|respond| QueueCommand::Stop {
            clear_pending,
            respond,
        })
        .await
    }
}

struct QueueWorker<S> {
    storage: S,
    config: QueueConfig,
    /// Submission order.
    waiting: Vec<Task>,
    running: HashMap<TaskId, Task>,
    running_weight: u32,
    /// Ascending finish time.
    completed: Vec<CallReport>,
    tx: mpsc::Sender<QueueCommand>,
    rx: mpsc::Receiver<QueueCommand>,
}

impl<S: Storage> QueueWorker<S> {
    async fn run(mut self) {
        info!(
            threshold = self.config.concurrency_threshold,
            "task queue started"
        );
        let mut ticker = tokio::time::interval(self.config.dispatch_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.purge_completed();
                    self.dispatch_ready();
                }
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        info!("task queue stopped");
    }

    /// Returns true when the worker should stop.
    async fn handle_command(&mut self, cmd: QueueCommand) -> bool {
        match cmd {
            QueueCommand::Enqueue { task, respond } => {
                let result = self.enqueue(vec![*task]).await;
                let _ = respond.send(result);
                self.dispatch_ready();
            }
            QueueCommand::EnqueueBatch { tasks, respond } => {
                let result = self.enqueue(tasks).await;
                let _ = respond.send(result);
                self.dispatch_ready();
            }
            QueueCommand::Dequeue { id, respond } => {
                let report = self.dequeue(id).await;
                let _ = respond.send(report);
                self.dispatch_ready();
            }
            QueueCommand::Cancel { id, respond } => {
                let result = self.cancel(id).await;
                let _ = respond.send(result);
                self.dispatch_ready();
            }
            QueueCommand::Skip { id, respond } => {
                let result = self.skip(id).await;
                let _ = respond.send(result);
                self.dispatch_ready();
            }
            QueueCommand::Get { id, respond } => {
                let _ = respond.send(self.get(id));
            }
            QueueCommand::Find { tags, respond } => {
                let reports = self
                    .all_reports()
                    .into_iter()
                    .filter(|r| r.has_tags(&tags))
                    .collect();
                let _ = respond.send(reports);
            }
            QueueCommand::Waiting { respond } => {
                let _ = respond.send(self.waiting.iter().map(|t| t.report.clone()).collect());
            }
            QueueCommand::Running { respond } => {
                let _ = respond.send(self.running.values().map(|t| t.report.clone()).collect());
            }
            QueueCommand::Completed { respond } => {
                let _ = respond.send(self.completed.clone());
            }
            QueueCommand::All { respond } => {
                let _ = respond.send(self.all_reports());
            }
            QueueCommand::TaskFinished { id, outcome } => {
                self.task_finished(id, outcome).await;
                self.dispatch_ready();
            }
            QueueCommand::Stop {
                clear_pending,
                respond,
            } => {
                if clear_pending {
                    for task in &self.waiting {
                        if let Err(err) = self.storage.delete_queued_call(&task.id()).await {
                            warn!(id = %task.id(), %err, "failed to clear persisted record");
                        }
                    }
                }
                let _ = respond.send(());
                return true;
            }
        }
        false
    }

    /// Validate, persist, and admit a batch of tasks.
    ///
    /// The whole batch is persisted before any member is admitted; a
    /// storage failure rolls the written records back, so a batch is
    /// admitted in full or not at all and no dependent waits on a member
    /// that was dropped.
    async fn enqueue(&mut self, mut tasks: Vec<Task>) -> Result<(), QueueError> {
        let mut known: HashSet<TaskId> = self.waiting.iter().map(Task::id).collect();
        known.extend(self.running.keys().copied());
        known.extend(tasks.iter().map(Task::id));

        for task in &mut tasks {
            // A task can never wait on itself.
            let own = task.id();
            match self.config.dependency_policy {
                DependencyPolicy::Prune => {
                    task.item
                        .dependencies
                        .retain(|dep, _| *dep != own && known.contains(dep));
                }
                DependencyPolicy::Reject => {
                    let missing: Vec<TaskId> = task
                        .item
                        .dependencies
                        .keys()
                        .filter(|dep| **dep == own || !known.contains(dep))
                        .copied()
                        .collect();
                    if !missing.is_empty() {
                        return Err(QueueError::UnknownDependency {
                            task_id: own,
                            missing,
                        });
                    }
                }
            }
        }

        let mut persisted: Vec<TaskId> = Vec::with_capacity(tasks.len());
        for task in &tasks {
            if let Err(err) = self.storage.save_queued_call(QueuedCall::new(&task.item)).await {
                error!(id = %task.id(), %err, "failed to persist queued call");
                for id in &persisted {
                    if let Err(err) = self.storage.delete_queued_call(id).await {
                        warn!(%id, %err, "failed to roll back persisted record");
                    }
                }
                return Err(err.into());
            }
            persisted.push(task.id());
        }

        for task in tasks {
            debug!(id = %task.id(), call = %task.item.call, "task enqueued");
            task.fire(LifecycleEvent::Enqueue);
            self.waiting.push(task);
        }
        Ok(())
    }

    /// Greedy first-fit pass over the waiting list in submission order.
    fn dispatch_ready(&mut self) {
        let mut available = self
            .config
            .concurrency_threshold
            .saturating_sub(self.running_weight);
        let mut i = 0;
        while i < self.waiting.len() {
            let candidate = &self.waiting[i];
            let weight = candidate.item.weight;
            let ready = candidate.item.dependencies.is_empty()
                && (weight == 0 || weight <= available);
            if !ready {
                i += 1;
                continue;
            }

            let mut task = self.waiting.remove(i);
            available = available.saturating_sub(weight);
            self.running_weight += weight;
            task.start_running();
            debug!(id = %task.id(), call = %task.item.call, weight, "task dispatched");

            let id = task.id();
            let work = Arc::clone(&task.work);
            let ctx = task.context();
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let outcome = execute_work(work, ctx).await;
                // The worker owning the receiver is the only thing that can
                // close this channel, and then the outcome has no audience.
                let _ = tx.send(QueueCommand::TaskFinished { id, outcome }).await;
            });
            self.running.insert(id, task);
        }
    }

    async fn task_finished(&mut self, id: TaskId, outcome: TaskOutcome) {
        // A cancel or forcible dequeue may have already retired the task;
        // the late completion message is dropped.
        let Some(mut task) = self.running.remove(&id) else {
            debug!(%id, "completion for task no longer tracked, ignoring");
            return;
        };
        self.running_weight -= task.item.weight;
        task.fire(LifecycleEvent::Dequeue);
        task.complete(outcome);
        self.retire(task).await;
    }

    /// Record a terminal task and re-evaluate its dependents.
    async fn retire(&mut self, task: Task) {
        let id = task.id();
        let state = task.report.state;
        debug!(%id, ?state, "task completed");
        if let Err(err) = self.storage.delete_queued_call(&id).await {
            warn!(%id, %err, "failed to delete persisted record");
        }
        self.completed.push(task.report.clone());
        self.settle_dependents(id, state).await;
    }

    /// Propagate a terminal state to waiting dependents: accepted states
    /// clear the dependency entry, anything else skips the dependent. Skips
    /// are completions themselves, so the cascade runs to a fixed point.
    async fn settle_dependents(&mut self, id: TaskId, state: TaskState) {
        enum Decision {
            Keep,
            Unblock,
            Skip(Vec<TaskState>),
        }

        let mut worklist = vec![(id, state)];
        while let Some((done_id, done_state)) = worklist.pop() {
            let mut skipped = Vec::new();
            let mut i = 0;
            while i < self.waiting.len() {
                let task = &mut self.waiting[i];
                let decision = match task.item.dependencies.get(&done_id) {
                    None => Decision::Keep,
                    Some(accepted) if accepted.contains(&done_state) => Decision::Unblock,
                    Some(accepted) => Decision::Skip(accepted.iter().copied().collect()),
                };
                match decision {
                    Decision::Keep => i += 1,
                    Decision::Unblock => {
                        task.item.dependencies.remove(&done_id);
                        i += 1;
                    }
                    Decision::Skip(expected) => {
                        task.report.dependency_failures.insert(
                            done_id,
                            DependencyFailure {
                                expected,
                                actual: done_state,
                            },
                        );
                        skipped.push(self.waiting.remove(i));
                    }
                }
            }

            for mut task in skipped {
                let skip_id = task.id();
                debug!(id = %skip_id, upstream = %done_id, "dependency finished in unaccepted state, skipping");
                task.fire(LifecycleEvent::Dequeue);
                task.skip(format!("dependency {done_id} finished as {done_state:?}"));
                if let Err(err) = self.storage.delete_queued_call(&skip_id).await {
                    warn!(id = %skip_id, %err, "failed to delete persisted record");
                }
                self.completed.push(task.report.clone());
                worklist.push((skip_id, TaskState::Skipped));
            }
        }
    }

    async fn dequeue(&mut self, id: TaskId) -> Option<CallReport> {
        let task = if let Some(pos) = self.waiting.iter().position(|t| t.id() == id) {
            self.waiting.remove(pos)
        } else if let Some(task) = self.running.remove(&id) {
            self.running_weight -= task.item.weight;
            task
        } else {
            return None;
        };

        task.fire(LifecycleEvent::Dequeue);
        if let Err(err) = self.storage.delete_queued_call(&id).await {
            warn!(%id, %err, "failed to delete persisted record");
        }
        // A forcibly removed task will never finish; dependents treat it as
        // satisfied.
        for waiting in &mut self.waiting {
            waiting.item.dependencies.remove(&id);
        }
        debug!(%id, "task dequeued");
        Some(task.report.clone())
    }

    async fn cancel(&mut self, id: TaskId) -> Option<bool> {
        let task = if let Some(pos) = self.waiting.iter().position(|t| t.id() == id) {
            self.waiting.remove(pos)
        } else if let Some(task) = self.running.remove(&id) {
            self.running_weight -= task.item.weight;
            // Raised for the work function; completion does not wait on it.
            task.request_cancel();
            task
        } else {
            return None;
        };

        let mut task = task;
        task.fire(LifecycleEvent::Dequeue);
        task.complete(TaskOutcome::Canceled);
        info!(%id, "task canceled");
        self.retire(task).await;
        Some(true)
    }

    async fn skip(&mut self, id: TaskId) -> bool {
        let Some(pos) = self.waiting.iter().position(|t| t.id() == id) else {
            return false;
        };
        let mut task = self.waiting.remove(pos);
        task.fire(LifecycleEvent::Dequeue);
        task.skip("skipped by request");
        if let Err(err) = self.storage.delete_queued_call(&id).await {
            warn!(%id, %err, "failed to delete persisted record");
        }
        self.completed.push(task.report.clone());
        self.settle_dependents(id, TaskState::Skipped).await;
        true
    }

    fn get(&self, id: TaskId) -> Option<CallReport> {
        self.completed
            .iter()
            .rev()
            .find(|r| r.task_id == id)
            .cloned()
            .or_else(|| self.running.get(&id).map(|t| t.report.clone()))
            .or_else(|| {
                self.waiting
                    .iter()
                    .find(|t| t.id() == id)
                    .map(|t| t.report.clone())
            })
    }

    fn all_reports(&self) -> Vec<CallReport> {
        let mut reports = self.completed.clone();
        reports.extend(self.running.values().map(|t| t.report.clone()));
        reports.extend(self.waiting.iter().map(|t| t.report.clone()));
        reports
    }

    fn purge_completed(&mut self) {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.config.completed_cache_life)
                .unwrap_or_else(|_| chrono::Duration::seconds(20));
        self.completed
            .retain(|r| r.finish_time.map(|t| t >= cutoff).unwrap_or(true));
    }
}
