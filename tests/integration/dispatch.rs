//! End-to-end dispatcher scenarios.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use conveyor::core::{LifecycleEvent, TaskState, WorkItem};
use conveyor::dispatch::{Task, TaskQueue};
use conveyor::storage::{InMemoryStorage, Storage};

use crate::common::{init_tracing, wait_for_task_state, Failing, Gated, Instant, TICK};

#[tokio::test]
async fn test_budget_and_dependency_pipeline() {
    init_tracing();
    let (queue, worker) = TaskQueue::new(InMemoryStorage::new())
        .with_concurrency_threshold(10)
        .with_dispatch_interval(TICK)
        .start();

    let (gate, gated) = Gated::new();
    let (first, first_done) = Task::new(
        WorkItem::new("stage_one").with_weight(6),
        Arc::new(gated),
    );
    let first_id = first.id();
    let (second, second_done) = Task::new(
        WorkItem::new("stage_two")
            .with_weight(6)
            .with_dependency(first_id, [TaskState::Succeeded]),
        Arc::new(Instant),
    );
    let second_id = second.id();

    queue.batch_enqueue(vec![first, second]).await.unwrap();
    wait_for_task_state(&queue, first_id, TaskState::Running).await;

    // Blocked on both the dependency and the 6+6 > 10 budget.
    sleep(TICK * 5).await;
    assert_eq!(
        queue.get(&second_id).await.unwrap().unwrap().state,
        TaskState::Waiting
    );

    gate.send(true).unwrap();
    let first_report = first_done.await.unwrap();
    let second_report = second_done.await.unwrap();
    assert_eq!(first_report.state, TaskState::Succeeded);
    assert_eq!(second_report.state, TaskState::Succeeded);
    // The second stage only started once the first had finished.
    assert!(second_report.start_time.unwrap() >= first_report.finish_time.unwrap());

    queue.stop(false).await.unwrap();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_hooks_fire_in_order() {
    init_tracing();
    let (queue, _worker) = TaskQueue::new(InMemoryStorage::new())
        .with_dispatch_interval(TICK)
        .start();

    let events = Arc::new(Mutex::new(Vec::new()));
    let mut item = WorkItem::new("observed");
    for event in [
        LifecycleEvent::Enqueue,
        LifecycleEvent::Run,
        LifecycleEvent::Dequeue,
        LifecycleEvent::Succeeded,
        LifecycleEvent::Complete,
    ] {
        let events = Arc::clone(&events);
        item = item.with_hook(
            event,
            Arc::new(move |_, _| events.lock().unwrap().push(event)),
        );
    }
    let (task, done) = Task::new(item, Arc::new(Instant));

    queue.enqueue(task).await.unwrap();
    done.await.unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            LifecycleEvent::Enqueue,
            LifecycleEvent::Run,
            LifecycleEvent::Dequeue,
            LifecycleEvent::Succeeded,
            LifecycleEvent::Complete,
        ]
    );
}

#[tokio::test]
async fn test_failure_skips_dependent_end_to_end() {
    init_tracing();
    let (queue, _worker) = TaskQueue::new(InMemoryStorage::new())
        .with_dispatch_interval(TICK)
        .start();

    let (upstream, upstream_done) = Task::new(WorkItem::new("breaks"), Arc::new(Failing));
    let upstream_id = upstream.id();
    let (downstream, downstream_done) = Task::new(
        WorkItem::new("never_runs").with_dependency(upstream_id, [TaskState::Succeeded]),
        Arc::new(Instant),
    );

    queue.batch_enqueue(vec![upstream, downstream]).await.unwrap();

    assert_eq!(upstream_done.await.unwrap().state, TaskState::Failed);
    let skipped = downstream_done.await.unwrap();
    assert_eq!(skipped.state, TaskState::Skipped);
    assert!(skipped.start_time.is_none());
    assert_eq!(
        skipped.dependency_failures[&upstream_id].actual,
        TaskState::Failed
    );
}

#[tokio::test]
async fn test_persisted_records_survive_restart() {
    init_tracing();
    let storage = Arc::new(InMemoryStorage::new());
    let (queue, worker) = TaskQueue::new(Arc::clone(&storage))
        .with_concurrency_threshold(1)
        .with_dispatch_interval(TICK)
        .start();

    let (_gate, gated) = Gated::new();
    let (blocker, _) = Task::new(WorkItem::new("blocker"), Arc::new(gated));
    let blocker_id = blocker.id();
    let (pending, _pending_done) = Task::new(WorkItem::new("pending"), Arc::new(Instant));

    queue.batch_enqueue(vec![blocker, pending]).await.unwrap();
    wait_for_task_state(&queue, blocker_id, TaskState::Running).await;

    // Shut down without clearing; both records must still be there.
    queue.stop(false).await.unwrap();
    worker.await.unwrap();
    let records = storage.list_queued_calls().await.unwrap();
    assert_eq!(records.len(), 2);

    // A fresh queue over the same storage resubmits the recovered items.
    let (restarted, _worker) = TaskQueue::new(Arc::clone(&storage))
        .with_dispatch_interval(TICK)
        .start();
    let mut receivers = Vec::new();
    for record in records {
        let (task, done) = Task::new(record.work_item, Arc::new(Instant));
        restarted.enqueue(task).await.unwrap();
        receivers.push(done);
    }
    for done in receivers {
        assert_eq!(done.await.unwrap().state, TaskState::Succeeded);
    }

    // Completion cleaned the persisted records back up.
    assert!(storage.list_queued_calls().await.unwrap().is_empty());
}
