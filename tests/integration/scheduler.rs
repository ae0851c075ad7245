//! End-to-end scheduler scenarios, wired to a real task queue through a
//! coordinator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use async_trait::async_trait;
use serde_json::{json, Value};

use conveyor::coordinator::Coordinator;
use conveyor::core::{ScheduleId, TaskState, WorkContext, WorkError, WorkItem, WorkUnit};
use conveyor::dispatch::TaskQueue;
use conveyor::scheduler::{extract_schedule_id, schedule_tag, ScheduleOptions, Scheduler};
use conveyor::storage::{InMemoryStorage, Storage};

use crate::common::{init_tracing, Failing, Instant, QueueCoordinator, TICK};

fn wired(
    registry: Vec<(&str, Arc<dyn conveyor::core::WorkUnit>)>,
) -> (
    Scheduler<Arc<InMemoryStorage>>,
    conveyor::dispatch::TaskQueueHandle,
    Arc<InMemoryStorage>,
) {
    init_tracing();
    let storage = Arc::new(InMemoryStorage::new());
    let (queue, _worker) = TaskQueue::new(Arc::clone(&storage))
        .with_dispatch_interval(TICK)
        .start();
    let mut coordinator = QueueCoordinator::new(queue.clone());
    for (call, work) in registry {
        coordinator = coordinator.register(call, work);
    }
    let scheduler = Scheduler::new(
        Arc::clone(&storage),
        Arc::new(coordinator) as Arc<dyn Coordinator>,
    );
    (scheduler, queue, storage)
}

/// Pull a stored schedule's next run into the past so a poll picks it up.
async fn make_due(storage: &InMemoryStorage, id: &ScheduleId) {
    let mut record = storage.get_schedule(id).await.unwrap().unwrap();
    record.next_run = chrono::Utc::now() - chrono::Duration::minutes(1);
    storage.update_schedule(record).await.unwrap();
}

async fn wait_until_schedule<S, F>(scheduler: &Scheduler<S>, id: ScheduleId, pred: F)
where
    S: conveyor::storage::Storage,
    F: Fn(&conveyor::scheduler::ScheduleReport) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(report) = scheduler.get(id).await {
            if pred(&report) {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on schedule {id}"
        );
        sleep(TICK).await;
    }
}

/// Poll until a submission happens. The in-flight guard is released a
/// moment after bookkeeping lands, so a single poll right after waiting on
/// the record can come up empty.
async fn poll_until_submitted<S: conveyor::storage::Storage>(scheduler: &Scheduler<S>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while scheduler.poll_once().await.unwrap() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "poll never submitted anything"
        );
        sleep(TICK).await;
    }
}

#[tokio::test]
async fn test_scheduled_call_runs_on_the_queue() {
    let (scheduler, queue, storage) = wired(vec![("sync_repo", Arc::new(Instant))]);

    let item = WorkItem::new("sync_repo").with_tag("repo:demo");
    let id = scheduler
        .add(item, "PT1H", ScheduleOptions::default())
        .await
        .unwrap()
        .unwrap();
    make_due(&storage, &id).await;

    assert_eq!(scheduler.poll_once().await.unwrap(), 1);
    wait_until_schedule(&scheduler, id, |r| r.last_run.is_some()).await;

    // The run is correlated back to its schedule through the tag.
    let reports = queue.find(&[schedule_tag(id)]).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].state, TaskState::Succeeded);
    assert_eq!(extract_schedule_id(&reports[0].tags), Some(id));

    let report = scheduler.get(id).await.unwrap();
    assert_eq!(report.consecutive_failures, 0);
    assert!(report.next_run > chrono::Utc::now());
}

#[tokio::test]
async fn test_failing_schedule_disables_after_threshold() {
    let (scheduler, _queue, storage) = wired(vec![("flaky", Arc::new(Failing))]);

    let options = ScheduleOptions {
        failure_threshold: Some(2),
        ..ScheduleOptions::default()
    };
    let id = scheduler
        .add(WorkItem::new("flaky"), "PT1H", options)
        .await
        .unwrap()
        .unwrap();
    make_due(&storage, &id).await;

    assert_eq!(scheduler.poll_once().await.unwrap(), 1);
    wait_until_schedule(&scheduler, id, |r| r.consecutive_failures == 1).await;
    assert!(scheduler.get(id).await.unwrap().enabled);

    // Make it due again and let the second failure trip the threshold.
    make_due(&storage, &id).await;

    poll_until_submitted(&scheduler).await;
    wait_until_schedule(&scheduler, id, |r| !r.enabled).await;
    assert_eq!(scheduler.get(id).await.unwrap().consecutive_failures, 2);
}

#[tokio::test]
async fn test_bounded_schedule_runs_out_end_to_end() {
    let (scheduler, queue, storage) = wired(vec![("sync_repo", Arc::new(Instant))]);

    let id = scheduler
        .add(
            WorkItem::new("sync_repo"),
            "R2/PT1H",
            ScheduleOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    make_due(&storage, &id).await;

    for expected_runs in [1i64, 0] {
        poll_until_submitted(&scheduler).await;
        if expected_runs > 0 {
            wait_until_schedule(&scheduler, id, |r| r.remaining_runs == Some(expected_runs)).await;
            // Pull the next run back so the loop can fire again.
            make_due(&storage, &id).await;
        }
    }

    // The exhausted schedule is deleted outright.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while storage.get_schedule(&id).await.unwrap().is_some() {
        assert!(tokio::time::Instant::now() < deadline, "schedule never deleted");
        sleep(TICK).await;
    }

    // Both runs went through the queue.
    let reports = queue.find(&[schedule_tag(id)]).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.state == TaskState::Succeeded));
}

#[tokio::test]
async fn test_failure_on_final_run_still_exhausts_schedule() {
    /// Succeeds on the first call, fails on every later one.
    struct SucceedsOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WorkUnit for SucceedsOnce {
        async fn execute(&self, _ctx: &mut WorkContext) -> Result<Value, WorkError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(json!("first"))
            } else {
                Err(WorkError::ExecutionFailed("worn out".to_string()))
            }
        }
    }

    let work = Arc::new(SucceedsOnce {
        calls: AtomicUsize::new(0),
    });
    let (scheduler, queue, storage) = wired(vec![("wearing", work)]);

    // A single failure would disable the schedule, but the run cap hits
    // zero on the same run and deletion wins.
    let options = ScheduleOptions {
        failure_threshold: Some(1),
        ..ScheduleOptions::default()
    };
    let id = scheduler
        .add(WorkItem::new("wearing"), "R2/PT1H", options)
        .await
        .unwrap()
        .unwrap();
    make_due(&storage, &id).await;

    poll_until_submitted(&scheduler).await;
    wait_until_schedule(&scheduler, id, |r| r.remaining_runs == Some(1)).await;
    assert_eq!(scheduler.get(id).await.unwrap().consecutive_failures, 0);
    make_due(&storage, &id).await;
    poll_until_submitted(&scheduler).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while storage.get_schedule(&id).await.unwrap().is_some() {
        assert!(tokio::time::Instant::now() < deadline, "schedule never deleted");
        sleep(TICK).await;
    }

    // The failure still went through the queue before the record went away.
    let reports = queue.find(&[schedule_tag(id)]).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().any(|r| r.state == TaskState::Failed));
    assert!(reports.iter().any(|r| r.state == TaskState::Succeeded));
}

#[tokio::test]
async fn test_poll_loop_runs_until_stopped() {
    let (scheduler, _queue, storage) = wired(vec![("sync_repo", Arc::new(Instant))]);
    let scheduler = scheduler.with_poll_interval(TICK);

    let id = scheduler
        .add(
            WorkItem::new("sync_repo"),
            "PT1H",
            ScheduleOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    make_due(&storage, &id).await;

    let handle = scheduler.start();
    wait_until_schedule(&scheduler, id, |r| r.last_run.is_some()).await;

    scheduler.stop();
    handle.await.unwrap();
}
