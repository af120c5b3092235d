//! Scheduler behaviour across metadata, events, polling and health.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::codec;
use crate::store::Headers;
use crate::test_utils::{scheduler, test_config};
use crate::types::{RunEvent, RunMetadata, RunPollingTask};

const WAIT: Duration = Duration::from_secs(5);

fn store_task(scheduler: &Scheduler, task: &RunPollingTask) -> u64 {
    scheduler
        .inner
        .tasks
        .create(task.metadata.run_id.as_str(), &codec::encode(task).unwrap())
        .unwrap()
}

fn overdue_task(run_id: &str) -> RunPollingTask {
    RunPollingTask::new(
        RunMetadata::new(run_id, "o", "w"),
        Utc::now() - chrono::Duration::minutes(1),
        chrono::Duration::seconds(1),
    )
}

#[tokio::test]
async fn event_for_run_without_metadata_is_delivered_once_metadata_exists() {
    let (_dir, scheduler) = scheduler().await;
    let event = RunEvent::new("run-1", "o", "w", "applied");

    assert!(matches!(
        scheduler.publish_run_event(&event).await,
        Err(RelayError::MetadataNotFound(_))
    ));

    scheduler
        .add_run_meta(&RunMetadata::new("run-1", "o", "w"))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = scheduler
        .subscribe_run_events("o", move |event: RunEvent| {
            let tx = tx.clone();
            async move { tx.send(event).is_ok() }
        })
        .unwrap();

    scheduler.publish_run_event(&event).await.unwrap();

    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.run_id.as_str(), "run-1");
    assert_eq!(received.new_status, "applied");
    assert_eq!(received.metadata.unwrap().workspace, "w");

    subscription.close().await;
}

#[tokio::test]
async fn callback_runs_in_publisher_trace() {
    let (_dir, scheduler) = scheduler().await;
    scheduler
        .add_run_meta(&RunMetadata::new("run-t", "o", "w"))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = scheduler
        .subscribe_run_events("o", move |_event: RunEvent| {
            let tx = tx.clone();
            async move { tx.send(trace::current().map(|c| c.trace_id)).is_ok() }
        })
        .unwrap();

    let root = trace::TraceContext::new_root();
    trace::scope(root, scheduler.publish_run_event(&RunEvent::new("run-t", "o", "w", "planned")))
        .await
        .unwrap();

    let seen = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(seen, Some(root.trace_id));
    subscription.close().await;
}

#[tokio::test]
async fn rejected_event_is_redelivered() {
    let (_dir, scheduler) = scheduler().await;
    scheduler
        .add_run_meta(&RunMetadata::new("run-2", "o", "w"))
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let counter = calls.clone();
    let subscription = scheduler
        .subscribe_run_events("o", move |event: RunEvent| {
            let tx = tx.clone();
            let counter = counter.clone();
            async move {
                // Refuse the first delivery only.
                let n = counter.fetch_add(1, Ordering::SeqCst);
                n > 0 && tx.send(event).is_ok()
            }
        })
        .unwrap();

    scheduler
        .publish_run_event(&RunEvent::new("run-2", "o", "w", "errored"))
        .await
        .unwrap();

    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.new_status, "errored");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    subscription.close().await;
}

#[tokio::test]
async fn undecodable_event_is_dropped_without_callback() {
    let (_dir, scheduler) = scheduler().await;
    scheduler
        .add_run_meta(&RunMetadata::new("run-3", "o", "w"))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = scheduler
        .subscribe_run_events("o", move |event: RunEvent| {
            let tx = tx.clone();
            async move { tx.send(event).is_ok() }
        })
        .unwrap();

    scheduler
        .broker()
        .publish(&run_event_subject("o"), b"not a record".to_vec(), Headers::new())
        .await
        .unwrap();
    scheduler
        .publish_run_event(&RunEvent::new("run-3", "o", "w", "applied"))
        .await
        .unwrap();

    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.run_id.as_str(), "run-3");
    subscription.close().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn event_whose_metadata_vanished_is_terminated() {
    let (_dir, scheduler) = scheduler().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let subscription = scheduler
        .subscribe_run_events("o", move |_event: RunEvent| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        })
        .unwrap();

    // Published straight to the stream, bypassing the metadata check.
    let event = RunEvent::new("run-ghost", "o", "w", "applied");
    scheduler
        .broker()
        .publish(&run_event_subject("o"), codec::encode(&event).unwrap(), Headers::new())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    subscription.close().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let info = scheduler.broker().stream_info(RUN_EVENTS_STREAM).unwrap();
    assert_eq!(info.state.messages, 0);
}

#[tokio::test]
async fn events_are_routed_by_provider() {
    let (_dir, scheduler) = scheduler().await;
    let mut meta = RunMetadata::new("run-gl", "o", "w");
    meta.source = "gitlab".to_string();
    scheduler.add_run_meta(&meta).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let gitlab = scheduler
        .subscribe_run_events("gitlab", move |event: RunEvent| {
            let tx = tx.clone();
            async move { tx.send(event).is_ok() }
        })
        .unwrap();

    scheduler
        .publish_run_event(&RunEvent::new("run-gl", "o", "w", "planned"))
        .await
        .unwrap();

    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.metadata.unwrap().source, "gitlab");
    gitlab.close().await;
}

#[tokio::test]
async fn queue_name_must_be_a_single_token() {
    let (_dir, scheduler) = scheduler().await;
    let result = scheduler.subscribe_run_events("a.b", |_event: RunEvent| async { true });
    assert!(matches!(result, Err(RelayError::InvalidSubjectToken(_))));
}

#[tokio::test]
async fn short_delays_fall_back_to_default() {
    let (_dir, scheduler) = scheduler().await;
    let meta = RunMetadata::new("run-d", "o", "w");
    let default = scheduler.config().default_poll_delay;

    let cases = [
        (Duration::ZERO, default),
        (Duration::from_millis(999), default),
        (Duration::from_secs(1), Duration::from_secs(1)),
        (Duration::from_secs(30), Duration::from_secs(30)),
    ];
    for (requested, expected) in cases {
        let before = Utc::now();
        let task = scheduler.new_polling_task(meta.clone(), requested);
        let delay = (task.next_poll() - before).to_std().unwrap();
        let diff = delay.abs_diff(expected);
        assert!(
            diff <= Duration::from_secs(1),
            "requested {requested:?}, got {delay:?}"
        );
        assert!(!task.processing());
        assert_eq!(task.last_status(), "new");
    }
}

#[tokio::test]
async fn schedule_twice_fails() {
    let (_dir, scheduler) = scheduler().await;
    let meta = RunMetadata::new("run-s", "o", "w");

    let mut task = scheduler.new_polling_task(meta.clone(), Duration::from_secs(5));
    task.schedule().await.unwrap();
    let mut again = scheduler.new_polling_task(meta, Duration::from_secs(5));
    assert!(matches!(again.schedule().await, Err(RelayError::DuplicateTask(_))));
}

#[tokio::test]
async fn stale_reschedule_is_rejected() {
    let (_dir, scheduler) = scheduler().await;
    let run_id = RunId::new("run-r");
    let mut task = scheduler.new_polling_task(RunMetadata::new("run-r", "o", "w"), Duration::ZERO);
    task.schedule().await.unwrap();

    let mut first = scheduler.polling_task(&run_id).unwrap().unwrap();
    let mut second = scheduler.polling_task(&run_id).unwrap().unwrap();

    first.set_last_status("planning");
    first.reschedule().await.unwrap();
    assert!(first.revision() > second.revision());

    assert!(matches!(
        second.reschedule().await,
        Err(RelayError::Kv(KvError::WrongLastRevision { .. }))
    ));

    let stored = scheduler.polling_task(&run_id).unwrap().unwrap();
    assert_eq!(stored.last_status(), "planning");
    assert_eq!(stored.revision(), first.revision());
}

#[tokio::test]
async fn completed_task_is_removed() {
    let (_dir, scheduler) = scheduler().await;
    let run_id = RunId::new("run-c");
    let mut task = scheduler.new_polling_task(RunMetadata::new("run-c", "o", "w"), Duration::ZERO);
    task.schedule().await.unwrap();

    task.completed().await.unwrap();
    assert!(scheduler.polling_task(&run_id).unwrap().is_none());
    // Completing again is harmless.
    task.completed().await.unwrap();
}

#[tokio::test]
async fn dispatcher_promotes_only_due_idle_tasks() {
    let (_dir, scheduler) = scheduler().await;

    store_task(&scheduler, &overdue_task("run-due"));

    let mut busy = overdue_task("run-busy");
    busy.processing = true;
    store_task(&scheduler, &busy);

    let future = RunPollingTask::new(
        RunMetadata::new("run-later", "o", "w"),
        Utc::now(),
        chrono::Duration::minutes(10),
    );
    store_task(&scheduler, &future);

    let report = scheduler.dispatch_once().await;
    assert_eq!(report.scanned, 3);
    assert_eq!(report.promoted, 1);
    assert_eq!(report.corrupted, 0);

    let due = scheduler
        .polling_task(&RunId::new("run-due"))
        .unwrap()
        .unwrap();
    assert!(due.processing());

    let polling = scheduler.broker().stream_info(RUN_POLLING_STREAM).unwrap();
    assert_eq!(polling.state.messages, 1);
    let message = scheduler
        .broker()
        .stream(RUN_POLLING_STREAM)
        .unwrap()
        .messages_after(0, 10)
        .remove(0);
    assert_eq!(message.subject, "RUN_POLLING.run-due");

    // A processing task is never promoted twice.
    let report = scheduler.dispatch_once().await;
    assert_eq!(report.promoted, 0);
}

#[tokio::test]
async fn dispatcher_deletes_corrupted_entries() {
    let (_dir, scheduler) = scheduler().await;
    scheduler
        .inner
        .tasks
        .create("run-bad", b"\x00\x00\x00\x02{}")
        .unwrap();
    scheduler
        .inner
        .tasks
        .create("run-worse", b"garbage")
        .unwrap();
    store_task(&scheduler, &overdue_task("run-ok"));

    let report = scheduler.dispatch_once().await;
    assert_eq!(report.corrupted, 2);
    assert_eq!(report.promoted, 1);
    assert!(scheduler.inner.tasks.entry("run-bad").unwrap().is_none());
    assert!(scheduler.inner.tasks.entry("run-worse").unwrap().is_none());
}

#[tokio::test]
async fn promoted_task_reaches_worker_and_can_be_rescheduled() {
    let (_dir, scheduler) = scheduler().await;
    store_task(&scheduler, &overdue_task("run-w"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = scheduler
        .subscribe_polling_tasks(move |mut task: PollingTask| {
            let tx = tx.clone();
            async move {
                task.set_last_status("planning");
                let rescheduled = task.reschedule().await.is_ok();
                tx.send((task.run_id().clone(), rescheduled)).is_ok()
            }
        })
        .unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    let dispatcher = scheduler.spawn_dispatcher(cancel.clone());

    let (run_id, rescheduled) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(run_id.as_str(), "run-w");
    assert!(rescheduled);

    cancel.cancel();
    dispatcher.await.unwrap();
    subscription.close().await;

    let stored = scheduler.polling_task(&run_id).unwrap().unwrap();
    assert!(!stored.processing());
    assert_eq!(stored.last_status(), "planning");
    assert!(stored.next_poll() > Utc::now());
}

#[tokio::test]
async fn dispatcher_runs_only_alongside_polling_workers() {
    let (_dir, scheduler) = scheduler().await;
    let polled = Arc::new(AtomicUsize::new(0));
    let cancel = tokio_util::sync::CancellationToken::new();

    let counter = polled.clone();
    let workers = scheduler
        .start_polling(&cancel, move |task: PollingTask| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                task.completed().await.is_ok()
            }
        })
        .unwrap();
    scheduler.health_check().unwrap();

    store_task(&scheduler, &overdue_task("run-a"));
    timeout(WAIT, async {
        while polled.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    workers.close().await;

    // With the workers gone a due task is left idle, not claimed.
    store_task(&scheduler, &overdue_task("run-b"));
    tokio::time::sleep(scheduler.config().dispatch_interval * 5).await;
    let stored = scheduler
        .polling_task(&RunId::new("run-b"))
        .unwrap()
        .unwrap();
    assert!(!stored.processing());
    let polling = scheduler.broker().stream_info(RUN_POLLING_STREAM).unwrap();
    assert_eq!(polling.state.messages, 0);
    assert_eq!(polled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn health_requires_live_subscribers() {
    let (_dir, scheduler) = scheduler().await;
    scheduler.health_check().unwrap();

    let subscription = scheduler
        .subscribe_run_events("o", |_event: RunEvent| async { true })
        .unwrap();
    scheduler.health_check().unwrap();

    subscription.close().await;
    assert!(matches!(
        scheduler.health_check(),
        Err(RelayError::Unhealthy(_))
    ));
}

#[tokio::test]
async fn health_fails_without_streams() {
    let (_dir, scheduler) = scheduler().await;
    scheduler.broker().delete_stream(RUN_POLLING_STREAM).unwrap();
    assert!(matches!(
        scheduler.health_check(),
        Err(RelayError::Unhealthy(_))
    ));
}

#[tokio::test]
async fn reconnect_with_new_retention_migrates_events() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(Broker::open(dir.path()).unwrap());
    let limits = test_config().with_events_retention(RetentionPolicy::Limits);
    let scheduler = Scheduler::connect(broker.clone(), limits).await.unwrap();
    scheduler
        .add_run_meta(&RunMetadata::new("run-m", "o", "w"))
        .await
        .unwrap();
    for status in ["planning", "planned", "applying"] {
        scheduler
            .publish_run_event(&RunEvent::new("run-m", "o", "w", status))
            .await
            .unwrap();
    }
    drop(scheduler);

    let scheduler = Scheduler::connect(broker.clone(), test_config()).await.unwrap();
    let info = broker.stream_info(RUN_EVENTS_STREAM).unwrap();
    assert_eq!(info.config.retention, RetentionPolicy::WorkQueue);
    assert_eq!(info.state.messages, 3);

    // Metadata survives the reconnect.
    assert_eq!(
        scheduler.get_run_meta(&RunId::new("run-m")).unwrap().workspace,
        "w"
    );
}

#[tokio::test]
async fn second_replica_cannot_share_the_store() {
    let (dir, scheduler) = scheduler().await;
    scheduler
        .add_run_meta(&RunMetadata::new("run-x", "o", "w"))
        .await
        .unwrap();

    assert!(matches!(
        Broker::open(dir.path()),
        Err(StreamError::Locked(_))
    ));

    drop(scheduler);
    let broker = Arc::new(Broker::open(dir.path()).unwrap());
    let reopened = Scheduler::connect(broker, test_config()).await.unwrap();
    assert_eq!(
        reopened.get_run_meta(&RunId::new("run-x")).unwrap().workspace,
        "w"
    );
    assert!(matches!(
        reopened
            .add_run_meta(&RunMetadata::new("run-x", "o", "other"))
            .await,
        Err(RelayError::DuplicateRun(_))
    ));
}
