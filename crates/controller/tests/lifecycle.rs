#![forbid(unsafe_code)]

mod common;

use std::time::Duration;

use common::*;
use tokio::sync::{mpsc, watch};
use xposer_controller::{Controller, ControllerError, SyncFailurePolicy};
use xposer_core::{Notification, WorkloadRef};

#[tokio::test]
async fn runs_until_shutdown_and_processes_notifications() {
    let cache = FakeCache::synced();
    let applier = RecordingApplier::new();
    cache.put(
        "ns",
        "api",
        snapshot(&[("expose/port", "9090")], &[("expose/host", "api.example.com"), ("expose/path", "/v1")]),
    );
    let mut cfg = fast_config();
    cfg.workers = 2;
    let ctx = context(&cache, &applier, cfg);

    let (tx, rx) = mpsc::channel(16);
    let (stop, stop_rx) = watch::channel(false);
    let run = tokio::spawn(Controller::new(ctx.clone()).run(rx, stop_rx));

    tx.send(Notification::Added(Ok(WorkloadRef::new("ns", "api")))).await.unwrap();
    assert!(eventually(|| applier.calls().len() == 2).await, "calls: {:?}", applier.calls());
    assert_eq!(applier.service_calls()[0].name, "api-svc");
    assert_eq!(applier.ingress_calls()[0].backend_service_name, "api-svc");

    stop.send(true).unwrap();
    let res = tokio::time::timeout(Duration::from_secs(2), run).await.expect("run returns").unwrap();
    assert!(res.is_ok());
    assert!(ctx.queue.is_shutting_down());
}

#[tokio::test]
async fn events_before_sync_are_processed_after_it() {
    let cache = FakeCache::unsynced();
    let applier = RecordingApplier::new();
    cache.put("ns", "web", snapshot(&[("expose/port", "80")], &[]));
    let ctx = context(&cache, &applier, fast_config());

    let (tx, rx) = mpsc::channel(16);
    let (stop, stop_rx) = watch::channel(false);
    let run = tokio::spawn(Controller::new(ctx.clone()).run(rx, stop_rx));

    tx.send(Notification::Added(Ok(WorkloadRef::new("ns", "web")))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(applier.calls().is_empty(), "no work before the cache syncs");

    cache.mark_synced();
    assert!(eventually(|| applier.service_calls().len() == 1).await);

    drop(stop);
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn failed_sync_aborts_by_default() {
    let cache = FakeCache::unsynced();
    cache.fail_sync("watch stream closed");
    let ctx = context(&cache, &RecordingApplier::new(), fast_config());
    let (_tx, rx) = mpsc::channel(1);
    let (_stop, stop_rx) = watch::channel(false);

    let err = Controller::new(ctx).run(rx, stop_rx).await.unwrap_err();
    assert!(matches!(err, ControllerError::Sync(_)));
}

#[tokio::test(start_paused = true)]
async fn sync_timeout_aborts() {
    let cache = FakeCache::unsynced();
    let ctx = context(&cache, &RecordingApplier::new(), fast_config());
    let (_tx, rx) = mpsc::channel(1);
    let (_stop, stop_rx) = watch::channel(false);

    let err = Controller::new(ctx).run(rx, stop_rx).await.unwrap_err();
    assert!(matches!(err, ControllerError::SyncTimeout(d) if d == Duration::from_secs(2)));
}

#[tokio::test]
async fn failed_sync_can_be_tolerated() {
    let cache = FakeCache::unsynced();
    cache.fail_sync("watch stream closed");
    let applier = RecordingApplier::new();
    cache.put("ns", "web", snapshot(&[("expose/port", "80")], &[]));
    let mut cfg = fast_config();
    cfg.on_sync_failure = SyncFailurePolicy::Continue;
    let ctx = context(&cache, &applier, cfg);

    let (tx, rx) = mpsc::channel(4);
    let (stop, stop_rx) = watch::channel(false);
    let run = tokio::spawn(Controller::new(ctx).run(rx, stop_rx));

    tx.send(Notification::Added(Ok(WorkloadRef::new("ns", "web")))).await.unwrap();
    assert!(eventually(|| applier.service_calls().len() == 1).await);

    stop.send(true).unwrap();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn deletion_creates_nothing_and_removes_nothing() {
    let cache = FakeCache::synced();
    let applier = RecordingApplier::new();
    let ctx = context(&cache, &applier, fast_config());

    let (tx, rx) = mpsc::channel(4);
    let (stop, stop_rx) = watch::channel(false);
    let run = tokio::spawn(Controller::new(ctx.clone()).run(rx, stop_rx));

    tx.send(Notification::Deleted(Ok(WorkloadRef::new("ns", "web")))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(applier.calls().is_empty());
    assert!(ctx.queue.is_empty());

    stop.send(true).unwrap();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn workload_removed_before_processing_is_skipped() {
    let cache = FakeCache::synced();
    let applier = RecordingApplier::new();
    cache.put("ns", "web", snapshot(&[("expose/port", "80")], &[]));
    let ctx = context(&cache, &applier, fast_config());

    ctx.queue.add("ns/web".to_string());
    cache.remove("ns", "web");

    let (_tx, rx) = mpsc::channel(1);
    let (stop, stop_rx) = watch::channel(false);
    let run = tokio::spawn(Controller::new(ctx.clone()).run(rx, stop_rx));
    assert!(eventually(|| ctx.queue.is_empty()).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(applier.calls().is_empty());

    stop.send(true).unwrap();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn shutdown_while_waiting_for_sync_returns_promptly() {
    let cache = FakeCache::unsynced();
    let applier = RecordingApplier::new();
    cache.put("ns", "web", snapshot(&[("expose/port", "80")], &[]));
    let mut cfg = fast_config();
    cfg.sync_timeout = Duration::from_secs(5);
    let ctx = context(&cache, &applier, cfg);

    let (tx, rx) = mpsc::channel(4);
    let (stop, stop_rx) = watch::channel(false);
    let run = tokio::spawn(Controller::new(ctx.clone()).run(rx, stop_rx));

    tx.send(Notification::Added(Ok(WorkloadRef::new("ns", "web")))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.send(true).unwrap();

    let res = tokio::time::timeout(Duration::from_secs(1), run).await.expect("run returns before the sync timeout");
    assert!(res.unwrap().is_ok());
    assert!(ctx.queue.is_shutting_down());

    // A late sync must not start workers.
    cache.mark_synced();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(applier.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn periodic_resync_retries_dropped_workloads() {
    let cache = FakeCache::synced();
    let applier = RecordingApplier::new();
    cache.put("ns", "web", snapshot(&[("expose/port", "80")], &[]));
    applier.fail_service(Failure::Permanent);
    let mut cfg = fast_config();
    cfg.resync = Duration::from_secs(30);
    let ctx = context(&cache, &applier, cfg);

    let (tx, rx) = mpsc::channel(4);
    let (stop, stop_rx) = watch::channel(false);
    let run = tokio::spawn(Controller::new(ctx.clone()).run(rx, stop_rx));

    tx.send(Notification::Added(Ok(WorkloadRef::new("ns", "web")))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(applier.service_calls().len(), 1, "first create fails permanently and is dropped");
    assert!(ctx.queue.is_empty());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(applier.service_calls().len(), 2, "resync hands the workload back to the workers");

    stop.send(true).unwrap();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn zero_resync_period_disables_it() {
    let cache = FakeCache::synced();
    let applier = RecordingApplier::new();
    cache.put("ns", "web", snapshot(&[("expose/port", "80")], &[]));
    let mut cfg = fast_config();
    cfg.resync = Duration::ZERO;
    let ctx = context(&cache, &applier, cfg);

    let (_tx, rx) = mpsc::channel(4);
    let (stop, stop_rx) = watch::channel(false);
    let run = tokio::spawn(Controller::new(ctx).run(rx, stop_rx));

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(applier.calls().is_empty());

    stop.send(true).unwrap();
    assert!(run.await.unwrap().is_ok());
}
