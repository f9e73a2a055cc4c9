//! Execution limits and failing jobs.

use crate::common::{INDEX, RecordingHandler, key, wait_until};
use clustercron::testing::{FailingJob, TestCluster};
use clustercron::{DefaultJobConfigFactory, EventBus, NodeDescriptor, NodeId, SchedulerHandle};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Start a node outside the cluster's bookkeeping with extra builder settings.
async fn start_custom(
    cluster: &TestCluster,
    id: &str,
    configure: impl FnOnce(clustercron::SchedulerBuilder) -> clustercron::SchedulerBuilder,
) -> (SchedulerHandle, JoinHandle<()>) {
    let node = NodeDescriptor::new(id);
    cluster.roster().add_node(node.clone());
    let scheduler = configure(cluster.scheduler_builder(node)).build().unwrap();
    let (handle, task) = scheduler.start().await;
    handle.owned_jobs().await.unwrap();
    (handle, task)
}

#[tokio::test]
async fn test_non_concurrent_job_never_overlaps() {
    let cluster = TestCluster::new(INDEX);
    cluster
        .put_job(
            "slow",
            json!({"sleep_ms": 100, "trigger": {"schedule": {"interval": "20ms"}}}),
        )
        .await
        .unwrap();

    let (handle, task) = start_custom(&cluster, "a", |b| {
        b.job_config_factory(Arc::new(
            DefaultJobConfigFactory::new("counting").with_concurrent_execution_disallowed(),
        ))
    })
    .await;

    let counters = cluster.counters().clone();
    wait_until("several runs", Duration::from_secs(3), || counters.runs() >= 3).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(counters.max_active(), 1);
}

#[tokio::test]
async fn test_concurrent_runs_may_overlap() {
    let cluster = TestCluster::new(INDEX);
    cluster
        .put_job(
            "slow",
            json!({"sleep_ms": 300, "trigger": {"schedule": {"interval": "50ms"}}}),
        )
        .await
        .unwrap();

    let (handle, task) = start_custom(&cluster, "a", |b| b).await;

    let counters = cluster.counters().clone();
    wait_until("overlapping runs", Duration::from_secs(3), || {
        counters.max_active() >= 2
    })
    .await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_single_thread_still_runs_every_job() {
    let cluster = TestCluster::new(INDEX);
    for name in ["x", "y", "z"] {
        cluster
            .put_job(
                name,
                json!({"sleep_ms": 30, "trigger": {"schedule": {"interval": "50ms"}}}),
            )
            .await
            .unwrap();
    }

    let (handle, task) = start_custom(&cluster, "a", |b| b.max_threads(1)).await;

    let counters = cluster.counters().clone();
    wait_until("every job to run", Duration::from_secs(3), || {
        ["x", "y", "z"].iter().all(|n| counters.runs_of(&key(n)) >= 2)
    })
    .await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(counters.max_active(), 1);
}

#[tokio::test]
async fn test_failing_job_keeps_firing() {
    let failing = Arc::new(FailingJob::always().with_message("boom"));
    let cluster = TestCluster::new(INDEX).with_job("failing", failing.clone());
    cluster
        .put_job(
            "broken",
            json!({"type": "failing", "trigger": {"schedule": {"interval": "50ms"}}}),
        )
        .await
        .unwrap();

    let events = RecordingHandler::new();
    let bus = Arc::new(EventBus::new());
    bus.register(events.clone()).await;

    let (handle, task) = start_custom(&cluster, "a", |b| b.event_bus(bus)).await;

    wait_until("repeated failures", Duration::from_secs(3), || failing.calls() >= 3).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(events.failed_completions().await >= 3);
}

#[tokio::test]
async fn test_panicking_job_keeps_firing() {
    let failing = Arc::new(FailingJob::always().panicking());
    let cluster = TestCluster::new(INDEX).with_job("panicking", failing.clone());
    cluster
        .put_job(
            "exploding",
            json!({"type": "panicking", "trigger": {"schedule": {"interval": "50ms"}}}),
        )
        .await
        .unwrap();

    let (handle, task) = start_custom(&cluster, "a", |b| b).await;

    wait_until("repeated panics", Duration::from_secs(3), || failing.calls() >= 3).await;
    assert!(handle.is_running().await);
    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_over_capacity_defers_instead_of_dropping() {
    let cluster = TestCluster::new(INDEX);
    for name in ["x", "y", "z"] {
        cluster
            .put_job(
                name,
                json!({"sleep_ms": 400, "trigger": {"schedule": {"interval": "100ms"}}}),
            )
            .await
            .unwrap();
    }

    let (handle, task) = start_custom(&cluster, "a", |b| b.max_threads(1)).await;

    // Oldest fire time goes first, so every job gets a turn.
    let counters = cluster.counters().clone();
    wait_until("every job to run once", Duration::from_secs(5), || {
        ["x", "y", "z"].iter().all(|n| counters.runs_of(&key(n)) >= 1)
    })
    .await;
    assert!(handle.is_running().await);
    assert_eq!(counters.max_active(), 1);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

fn non_concurrent(b: clustercron::SchedulerBuilder) -> clustercron::SchedulerBuilder {
    b.job_config_factory(Arc::new(
        DefaultJobConfigFactory::new("counting").with_concurrent_execution_disallowed(),
    ))
}

#[tokio::test]
async fn test_schedule_change_mid_run_does_not_overlap() {
    let cluster = TestCluster::new(INDEX);
    cluster
        .put_job(
            "slow",
            json!({"sleep_ms": 1500, "trigger": {"schedule": {"interval": "100ms"}}}),
        )
        .await
        .unwrap();

    let (handle, task) = start_custom(&cluster, "a", non_concurrent).await;

    let counters = cluster.counters().clone();
    wait_until("the first run to start", Duration::from_secs(3), || {
        counters.active() == 1
    })
    .await;

    cluster
        .put_job(
            "slow",
            json!({"sleep_ms": 1500, "trigger": {"schedule": {"interval": "150ms"}}}),
        )
        .await
        .unwrap();
    let response = cluster.update_all().await;
    assert_eq!(response.failures().count(), 0);

    wait_until("a run after the change", Duration::from_secs(5), || {
        counters.runs() >= 2
    })
    .await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(counters.max_active(), 1);
}

#[tokio::test]
async fn test_job_moving_mid_run_waits_for_previous_owner() {
    let cluster = TestCluster::new(INDEX);
    cluster
        .put_job(
            "moving",
            json!({"hash": 1, "sleep_ms": 800, "trigger": {"schedule": {"interval": "100ms"}}}),
        )
        .await
        .unwrap();

    let (a, a_task) = start_custom(&cluster, "a", non_concurrent).await;

    let counters = cluster.counters().clone();
    wait_until("the first run to start", Duration::from_secs(3), || {
        counters.active() == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Pinned hash 1 belongs to "b" once it joins.
    let (b, b_task) = start_custom(&cluster, "b", non_concurrent).await;

    wait_until("the new owner to run the job", Duration::from_secs(5), || {
        counters.runs_on(&NodeId::new("b")) >= 1
    })
    .await;
    assert_eq!(counters.runs_on(&NodeId::new("a")), 1);
    assert_eq!(counters.max_active(), 1);

    for (handle, task) in [(a, a_task), (b, b_task)] {
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}

/// Full-length run of an over-capacity pool with jobs longer than the
/// thread count can absorb.
#[tokio::test]
#[ignore = "runs for about 30 seconds"]
async fn test_over_capacity_full_length() {
    let cluster = TestCluster::new(INDEX);
    for name in ["x", "y", "z"] {
        cluster
            .put_job(
                name,
                json!({"sleep_ms": 5000, "trigger": {"schedule": {"interval": "1s"}}}),
            )
            .await
            .unwrap();
    }

    let (handle, task) = start_custom(&cluster, "a", |b| {
        b.max_threads(1).misfire_threshold(Duration::from_secs(60))
    })
    .await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    let counters = cluster.counters().clone();
    assert!(handle.is_running().await);
    assert!(counters.runs() >= 5, "only {} runs", counters.runs());
    assert!(["x", "y", "z"].iter().all(|n| counters.runs_of(&key(n)) >= 1));
    assert_eq!(counters.max_active(), 1);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
