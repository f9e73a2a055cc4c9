//! Trigger state surviving restarts and fail-over.

use crate::common::{INDEX, interval_job, key, pinned_job, wait_until};
use clustercron::testing::TestCluster;
use clustercron::{NodeDescriptor, NodeId};
use std::time::Duration;

#[tokio::test]
async fn test_restart_keeps_start_time() {
    let mut cluster = TestCluster::new(INDEX);
    cluster.put_job("hourly", interval_job("1h")).await.unwrap();

    let handle = cluster.start_node(NodeDescriptor::new("a")).await.unwrap();
    let counters = cluster.counters().clone();
    wait_until("the first fire", Duration::from_secs(3), || counters.runs() == 1).await;
    let before = handle.job_state(key("hourly")).await.unwrap().unwrap();

    cluster.stop_node(&NodeId::new("a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let handle = cluster.start_node(NodeDescriptor::new("a")).await.unwrap();
    let after = handle.job_state(key("hourly")).await.unwrap().unwrap();

    assert_eq!(after.start_time, before.start_time);
    assert_eq!(after.times_triggered, 1);
    assert_eq!(after.next_fire_time, before.next_fire_time);

    // Not due again for an hour.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counters.runs(), 1);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fail_over_keeps_start_time() {
    let mut cluster = TestCluster::new(INDEX);
    cluster.put_job("pinned", pinned_job("1h", 0)).await.unwrap();

    let a = cluster.start_node(NodeDescriptor::new("a")).await.unwrap();
    let counters = cluster.counters().clone();
    wait_until("the first fire", Duration::from_secs(3), || {
        counters.runs_on(&NodeId::new("a")) == 1
    })
    .await;
    let before = a.job_state(key("pinned")).await.unwrap().unwrap();

    let b = cluster.start_node(NodeDescriptor::new("b")).await.unwrap();
    cluster.stop_node(&NodeId::new("a")).await.unwrap();

    let start = tokio::time::Instant::now();
    let after = loop {
        if let Some(state) = b.job_state(key("pinned")).await.unwrap() {
            break state;
        }
        if start.elapsed() > Duration::from_secs(3) {
            panic!("node b never took over the job");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(after.start_time, before.start_time);
    assert_eq!(after.node, Some(NodeId::new("b")));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counters.runs_on(&NodeId::new("b")), 0);

    cluster.shutdown().await.unwrap();
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_restart_with_sqlite_store() {
    use clustercron::testing::{CountingJob, JobCounters};
    use clustercron::{
        DefaultJobConfigFactory, DocumentStore, Job, JobRegistry, Scheduler, SqliteStore,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("ccron.db");
    let counters = JobCounters::new();

    let build = |store: Arc<SqliteStore>| {
        let job_counters = counters.clone();
        let registry = JobRegistry::new().register("counting", move || {
            Arc::new(CountingJob::new(job_counters.clone())) as Arc<dyn Job>
        });
        Scheduler::builder(INDEX)
            .store(store)
            .job_factory(Arc::new(registry))
            .job_config_factory(Arc::new(DefaultJobConfigFactory::new("counting")))
            .poll_interval(Duration::from_millis(20))
            .build()
            .unwrap()
    };

    let store = Arc::new(SqliteStore::new(&db_path).await.unwrap());
    store.put(INDEX, "hourly", interval_job("1h")).await.unwrap();

    let (handle, task) = build(store.clone()).start().await;
    wait_until("the first fire", Duration::from_secs(3), || counters.runs() == 1).await;
    let before = handle.job_state(key("hourly")).await.unwrap().unwrap();
    handle.shutdown().await.unwrap();
    task.await.unwrap();
    store.close().await;

    let store = Arc::new(SqliteStore::new(&db_path).await.unwrap());
    let (handle, task) = build(store.clone()).start().await;
    let after = handle.job_state(key("hourly")).await.unwrap().unwrap();
    assert_eq!(after.start_time, before.start_time);
    assert_eq!(after.times_triggered, 1);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert_eq!(counters.runs(), 1);
}
