//! Config update broadcasts and reload behavior.

use crate::common::{INDEX, interval_job, key, wait_until};
use clustercron::testing::{CountingJob, FailingStore, JobCounters, TestCluster};
use clustercron::{
    DefaultJobConfigFactory, DocumentStore, IndexJobConfigSource, InMemoryStore, Job,
    JobRegistry, NodeDescriptor, Scheduler, SchedulerConfigUpdateAction, SchedulerError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn summaries(response: &clustercron::ConfigUpdateResponse) -> Vec<String> {
    response
        .nodes
        .iter()
        .map(|n| n.result.clone().unwrap())
        .collect()
}

#[tokio::test]
async fn test_update_action_reports_changes() {
    let mut cluster = TestCluster::new(INDEX);
    cluster.start_node(NodeDescriptor::new("a")).await.unwrap();

    cluster.put_job("a", interval_job("1h")).await.unwrap();
    let response = cluster.update_all().await;
    assert_eq!(summaries(&response), vec!["new: 1; upd: 0; del: 0"]);

    let response = cluster.update_all().await;
    assert_eq!(summaries(&response), vec!["no changes"]);

    // Rewriting the document bumps its version.
    cluster.put_job("a", interval_job("2h")).await.unwrap();
    let response = cluster.update_all().await;
    assert_eq!(summaries(&response), vec!["new: 0; upd: 1; del: 0"]);

    cluster.store().delete(INDEX, "a").await.unwrap();
    let response = cluster.update_all().await;
    assert_eq!(summaries(&response), vec!["new: 0; upd: 0; del: 1"]);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_recreated_document_replaces_job() {
    let mut cluster = TestCluster::new(INDEX);
    let handle = cluster.start_node(NodeDescriptor::new("a")).await.unwrap();

    cluster.put_job("a", interval_job("1h")).await.unwrap();
    assert_eq!(cluster.put_job("a", interval_job("1h")).await.unwrap(), 2);
    let response = cluster.update_all().await;
    assert_eq!(summaries(&response), vec!["new: 1; upd: 0; del: 0"]);
    let before = handle.job_state(key("a")).await.unwrap().unwrap();

    // Deleted and re-created between two updates: the version starts over.
    tokio::time::sleep(Duration::from_millis(20)).await;
    cluster.store().delete(INDEX, "a").await.unwrap();
    assert_eq!(cluster.put_job("a", interval_job("7m")).await.unwrap(), 1);
    let response = cluster.update_all().await;
    assert_eq!(summaries(&response), vec!["new: 0; upd: 1; del: 0"]);

    let after = handle.job_state(key("a")).await.unwrap().unwrap();
    assert!(after.start_time > before.start_time);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_repeated_updates_do_not_restart_jobs() {
    let mut cluster = TestCluster::new(INDEX);
    cluster.put_job("hourly", interval_job("1h")).await.unwrap();
    let handle = cluster.start_node(NodeDescriptor::new("a")).await.unwrap();

    let counters = cluster.counters().clone();
    wait_until("the first fire", Duration::from_secs(3), || counters.runs() == 1).await;
    let before = handle.job_state(key("hourly")).await.unwrap().unwrap();

    for _ in 0..2 {
        let response = cluster.update_all().await;
        assert_eq!(summaries(&response), vec!["no changes"]);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let after = handle.job_state(key("hourly")).await.unwrap().unwrap();
    assert_eq!(after.start_time, before.start_time);
    assert_eq!(counters.runs(), 1);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_document_round_trip() {
    let store = Arc::new(InMemoryStore::new());
    let document = json!({
        "name": "report",
        "hash": 7,
        "recipients": ["ops"],
        "trigger": {"schedule": {"cron": ["0 0 9 * * ?", "0 0 17 * * ?"], "timezone": "Europe/Berlin"}}
    });
    store.put(INDEX, "report", document.clone()).await.unwrap();

    let source = IndexJobConfigSource::new(
        store,
        INDEX,
        Arc::new(DefaultJobConfigFactory::new("counting")),
    );
    let loaded = source.load().await.unwrap();
    let config = &loaded.configs[0];

    assert_eq!(config.key(), &key("report"));
    assert_eq!(config.hash_override(), Some(7));
    assert_eq!(
        config.schedule().cron_expressions(),
        vec!["0 0 9 * * ?", "0 0 17 * * ?"]
    );
    assert_eq!(config.schedule().timezone(), "Europe/Berlin");
    assert_eq!(config.data()["name"], document["name"]);
    assert_eq!(config.data()["recipients"], document["recipients"]);
    assert!(!config.data().contains_key("trigger"));
}

#[tokio::test]
async fn test_update_reaches_every_node() {
    let mut cluster = TestCluster::new(INDEX);
    cluster.start_node(NodeDescriptor::new("a")).await.unwrap();
    cluster.start_node(NodeDescriptor::new("b")).await.unwrap();

    let response = cluster.update_all().await;
    assert_eq!(response.nodes.len(), 2);
    assert_eq!(response.successes().count(), 2);
    assert_eq!(response.failures().count(), 0);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_update_for_unknown_scheduler_is_empty() {
    let mut cluster = TestCluster::new(INDEX);
    cluster.start_node(NodeDescriptor::new("a")).await.unwrap();

    let response = SchedulerConfigUpdateAction::send(cluster.bus(), "other").await;
    assert!(response.is_empty());

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_late_job_runs_after_update() {
    let mut cluster = TestCluster::new(INDEX);
    cluster.put_job("early", interval_job("100ms")).await.unwrap();
    cluster.start_node(NodeDescriptor::new("a")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(cluster.counters().runs_of(&key("late")), 0);

    cluster.put_job("late", interval_job("100ms")).await.unwrap();
    let response = cluster.update_all().await;
    assert_eq!(summaries(&response), vec!["new: 1; upd: 0; del: 0"]);

    let counters = cluster.counters().clone();
    wait_until("the late job to run", Duration::from_millis(3500), || {
        counters.runs_of(&key("late")) >= 1
    })
    .await;
    assert!(counters.runs_of(&key("early")) >= 1);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_config_poll_picks_up_new_jobs() {
    let counters = JobCounters::new();
    let job_counters = counters.clone();
    let registry = JobRegistry::new().register("counting", move || {
        Arc::new(CountingJob::new(job_counters.clone())) as Arc<dyn Job>
    });
    let store = Arc::new(InMemoryStore::new());

    let scheduler = Scheduler::builder(INDEX)
        .store(store.clone())
        .job_factory(Arc::new(registry))
        .job_config_factory(Arc::new(DefaultJobConfigFactory::new("counting")))
        .poll_interval(Duration::from_millis(20))
        .config_poll_interval(Duration::from_millis(100))
        .build()
        .unwrap();
    let (handle, task) = scheduler.start().await;
    handle.owned_jobs().await.unwrap();

    store.put(INDEX, "polled", interval_job("1h")).await.unwrap();
    wait_until("the polled job to run", Duration::from_secs(3), || {
        counters.runs_of(&key("polled")) == 1
    })
    .await;

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_store_failure_keeps_current_jobs() {
    let counters = JobCounters::new();
    let job_counters = counters.clone();
    let registry = JobRegistry::new().register("counting", move || {
        Arc::new(CountingJob::new(job_counters.clone())) as Arc<dyn Job>
    });
    let store = FailingStore::new(Arc::new(InMemoryStore::new()));
    store.put(INDEX, "tick", interval_job("50ms")).await.unwrap();

    let scheduler = Scheduler::builder(INDEX)
        .store(Arc::new(store.clone()))
        .job_factory(Arc::new(registry))
        .job_config_factory(Arc::new(DefaultJobConfigFactory::new("counting")))
        .poll_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    let (handle, task) = scheduler.start().await;
    assert_eq!(handle.owned_jobs().await.unwrap(), vec![key("tick")]);

    store.set_fail_reads(true);
    assert!(matches!(
        handle.update_jobs().await,
        Err(SchedulerError::Storage(_))
    ));
    assert_eq!(handle.owned_jobs().await.unwrap(), vec![key("tick")]);

    let before = counters.runs();
    wait_until("the job to keep firing", Duration::from_secs(3), || {
        counters.runs() >= before + 2
    })
    .await;

    store.set_fail_reads(false);
    assert_eq!(handle.update_jobs().await.unwrap().to_string(), "no changes");

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
