//! Misfire handling for triggers resumed long after their fire time.

use crate::common::{INDEX, RecordingHandler, interval_job, key, wait_until};
use chrono::{DateTime, TimeDelta, Utc};
use clustercron::scheduler::STATE_INDEX_SUFFIX;
use clustercron::storage::save_trigger_state;
use clustercron::testing::TestCluster;
use clustercron::{
    EventBus, MisfirePolicy, NodeDescriptor, NodeId, Schedule, SchedulerHandle, TriggerState,
    TriggerStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Persist a state for a one-minute job whose next fire is `behind` ago.
async fn seed_state(cluster: &TestCluster, name: &str, behind: TimeDelta, status: TriggerStatus) {
    let now = Utc::now();
    let schedule = Schedule::parse_interval("1m").unwrap();
    let start: DateTime<Utc> = now - TimeDelta::hours(1) - behind;

    let mut state = TriggerState::new(&schedule, start).unwrap();
    state.next_fire_time = Some(state.start_time + TimeDelta::hours(1));
    state.previous_fire_time = Some(state.start_time + TimeDelta::minutes(59));
    state.times_triggered = 60;
    state.status = status;
    state.node = Some(NodeId::new("gone"));

    let state_index = format!("{}{}", INDEX, STATE_INDEX_SUFFIX);
    save_trigger_state(cluster.store().as_ref(), &state_index, &key(name), &state)
        .await
        .unwrap();
}

async fn start_with_policy(
    cluster: &TestCluster,
    policy: MisfirePolicy,
    events: Arc<RecordingHandler>,
) -> (SchedulerHandle, JoinHandle<()>) {
    let bus = Arc::new(EventBus::new());
    bus.register(events).await;

    let node = NodeDescriptor::new("a");
    cluster.roster().add_node(node.clone());
    let scheduler = cluster
        .scheduler_builder(node)
        .misfire_policy(policy)
        .misfire_threshold(Duration::from_secs(10))
        .event_bus(bus)
        .build()
        .unwrap();
    let (handle, task) = scheduler.start().await;
    handle.owned_jobs().await.unwrap();
    (handle, task)
}

#[tokio::test]
async fn test_fire_once_now_runs_missed_job_once() {
    let cluster = TestCluster::new(INDEX);
    cluster.put_job("minutely", interval_job("1m")).await.unwrap();
    seed_state(&cluster, "minutely", TimeDelta::seconds(30), TriggerStatus::Waiting).await;

    let events = RecordingHandler::new();
    let (handle, task) =
        start_with_policy(&cluster, MisfirePolicy::FireOnceNow, events.clone()).await;

    let counters = cluster.counters().clone();
    wait_until("the missed fire", Duration::from_secs(3), || counters.runs() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let state = handle.job_state(key("minutely")).await.unwrap().unwrap();
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(counters.runs(), 1);
    assert_eq!(events.misfires().await, vec![true]);
    assert_eq!(state.times_triggered, 61);
    // Back on the original one-minute grid.
    let next = state.next_fire_time.unwrap();
    assert_eq!((next - state.start_time).num_milliseconds() % 60_000, 0);
    assert!(next > Utc::now());
}

#[tokio::test]
async fn test_skip_drops_missed_fire() {
    let cluster = TestCluster::new(INDEX);
    cluster.put_job("minutely", interval_job("1m")).await.unwrap();
    seed_state(&cluster, "minutely", TimeDelta::seconds(30), TriggerStatus::Waiting).await;

    let events = RecordingHandler::new();
    let (handle, task) = start_with_policy(&cluster, MisfirePolicy::Skip, events.clone()).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let state = handle.job_state(key("minutely")).await.unwrap().unwrap();
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(cluster.counters().runs(), 0);
    assert_eq!(events.misfires().await, vec![false]);
    assert_eq!(state.times_triggered, 60);
    assert!(state.next_fire_time.unwrap() > Utc::now());
}

#[tokio::test]
async fn test_late_fire_within_threshold_is_not_a_misfire() {
    let cluster = TestCluster::new(INDEX);
    cluster.put_job("minutely", interval_job("1m")).await.unwrap();
    seed_state(&cluster, "minutely", TimeDelta::seconds(2), TriggerStatus::Waiting).await;

    let events = RecordingHandler::new();
    let (handle, task) = start_with_policy(&cluster, MisfirePolicy::Skip, events.clone()).await;

    let counters = cluster.counters().clone();
    wait_until("the late fire", Duration::from_secs(3), || counters.runs() == 1).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(events.misfires().await.is_empty());
}

#[tokio::test]
async fn test_interrupted_run_is_recovered() {
    let cluster = TestCluster::new(INDEX);
    cluster.put_job("minutely", interval_job("1m")).await.unwrap();
    // The previous owner died mid-run.
    seed_state(&cluster, "minutely", TimeDelta::seconds(2), TriggerStatus::Executing).await;

    let events = RecordingHandler::new();
    let (handle, task) =
        start_with_policy(&cluster, MisfirePolicy::FireOnceNow, events.clone()).await;

    let state = handle.job_state(key("minutely")).await.unwrap().unwrap();
    assert_eq!(state.node, Some(NodeId::new("a")));

    let counters = cluster.counters().clone();
    wait_until("the recovered fire", Duration::from_secs(3), || counters.runs() == 1).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
