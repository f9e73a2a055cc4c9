//! Job ownership across a simulated cluster.

use crate::common::{INDEX, interval_job, key, pinned_job, wait_until};
use clustercron::cluster::resolve_owner;
use clustercron::core::job::identity_hash;
use clustercron::testing::TestCluster;
use clustercron::{JobKey, NodeDescriptor, NodeId};
use std::collections::HashMap;
use std::time::Duration;

/// Poll the cluster until every node owns exactly the expected jobs.
async fn wait_for_owners(cluster: &TestCluster, expected: &HashMap<NodeId, Vec<JobKey>>) {
    let start = tokio::time::Instant::now();
    loop {
        let mut owners = cluster.owners().await.unwrap();
        for jobs in owners.values_mut() {
            jobs.sort();
        }
        let matches = expected
            .iter()
            .all(|(node, jobs)| owners.get(node).map(Vec::as_slice).unwrap_or(&[]) == jobs.as_slice());
        if matches {
            return;
        }
        if start.elapsed() > Duration::from_secs(5) {
            panic!("owners did not settle: {:?}, expected {:?}", owners, expected);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_each_job_has_exactly_one_owner() {
    let mut cluster = TestCluster::new(INDEX);
    let names: Vec<String> = (0..8).map(|i| format!("job-{}", i)).collect();
    for name in &names {
        cluster.put_job(name, interval_job("1h")).await.unwrap();
    }

    let nodes = vec![
        NodeDescriptor::new("a"),
        NodeDescriptor::new("b"),
        NodeDescriptor::new("c"),
    ];
    for node in &nodes {
        cluster.start_node(node.clone()).await.unwrap();
    }

    let mut expected: HashMap<NodeId, Vec<JobKey>> =
        nodes.iter().map(|n| (n.id.clone(), Vec::new())).collect();
    for name in &names {
        let key = key(name);
        let owner = resolve_owner(identity_hash(&key), &nodes).unwrap();
        expected.get_mut(&owner.id).unwrap().push(key);
    }
    for jobs in expected.values_mut() {
        jobs.sort();
    }

    wait_for_owners(&cluster, &expected).await;

    let owners = cluster.owners().await.unwrap();
    let total: usize = owners.values().map(Vec::len).sum();
    assert_eq!(total, names.len());

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hash_override_pins_jobs() {
    let mut cluster = TestCluster::new(INDEX);
    for hash in 0..3u64 {
        cluster
            .put_job(&format!("p{}", hash), pinned_job("1h", hash))
            .await
            .unwrap();
    }

    // Started out of order; ownership follows the sorted node ids.
    for id in ["c", "a", "b"] {
        cluster.start_node(NodeDescriptor::new(id)).await.unwrap();
    }

    let expected = HashMap::from([
        (NodeId::new("a"), vec![key("p0")]),
        (NodeId::new("b"), vec![key("p1")]),
        (NodeId::new("c"), vec![key("p2")]),
    ]);
    wait_for_owners(&cluster, &expected).await;

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_jobs_move_when_owner_leaves() {
    let mut cluster = TestCluster::new(INDEX);
    cluster.put_job("moving", pinned_job("100ms", 1)).await.unwrap();

    cluster.start_node(NodeDescriptor::new("a")).await.unwrap();
    cluster.start_node(NodeDescriptor::new("b")).await.unwrap();

    let expected = HashMap::from([
        (NodeId::new("a"), vec![]),
        (NodeId::new("b"), vec![key("moving")]),
    ]);
    wait_for_owners(&cluster, &expected).await;

    let counters = cluster.counters().clone();
    wait_until("the owner to run the job", Duration::from_secs(3), || {
        counters.runs_on(&NodeId::new("b")) >= 1
    })
    .await;

    cluster.stop_node(&NodeId::new("b")).await.unwrap();
    let before = counters.runs_on(&NodeId::new("a"));

    let expected = HashMap::from([(NodeId::new("a"), vec![key("moving")])]);
    wait_for_owners(&cluster, &expected).await;

    wait_until("the new owner to run the job", Duration::from_secs(3), || {
        counters.runs_on(&NodeId::new("a")) > before
    })
    .await;

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_filter_runs_nothing() {
    let mut cluster = TestCluster::new(INDEX).with_node_filter("");
    cluster.put_job("tick", interval_job("50ms")).await.unwrap();

    let handle = cluster.start_node(NodeDescriptor::new("a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(handle.owned_jobs().await.unwrap().is_empty());
    assert_eq!(cluster.counters().runs(), 0);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unsatisfiable_filter_runs_nothing() {
    let mut cluster = TestCluster::new(INDEX).with_node_filter("zone:nowhere");
    cluster.put_job("tick", interval_job("50ms")).await.unwrap();

    cluster
        .start_node(NodeDescriptor::new("a").with_attribute("zone", "eu"))
        .await
        .unwrap();
    cluster
        .start_node(NodeDescriptor::new("b").with_attribute("zone", "us"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(cluster.counters().runs(), 0);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_name_filter_restricts_owners() {
    let mut cluster = TestCluster::new(INDEX).with_node_filter("_name:worker-*");
    for i in 0..4 {
        cluster
            .put_job(&format!("job-{}", i), interval_job("50ms"))
            .await
            .unwrap();
    }

    cluster
        .start_node(NodeDescriptor::new("a").with_name("worker-1"))
        .await
        .unwrap();
    cluster
        .start_node(NodeDescriptor::new("b").with_name("worker-2"))
        .await
        .unwrap();
    cluster
        .start_node(NodeDescriptor::new("c").with_name("backup"))
        .await
        .unwrap();

    let counters = cluster.counters().clone();
    wait_until("jobs to run", Duration::from_secs(3), || counters.runs() >= 8).await;

    assert_eq!(counters.runs_on(&NodeId::new("c")), 0);
    let owners = cluster.owners().await.unwrap();
    assert!(owners[&NodeId::new("c")].is_empty());

    cluster.shutdown().await.unwrap();
}
