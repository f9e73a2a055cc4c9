//! Testing utilities for users of the clustercron library.
//!
//! This module provides helpers for testing scheduled jobs:
//!
//! - [`JobCounters`]: Shared counters observed by test jobs
//! - [`CountingJob`]: A job that records every run and optionally sleeps
//! - [`FailingJob`]: A job helper that fails N times then succeeds
//! - [`FailingStore`]: A store wrapper with switchable read/write failures
//! - [`TestCluster`]: Several simulated nodes sharing one store and roster

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cluster::{
    ConfigUpdateBus, ConfigUpdateResponse, NodeDescriptor, SchedulerConfigUpdateAction,
    StaticMembership,
};
use crate::core::executable::{Job, JobError, JobExecutionContext, JobRegistry};
use crate::core::job::DefaultJobConfigFactory;
use crate::core::types::{JobKey, NodeId};
use crate::scheduler::{Scheduler, SchedulerBuilder, SchedulerError, SchedulerHandle};
use crate::storage::{DocumentStore, InMemoryStore, StorageError, StoredDocument};

/// Job type the [`TestCluster`] registers [`CountingJob`] under.
pub const COUNTING_JOB_TYPE: &str = "counting";

#[derive(Debug, Default)]
struct CounterState {
    runs: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    by_key: Mutex<HashMap<JobKey, usize>>,
    by_node: Mutex<HashMap<NodeId, usize>>,
}

/// Run counters shared between a test and the jobs it schedules.
///
/// Clones share the same counters.
///
/// # Example
///
/// ```
/// use clustercron::testing::{CountingJob, JobCounters};
///
/// let counters = JobCounters::new();
/// let job = CountingJob::new(counters.clone());
/// assert_eq!(counters.runs(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct JobCounters {
    inner: Arc<CounterState>,
}

impl JobCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of runs started.
    pub fn runs(&self) -> usize {
        self.inner.runs.load(Ordering::SeqCst)
    }

    /// Runs currently executing.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Highest number of runs observed executing at the same time.
    pub fn max_active(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    /// Runs started for one job.
    pub fn runs_of(&self, key: &JobKey) -> usize {
        lock(&self.inner.by_key).get(key).copied().unwrap_or(0)
    }

    /// Runs started on one node.
    pub fn runs_on(&self, node: &NodeId) -> usize {
        lock(&self.inner.by_node).get(node).copied().unwrap_or(0)
    }

    /// Nodes that ran at least one job.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = lock(&self.inner.by_node).keys().cloned().collect();
        nodes.sort();
        nodes
    }

    fn enter(&self, ctx: &JobExecutionContext) -> ActiveGuard {
        self.inner.runs.fetch_add(1, Ordering::SeqCst);
        *lock(&self.inner.by_key).entry(ctx.key.clone()).or_default() += 1;
        *lock(&self.inner.by_node).entry(ctx.node.clone()).or_default() += 1;

        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_active.fetch_max(active, Ordering::SeqCst);
        ActiveGuard {
            counters: self.inner.clone(),
        }
    }
}

struct ActiveGuard {
    counters: Arc<CounterState>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A job that records each run in a [`JobCounters`].
///
/// The run lasts `sleep_ms` from the job's data map, or the configured
/// default sleep.
pub struct CountingJob {
    counters: JobCounters,
    sleep: Duration,
}

impl CountingJob {
    pub fn new(counters: JobCounters) -> Self {
        Self {
            counters,
            sleep: Duration::ZERO,
        }
    }

    /// A counting job nobody observes.
    pub fn detached() -> Self {
        Self::new(JobCounters::new())
    }

    /// Sleep this long when the data map has no `sleep_ms`.
    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }
}

#[async_trait]
impl Job for CountingJob {
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobError> {
        let _active = self.counters.enter(ctx);
        let sleep = ctx
            .data_u64("sleep_ms")
            .map(Duration::from_millis)
            .unwrap_or(self.sleep);
        if !sleep.is_zero() {
            tokio::time::sleep(sleep).await;
        }
        Ok(())
    }
}

/// A job that fails a configurable number of times before succeeding.
///
/// Useful for checking that a failing run does not disable the job.
///
/// # Example
///
/// ```
/// use clustercron::testing::FailingJob;
///
/// // Fails 2 times, then succeeds on the 3rd run
/// let job = FailingJob::new(2);
/// assert_eq!(job.remaining_failures(), 2);
/// ```
pub struct FailingJob {
    remaining: AtomicUsize,
    calls: AtomicUsize,
    message: String,
    panics: bool,
}

impl FailingJob {
    /// Create a job that fails `fail_count` times then succeeds.
    pub fn new(fail_count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(fail_count),
            calls: AtomicUsize::new(0),
            message: "simulated failure".to_string(),
            panics: false,
        }
    }

    /// Create a job that never succeeds.
    pub fn always() -> Self {
        Self::new(usize::MAX)
    }

    /// Fail with a custom error message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Panic instead of returning an error.
    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn remaining_failures(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Number of times the job ran.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Job for FailingJob {
    async fn execute(&self, _ctx: &JobExecutionContext) -> Result<(), JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !failing {
            return Ok(());
        }
        if self.panics {
            panic!("{}", self.message);
        }
        Err(JobError::ExecutionFailed(self.message.clone()))
    }
}

/// A [`DocumentStore`] wrapper whose reads and writes can be made to fail.
#[derive(Clone)]
pub struct FailingStore {
    inner: Arc<dyn DocumentStore>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner,
            fail_reads: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make `get` and `list` fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make `put` and `delete` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> Result<(), StorageError> {
        if flag.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for FailingStore {
    async fn put(&self, index: &str, id: &str, source: Value) -> Result<i64, StorageError> {
        Self::check(&self.fail_writes)?;
        self.inner.put(index, id, source).await
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<StoredDocument>, StorageError> {
        Self::check(&self.fail_reads)?;
        self.inner.get(index, id).await
    }

    async fn delete(&self, index: &str, id: &str) -> Result<bool, StorageError> {
        Self::check(&self.fail_writes)?;
        self.inner.delete(index, id).await
    }

    async fn list(&self, index: &str) -> Result<Vec<StoredDocument>, StorageError> {
        Self::check(&self.fail_reads)?;
        self.inner.list(index).await
    }
}

struct TestNode {
    id: NodeId,
    handle: SchedulerHandle,
    task: JoinHandle<()>,
}

/// Simulated cluster of scheduler instances in one process.
///
/// All nodes share one [`InMemoryStore`], one [`StaticMembership`] roster,
/// one [`ConfigUpdateBus`] and one set of [`JobCounters`]. Jobs default to
/// [`CountingJob`].
///
/// # Example
///
/// ```ignore
/// use clustercron::cluster::NodeDescriptor;
/// use clustercron::testing::TestCluster;
///
/// let mut cluster = TestCluster::new("jobs");
/// cluster.put_job("tick", serde_json::json!({"trigger": {"schedule": {"interval": "100ms"}}})).await;
/// cluster.start_node(NodeDescriptor::new("a")).await?;
/// cluster.start_node(NodeDescriptor::new("b")).await?;
/// ```
pub struct TestCluster {
    name: String,
    store: Arc<InMemoryStore>,
    roster: StaticMembership,
    bus: ConfigUpdateBus,
    counters: JobCounters,
    registry: JobRegistry,
    node_filter: Option<String>,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Create an empty cluster whose schedulers are named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        let counters = JobCounters::new();
        let job_counters = counters.clone();
        let registry = JobRegistry::new().register(COUNTING_JOB_TYPE, move || {
            Arc::new(CountingJob::new(job_counters.clone())) as Arc<dyn Job>
        });

        Self {
            name: name.into(),
            store: Arc::new(InMemoryStore::new()),
            roster: StaticMembership::new(NodeDescriptor::new("roster"), Vec::new()),
            bus: ConfigUpdateBus::new(),
            counters,
            registry,
            node_filter: None,
            nodes: Vec::new(),
        }
    }

    /// Register an extra job type for every node.
    pub fn with_job(mut self, job_type: impl Into<String>, job: Arc<dyn Job>) -> Self {
        self.registry = self.registry.register_instance(job_type, job);
        self
    }

    /// Node filter applied by every node started afterwards.
    pub fn with_node_filter(mut self, expression: impl Into<String>) -> Self {
        self.node_filter = Some(expression.into());
        self
    }

    pub fn store(&self) -> Arc<InMemoryStore> {
        self.store.clone()
    }

    pub fn counters(&self) -> &JobCounters {
        &self.counters
    }

    pub fn bus(&self) -> &ConfigUpdateBus {
        &self.bus
    }

    pub fn roster(&self) -> &StaticMembership {
        &self.roster
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    pub fn handle(&self, id: &NodeId) -> Option<&SchedulerHandle> {
        self.nodes.iter().find(|n| &n.id == id).map(|n| &n.handle)
    }

    /// Write a job document into the config index. Returns its version.
    pub async fn put_job(&self, id: &str, document: Value) -> Result<i64, StorageError> {
        self.store.put(&self.name, id, document).await
    }

    /// A builder preconfigured for a node of this cluster.
    pub fn scheduler_builder(&self, node: NodeDescriptor) -> SchedulerBuilder {
        let builder = Scheduler::builder(self.name.clone())
            .store(self.store.clone())
            .distributed(Arc::new(self.roster.for_node(node)))
            .job_factory(Arc::new(self.registry.clone()))
            .job_config_factory(Arc::new(DefaultJobConfigFactory::new(COUNTING_JOB_TYPE)))
            .config_update_bus(self.bus.clone())
            .poll_interval(Duration::from_millis(20))
            .shutdown_timeout(Duration::from_secs(5));
        match &self.node_filter {
            Some(filter) => builder.node_filter(filter.clone()),
            None => builder,
        }
    }

    /// Add a node to the roster and start its scheduler.
    pub async fn start_node(&mut self, node: NodeDescriptor) -> Result<SchedulerHandle, SchedulerError> {
        let id = node.id.clone();
        self.roster.add_node(node.clone());
        let scheduler = self.scheduler_builder(node).build()?;
        let (handle, task) = scheduler.start().await;
        // The initial load has run once the first command is answered.
        handle.owned_jobs().await?;
        self.nodes.push(TestNode {
            id,
            handle: handle.clone(),
            task,
        });
        Ok(handle)
    }

    /// Shut a node down and remove it from the roster.
    pub async fn stop_node(&mut self, id: &NodeId) -> Result<(), SchedulerError> {
        let Some(pos) = self.nodes.iter().position(|n| &n.id == id) else {
            return Err(SchedulerError::InvalidConfig(format!("unknown node '{}'", id)));
        };
        let node = self.nodes.remove(pos);
        self.roster.remove_node(id);
        node.handle.shutdown().await?;
        let _ = node.task.await;
        Ok(())
    }

    /// Send the config update action to every node.
    pub async fn update_all(&self) -> ConfigUpdateResponse {
        SchedulerConfigUpdateAction::send(&self.bus, &self.name).await
    }

    /// Jobs owned by each running node.
    pub async fn owners(&self) -> Result<HashMap<NodeId, Vec<JobKey>>, SchedulerError> {
        let mut owners = HashMap::new();
        for node in &self.nodes {
            owners.insert(node.id.clone(), node.handle.owned_jobs().await?);
        }
        Ok(owners)
    }

    /// Shut every node down.
    pub async fn shutdown(mut self) -> Result<(), SchedulerError> {
        for node in self.nodes.drain(..) {
            node.handle.shutdown().await?;
            let _ = node.task.await;
        }
        Ok(())
    }
}
