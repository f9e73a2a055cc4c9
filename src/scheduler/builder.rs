//! Fluent construction of a [`Scheduler`].

use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{
    ConfigUpdateBus, JobDistributor, LocalMembership, MembershipProvider, NodeComparator,
    NodeFilter, NodeIdComparator,
};
use crate::config::IndexJobConfigSource;
use crate::core::executable::JobFactory;
use crate::core::job::{DefaultJobConfigFactory, JobConfigFactory};
use crate::core::schedule::MisfirePolicy;
use crate::events::EventBus;
use crate::storage::DocumentStore;

use super::engine::{Scheduler, SchedulerSettings};
use super::types::SchedulerError;

/// Job type assigned by the default config factory.
pub const DEFAULT_JOB_TYPE: &str = "default";

/// Suffix appended to the config index to name the trigger state index.
pub const STATE_INDEX_SUFFIX: &str = "_trigger_state";

const DEFAULT_MAX_THREADS: usize = 3;
const DEFAULT_MISFIRE_THRESHOLD: Duration = Duration::from_millis(10_000);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for [`Scheduler`].
///
/// A store and a job factory are required; everything else has a default.
///
/// ```no_run
/// use std::sync::Arc;
/// use clustercron::core::executable::JobRegistry;
/// use clustercron::scheduler::Scheduler;
/// use clustercron::storage::InMemoryStore;
///
/// let scheduler = Scheduler::builder("jobs")
///     .store(Arc::new(InMemoryStore::new()))
///     .job_factory(Arc::new(JobRegistry::new()))
///     .node_filter("_all")
///     .build()
///     .unwrap();
/// ```
pub struct SchedulerBuilder {
    name: String,
    store: Option<Arc<dyn DocumentStore>>,
    node_filter: Option<String>,
    config_index: Option<String>,
    state_index: Option<String>,
    job_config_factory: Option<Arc<dyn JobConfigFactory>>,
    job_factory: Option<Arc<dyn JobFactory>>,
    misfire_threshold: Duration,
    misfire_policy: MisfirePolicy,
    max_threads: usize,
    membership: Option<Arc<dyn MembershipProvider>>,
    comparator: Arc<dyn NodeComparator>,
    poll_interval: Duration,
    config_poll_interval: Option<Duration>,
    shutdown_timeout: Duration,
    event_bus: Option<Arc<EventBus>>,
    config_update_bus: Option<ConfigUpdateBus>,
}

impl SchedulerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: None,
            node_filter: None,
            config_index: None,
            state_index: None,
            job_config_factory: None,
            job_factory: None,
            misfire_threshold: DEFAULT_MISFIRE_THRESHOLD,
            misfire_policy: MisfirePolicy::default(),
            max_threads: DEFAULT_MAX_THREADS,
            membership: None,
            comparator: Arc::new(NodeIdComparator),
            poll_interval: DEFAULT_POLL_INTERVAL,
            config_poll_interval: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            event_bus: None,
            config_update_bus: None,
        }
    }

    /// Document store holding the config and state indices.
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Restrict which nodes may own jobs. Without a filter every live node
    /// is eligible; an empty expression makes no node eligible.
    pub fn node_filter(mut self, expression: impl Into<String>) -> Self {
        self.node_filter = Some(expression.into());
        self
    }

    /// Index job documents are read from. Defaults to the scheduler name.
    pub fn config_index(mut self, index: impl Into<String>) -> Self {
        self.config_index = Some(index.into());
        self
    }

    /// Index trigger states are kept in. Defaults to
    /// `<config_index>_trigger_state`.
    pub fn state_index(mut self, index: impl Into<String>) -> Self {
        self.state_index = Some(index.into());
        self
    }

    pub fn job_config_factory(mut self, factory: Arc<dyn JobConfigFactory>) -> Self {
        self.job_config_factory = Some(factory);
        self
    }

    pub fn job_factory(mut self, factory: Arc<dyn JobFactory>) -> Self {
        self.job_factory = Some(factory);
        self
    }

    pub fn misfire_threshold(mut self, threshold: Duration) -> Self {
        self.misfire_threshold = threshold;
        self
    }

    pub fn misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    /// Maximum number of concurrently executing jobs.
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Run as a member of a cluster. Without this the scheduler is the only
    /// node and owns every job that passes the filter.
    pub fn distributed(mut self, membership: Arc<dyn MembershipProvider>) -> Self {
        self.membership = Some(membership);
        self
    }

    pub fn node_comparator(mut self, comparator: Arc<dyn NodeComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// How often the loop looks for due triggers.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Re-read the config index periodically, in addition to explicit
    /// update requests.
    pub fn config_poll_interval(mut self, interval: Duration) -> Self {
        self.config_poll_interval = Some(interval);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Make the scheduler reachable by
    /// [`SchedulerConfigUpdateAction`](crate::cluster::SchedulerConfigUpdateAction).
    pub fn config_update_bus(mut self, bus: ConfigUpdateBus) -> Self {
        self.config_update_bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "scheduler name must not be empty".to_string(),
            ));
        }
        let store = self
            .store
            .ok_or_else(|| SchedulerError::InvalidConfig("a document store is required".to_string()))?;
        let job_factory = self
            .job_factory
            .ok_or_else(|| SchedulerError::InvalidConfig("a job factory is required".to_string()))?;
        if self.max_threads == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_threads must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.config_poll_interval.is_some_and(|d| d.is_zero()) {
            return Err(SchedulerError::InvalidConfig(
                "config_poll_interval must be greater than zero".to_string(),
            ));
        }

        let filter = self
            .node_filter
            .as_deref()
            .map(NodeFilter::parse)
            .transpose()
            .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;

        let config_index = self.config_index.unwrap_or_else(|| self.name.clone());
        let state_index = self
            .state_index
            .unwrap_or_else(|| format!("{}{}", config_index, STATE_INDEX_SUFFIX));
        if state_index == config_index {
            return Err(SchedulerError::InvalidConfig(
                "state index must differ from the config index".to_string(),
            ));
        }

        let job_config_factory = self
            .job_config_factory
            .unwrap_or_else(|| Arc::new(DefaultJobConfigFactory::new(DEFAULT_JOB_TYPE)));
        let source = IndexJobConfigSource::new(store.clone(), config_index, job_config_factory)
            .with_job_factory(job_factory.clone());

        let membership = self
            .membership
            .unwrap_or_else(|| Arc::new(LocalMembership::default()));
        let membership_rx = membership.subscribe();
        let distributor = JobDistributor::new(membership, filter, self.comparator);

        Ok(Scheduler::new(SchedulerSettings {
            name: self.name,
            store,
            state_index,
            source,
            job_factory,
            distributor,
            membership_rx,
            misfire_threshold: self.misfire_threshold,
            misfire_policy: self.misfire_policy,
            max_threads: self.max_threads,
            poll_interval: self.poll_interval,
            config_poll_interval: self.config_poll_interval,
            shutdown_timeout: self.shutdown_timeout,
            event_bus: self.event_bus.unwrap_or_default(),
            config_update_bus: self.config_update_bus,
        }))
    }
}
