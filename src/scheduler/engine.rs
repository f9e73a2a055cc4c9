//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Loading job configs and keeping the ones this node owns
//! - Firing due triggers into the bounded execution pool
//! - Re-evaluating ownership when the membership changes
//! - Answering cluster-wide config update requests
//! - Manual job triggers, pause and resume
//! - Event emission

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Interval;

use crate::cluster::{ConfigUpdateBus, ConfigUpdateRequest, JobDistributor, NodeDescriptor};
use crate::config::IndexJobConfigSource;
use crate::core::executable::{FiredTrigger, JobFactory};
use crate::core::schedule::MisfirePolicy;
use crate::core::types::{JobKey, RunId};
use crate::events::{Event, EventBus};
use crate::execution::{ExecutionPool, JobResult};
use crate::storage::DocumentStore;

use super::builder::SchedulerBuilder;
use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::jobs::JobTable;
use super::types::{SchedulerCommand, SchedulerError, SchedulerState, UpdateSummary};

/// Everything the builder resolved.
pub(crate) struct SchedulerSettings {
    pub name: String,
    pub store: Arc<dyn DocumentStore>,
    pub state_index: String,
    pub source: IndexJobConfigSource,
    pub job_factory: Arc<dyn JobFactory>,
    pub distributor: JobDistributor,
    pub membership_rx: watch::Receiver<u64>,
    pub misfire_threshold: Duration,
    pub misfire_policy: MisfirePolicy,
    pub max_threads: usize,
    pub poll_interval: Duration,
    pub config_poll_interval: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub event_bus: Arc<EventBus>,
    pub config_update_bus: Option<ConfigUpdateBus>,
}

/// A cluster-aware scheduler instance.
///
/// Created with [`Scheduler::builder`], consumed by [`Scheduler::start`].
pub struct Scheduler {
    name: String,
    source: IndexJobConfigSource,
    state_index: String,
    job_factory: Arc<dyn JobFactory>,
    distributor: JobDistributor,
    membership_rx: watch::Receiver<u64>,
    membership_open: bool,
    table: JobTable,
    pool: ExecutionPool,
    completion_rx: mpsc::UnboundedReceiver<JobResult>,
    misfire_threshold: Duration,
    misfire_policy: MisfirePolicy,
    poll_interval: Duration,
    config_poll_interval: Option<Duration>,
    shutdown_timeout: Duration,
    event_bus: Arc<EventBus>,
    config_update_bus: Option<ConfigUpdateBus>,
    update_rx: Option<mpsc::Receiver<ConfigUpdateRequest>>,
    registration: Option<u64>,
}

impl Scheduler {
    /// Start building a scheduler with the given name.
    pub fn builder(name: impl Into<String>) -> SchedulerBuilder {
        SchedulerBuilder::new(name)
    }

    pub(crate) fn new(settings: SchedulerSettings) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let node = settings.distributor.local_node().id.clone();

        Self {
            table: JobTable::new(settings.store, settings.state_index.clone(), node),
            pool: ExecutionPool::new(settings.max_threads, completion_tx),
            completion_rx,
            name: settings.name,
            source: settings.source,
            state_index: settings.state_index,
            job_factory: settings.job_factory,
            distributor: settings.distributor,
            membership_rx: settings.membership_rx,
            membership_open: true,
            misfire_threshold: settings.misfire_threshold,
            misfire_policy: settings.misfire_policy,
            poll_interval: settings.poll_interval,
            config_poll_interval: settings.config_poll_interval,
            shutdown_timeout: settings.shutdown_timeout,
            event_bus: settings.event_bus,
            config_update_bus: settings.config_update_bus,
            update_rx: None,
            registration: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config_index(&self) -> &str {
        self.source.config_index()
    }

    pub fn state_index(&self) -> &str {
        &self.state_index
    }

    pub fn max_threads(&self) -> usize {
        self.pool.max_threads()
    }

    pub fn local_node(&self) -> &NodeDescriptor {
        self.distributor.local_node()
    }

    /// Whether the node filter admits the local node.
    pub fn is_local_node_eligible(&self) -> bool {
        self.distributor.is_local_node_eligible()
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Start the scheduler and return a handle for controlling it.
    ///
    /// The config index is loaded on the scheduler task right after start;
    /// the handle is usable immediately.
    pub async fn start(mut self) -> (SchedulerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        if let Some(bus) = &self.config_update_bus {
            let (id, rx) = bus.register(self.local_node().id.clone(), self.name.clone());
            self.registration = Some(id);
            self.update_rx = Some(rx);
        }

        tracing::info!(
            scheduler = %self.name,
            node = %self.local_node().id,
            config_index = %self.config_index(),
            eligible = self.is_local_node_eligible(),
            "scheduler started"
        );

        let handle = SchedulerHandle {
            name: Arc::from(self.name.as_str()),
            command_tx,
            state: Arc::clone(&state),
        };

        let scheduler_task = tokio::spawn(async move {
            self.run(command_rx, state).await;
        });

        (handle, scheduler_task)
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let mut interval = tokio::time::interval(self.poll_interval);
        let mut config_poll = self.config_poll_interval.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        if let Err(e) = self.update_jobs().await {
            tracing::warn!(scheduler = %self.name, error = %e, "initial job load failed");
        }

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.table.has_handovers() {
                        let live = self.distributor.live_node_ids();
                        self.table.check_handovers(&live).await;
                    }
                    if *state.read().await == SchedulerState::Running {
                        self.fire_due().await;
                    }
                    self.table.flush().await;
                }

                Some(result) = self.completion_rx.recv() => {
                    self.on_completed(result).await;
                    if *state.read().await == SchedulerState::Running {
                        self.fire_due().await;
                    }
                    self.table.flush().await;
                }

                Some(request) = next_update_request(&mut self.update_rx) => {
                    let result = self
                        .update_jobs()
                        .await
                        .map(|summary| summary.to_string())
                        .map_err(|e| e.to_string());
                    let _ = request.respond_to.send(result);
                }

                changed = self.membership_rx.changed(), if self.membership_open => {
                    match changed {
                        Ok(()) => self.on_membership_changed().await,
                        Err(_) => {
                            tracing::debug!(scheduler = %self.name, "membership provider closed");
                            self.membership_open = false;
                        }
                    }
                }

                _ = next_poll(&mut config_poll) => {
                    if let Err(e) = self.update_jobs().await {
                        tracing::warn!(scheduler = %self.name, error = %e, "periodic config poll failed");
                    }
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        SchedulerCommand::Trigger { key, response } => {
                            let result = self.trigger_job(&key).await;
                            let _ = response.send(result);
                        }
                        SchedulerCommand::UpdateJobs { response } => {
                            let result = self.update_jobs().await;
                            let _ = response.send(result);
                        }
                        SchedulerCommand::OwnedJobs { response } => {
                            let _ = response.send(Ok(self.table.keys()));
                        }
                        SchedulerCommand::JobState { key, response } => {
                            let _ = response.send(Ok(self.table.state(&key).cloned()));
                        }
                        SchedulerCommand::Pause { response } => {
                            let mut s = state.write().await;
                            *s = SchedulerState::Paused;
                            tracing::info!(scheduler = %self.name, "scheduler paused");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Resume { response } => {
                            let mut s = state.write().await;
                            *s = SchedulerState::Running;
                            tracing::info!(
                                scheduler = %self.name,
                                "scheduler resumed, fires missed during pause follow the misfire policy"
                            );
                            let _ = response.send(());
                        }
                        SchedulerCommand::Shutdown { response } => {
                            let mut s = state.write().await;
                            *s = SchedulerState::Stopped;
                            drop(s); // Release the lock before waiting

                            self.await_running_jobs().await;
                            while let Ok(result) = self.completion_rx.try_recv() {
                                self.on_completed(result).await;
                            }
                            self.table.flush().await;
                            if let (Some(bus), Some(id)) = (&self.config_update_bus, self.registration) {
                                bus.unregister(id);
                            }
                            tracing::info!(scheduler = %self.name, node = %self.local_node().id, "scheduler stopped");

                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Re-read the config index and apply the owned subset.
    ///
    /// A store failure leaves the current jobs running.
    async fn update_jobs(&mut self) -> Result<UpdateSummary, SchedulerError> {
        self.refresh_membership().await;

        let loaded = match self.source.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(
                    scheduler = %self.name,
                    error = %e,
                    "failed to read config index, keeping current jobs"
                );
                return Err(e.into());
            }
        };

        let mut present: HashSet<JobKey> =
            loaded.rejected.iter().map(|(key, _)| key.clone()).collect();
        present.extend(loaded.configs.iter().map(|config| config.key().clone()));

        let owned: Vec<_> = loaded
            .configs
            .into_iter()
            .filter(|config| config.is_enabled())
            .filter(|config| self.distributor.is_responsible(config))
            .collect();

        let live = self.distributor.live_node_ids();
        let summary = self.table.apply(owned, &present, &live, Utc::now()).await;
        self.table.flush().await;

        if summary.is_empty() {
            tracing::debug!(scheduler = %self.name, "config update: no changes");
        } else {
            tracing::info!(
                scheduler = %self.name,
                node = %self.local_node().id,
                summary = %summary,
                owned = self.table.len(),
                "jobs updated"
            );
            self.event_bus
                .emit(Event::jobs_updated(summary.new, summary.updated, summary.deleted))
                .await;
        }

        Ok(summary)
    }

    async fn on_membership_changed(&mut self) {
        if !self.refresh_membership().await {
            return;
        }
        if let Err(e) = self.update_jobs().await {
            tracing::warn!(scheduler = %self.name, error = %e, "ownership re-evaluation failed");
        }
    }

    /// Take a new membership snapshot. Returns whether the eligible set
    /// changed.
    async fn refresh_membership(&mut self) -> bool {
        if !self.distributor.refresh() {
            return false;
        }

        let node = self.local_node().id.clone();
        let eligible = self.distributor.eligible_nodes().len();
        let local_eligible = self.distributor.is_local_node_eligible();
        tracing::info!(
            scheduler = %self.name,
            node = %node,
            eligible,
            local_eligible,
            "cluster membership changed, re-evaluating ownership"
        );
        self.event_bus
            .emit(Event::ownership_changed(node, eligible, local_eligible))
            .await;
        true
    }

    /// Fire as many due triggers as there are free execution slots.
    async fn fire_due(&mut self) {
        let acquired = self.table.acquire_due(
            Utc::now(),
            self.pool.available_permits(),
            self.misfire_threshold,
            self.misfire_policy,
        );

        for misfire in acquired.misfires {
            tracing::warn!(
                job = %misfire.key,
                missed_fire_time = %misfire.missed_fire_time,
                fire_now = misfire.fire_now,
                "trigger misfired"
            );
            self.event_bus
                .emit(Event::job_misfired(
                    misfire.key,
                    misfire.missed_fire_time,
                    misfire.fire_now,
                ))
                .await;
        }

        for trigger in acquired.fired {
            // Failures are logged and reported by dispatch.
            let _ = self.dispatch(trigger).await;
        }
    }

    async fn trigger_job(&mut self, key: &JobKey) -> Result<RunId, SchedulerError> {
        if !self.table.contains(key) {
            return Err(SchedulerError::JobNotFound(key.to_string()));
        }
        if self.pool.available_permits() == 0 {
            return Err(SchedulerError::NoCapacity(key.to_string()));
        }
        let trigger = self.table.fire_now(key, Utc::now())?;
        tracing::info!(job = %key, run = %trigger.run_id, "manual trigger");
        self.dispatch(trigger).await
    }

    /// Hand a fired trigger to the execution pool.
    async fn dispatch(&mut self, trigger: FiredTrigger) -> Result<RunId, SchedulerError> {
        let key = trigger.key.clone();
        let run_id = trigger.run_id.clone();
        let node = trigger.node.clone();
        let scheduled_fire_time = trigger.scheduled_fire_time;

        let job = match self.job_factory.new_job(&trigger) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job = %key, job_type = %trigger.job_type, error = %e, "failed to create job");
                self.table.completed(&key);
                self.event_bus
                    .emit(Event::job_completed(
                        key,
                        run_id,
                        Some(e.to_string()),
                        Duration::ZERO,
                    ))
                    .await;
                return Err(e.into());
            }
        };

        if let Err(trigger) = self.pool.try_execute(trigger, job) {
            tracing::warn!(job = %trigger.key, "no free execution slot, fire dropped");
            self.table.completed(&trigger.key);
            return Err(SchedulerError::NoCapacity(trigger.key.to_string()));
        }

        tracing::debug!(job = %key, run = %run_id, scheduled = %scheduled_fire_time, "job fired");
        self.event_bus
            .emit(Event::job_fired(key, run_id.clone(), node, scheduled_fire_time))
            .await;
        Ok(run_id)
    }

    async fn on_completed(&mut self, result: JobResult) {
        self.table.completed(&result.key);
        tracing::debug!(
            job = %result.key,
            run = %result.run_id,
            success = result.success,
            duration_ms = result.duration.as_millis() as u64,
            "job completed"
        );
        self.event_bus
            .emit(Event::job_completed(
                result.key,
                result.run_id,
                result.error,
                result.duration,
            ))
            .await;
    }

    /// Wait for in-flight executions, up to the shutdown timeout.
    async fn await_running_jobs(&self) {
        let running_count = self.pool.running();

        if running_count == 0 {
            tracing::info!("No running jobs to wait for during shutdown");
            return;
        }

        tracing::info!(
            "Graceful shutdown: waiting for {} running job(s) to complete (timeout: {:?})",
            running_count,
            self.shutdown_timeout
        );

        let start = tokio::time::Instant::now();
        if self.pool.wait_idle(self.shutdown_timeout).await {
            tracing::info!("All running jobs completed gracefully in {:?}", start.elapsed());
        } else {
            tracing::warn!(
                "Graceful shutdown timeout ({:?}) exceeded with {} job(s) still running",
                self.shutdown_timeout,
                self.pool.running()
            );
        }
    }
}

async fn next_update_request(
    rx: &mut Option<mpsc::Receiver<ConfigUpdateRequest>>,
) -> Option<ConfigUpdateRequest> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_poll(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
