//! The set of jobs a scheduler instance currently owns.
//!
//! [`JobTable`] diffs freshly loaded configs against what is scheduled,
//! keeps one [`TriggerState`] per owned job and hands out due fires.
//!
//! A job that changes owner while a run is in flight is handed over: the
//! old owner keeps tracking the run and saves the finished state, and the
//! new owner holds the job until that state shows up or the old owner
//! leaves the cluster.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::executable::FiredTrigger;
use crate::core::job::JobConfig;
use crate::core::schedule::MisfirePolicy;
use crate::core::trigger::{Misfire, TriggerState, TriggerStatus};
use crate::core::types::{JobKey, NodeId, RunId};
use crate::storage::{
    DocumentStore, delete_trigger_state, load_trigger_state, save_trigger_state,
};

use super::types::{SchedulerError, UpdateSummary};

struct ScheduledJob {
    config: JobConfig,
    state: TriggerState,
    /// Runs handed to the pool that have not reported back.
    running: usize,
    dirty: bool,
    /// Previous owner whose run has not finished yet.
    handover: Option<NodeId>,
}

impl ScheduledJob {
    fn is_blocked(&self) -> bool {
        self.handover.is_some()
            || (self.config.is_concurrent_execution_disallowed() && self.running > 0)
    }
}

/// A misfire detected while acquiring due triggers.
#[derive(Debug, Clone)]
pub(crate) struct MisfireNotice {
    pub key: JobKey,
    pub missed_fire_time: DateTime<Utc>,
    pub fire_now: bool,
}

/// Output of [`JobTable::acquire_due`].
#[derive(Debug, Default)]
pub(crate) struct Acquired {
    pub fired: Vec<FiredTrigger>,
    pub misfires: Vec<MisfireNotice>,
}

pub(crate) struct JobTable {
    jobs: BTreeMap<JobKey, ScheduledJob>,
    /// Jobs moved to another node while still running here.
    departed: HashMap<JobKey, ScheduledJob>,
    store: Arc<dyn DocumentStore>,
    state_index: String,
    node: NodeId,
}

impl JobTable {
    pub fn new(store: Arc<dyn DocumentStore>, state_index: impl Into<String>, node: NodeId) -> Self {
        Self {
            jobs: BTreeMap::new(),
            departed: HashMap::new(),
            store,
            state_index: state_index.into(),
            node,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn keys(&self) -> Vec<JobKey> {
        self.jobs.keys().cloned().collect()
    }

    pub fn contains(&self, key: &JobKey) -> bool {
        self.jobs.contains_key(key)
    }

    #[cfg(test)]
    pub fn config(&self, key: &JobKey) -> Option<&JobConfig> {
        self.jobs.get(key).map(|job| &job.config)
    }

    pub fn state(&self, key: &JobKey) -> Option<&TriggerState> {
        self.jobs.get(key).map(|job| &job.state)
    }

    /// Replace the owned set with `owned`.
    ///
    /// `present` holds every key that still has a document in the config
    /// index. Jobs that disappear from `owned` but are still present moved to
    /// another node; their trigger state is kept for the new owner. Jobs
    /// whose document is gone also lose their trigger state. `live` is the
    /// current membership, used to tell whether a persisted run is still in
    /// progress on its recorded node.
    pub async fn apply(
        &mut self,
        owned: Vec<JobConfig>,
        present: &HashSet<JobKey>,
        live: &HashSet<NodeId>,
        now: DateTime<Utc>,
    ) -> UpdateSummary {
        let mut summary = UpdateSummary::default();
        let owned_keys: HashSet<JobKey> = owned.iter().map(|c| c.key().clone()).collect();

        let removed: Vec<JobKey> = self
            .jobs
            .keys()
            .filter(|key| !owned_keys.contains(*key))
            .cloned()
            .collect();
        for key in removed {
            let Some(mut job) = self.jobs.remove(&key) else {
                continue;
            };
            summary.deleted += 1;
            if !present.contains(&key) {
                tracing::debug!(job = %key, "job deleted");
                if let Err(e) =
                    delete_trigger_state(self.store.as_ref(), &self.state_index, &key).await
                {
                    tracing::warn!(job = %key, error = %e, "failed to delete trigger state");
                }
            } else if job.handover.is_some() {
                tracing::debug!(job = %key, "job moved on before its handover finished");
            } else if job.running > 0 && job.state.is_in_flight() {
                tracing::debug!(job = %key, running = job.running, "job moved while running");
                self.persist(&key, &job.state).await;
                job.dirty = false;
                self.departed.insert(key, job);
            } else {
                tracing::debug!(job = %key, "job no longer owned by this node");
                job.state.completed();
                self.persist(&key, &job.state).await;
            }
        }

        self.departed.retain(|key, _| present.contains(key));

        for config in owned {
            let key = config.key().clone();
            if let Some(job) = self.jobs.get_mut(&key) {
                if !job.config.is_superseded_by(&config) {
                    continue;
                }
                summary.updated += 1;
                Self::reconfigure(job, config, &self.node, now);
                continue;
            }

            if let Some(mut job) = self.departed.remove(&key) {
                tracing::debug!(job = %key, running = job.running, "job returned while still running");
                summary.new += 1;
                job.state.node = Some(self.node.clone());
                job.dirty = true;
                if job.config.is_superseded_by(&config) {
                    Self::reconfigure(&mut job, config, &self.node, now);
                }
                self.jobs.insert(key, job);
                continue;
            }

            let Some((state, handover)) = self.initial_state(&config, live, now).await else {
                continue;
            };
            summary.new += 1;
            self.jobs.insert(
                key,
                ScheduledJob {
                    config,
                    state,
                    running: 0,
                    dirty: handover.is_none(),
                    handover,
                },
            );
        }

        summary
    }

    /// Swap in a newer config. The trigger restarts when the schedule changed
    /// or the previous one ended in error; a run still in flight keeps its
    /// status so it is not fired a second time.
    fn reconfigure(job: &mut ScheduledJob, config: JobConfig, node: &NodeId, now: DateTime<Utc>) {
        let key = config.key().clone();
        let schedule_changed = job.config.schedule() != config.schedule();
        if schedule_changed || job.state.status == TriggerStatus::Error {
            match TriggerState::new(config.schedule(), now) {
                Ok(mut state) => {
                    state.node = Some(node.clone());
                    if (job.running > 0 || job.handover.is_some()) && job.state.is_in_flight() {
                        state.status = job.state.status;
                    }
                    job.state = state;
                    job.dirty = true;
                    if schedule_changed {
                        tracing::debug!(job = %key, "schedule changed, trigger reset");
                    } else {
                        tracing::info!(job = %key, "config updated, trigger recovered from error");
                    }
                }
                Err(e) => {
                    tracing::warn!(job = %key, error = %e, "failed to reschedule job");
                }
            }
        }
        job.config = config;
    }

    async fn initial_state(
        &self,
        config: &JobConfig,
        live: &HashSet<NodeId>,
        now: DateTime<Utc>,
    ) -> Option<(TriggerState, Option<NodeId>)> {
        let key = config.key();
        match load_trigger_state(self.store.as_ref(), &self.state_index, key).await {
            Ok(Some(state)) if state.running_elsewhere(&self.node, live) => {
                let owner = state.node.clone();
                tracing::info!(
                    job = %key,
                    owner = ?owner,
                    "job still running on its previous owner, waiting for handover"
                );
                return Some((state, owner));
            }
            Ok(Some(state)) => {
                tracing::debug!(
                    job = %key,
                    start_time = %state.start_time,
                    "resuming persisted trigger state"
                );
                return Some((state.resume(&self.node), None));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(job = %key, error = %e, "failed to load trigger state, starting fresh");
            }
        }

        match TriggerState::new(config.schedule(), now) {
            Ok(mut state) => {
                state.node = Some(self.node.clone());
                Some((state, None))
            }
            Err(e) => {
                tracing::warn!(job = %key, error = %e, "failed to schedule job");
                None
            }
        }
    }

    pub fn has_handovers(&self) -> bool {
        self.jobs.values().any(|job| job.handover.is_some())
    }

    /// Take over jobs whose previous owner finished its run or left the
    /// cluster.
    pub async fn check_handovers(&mut self, live: &HashSet<NodeId>) {
        let pending: Vec<(JobKey, NodeId)> = self
            .jobs
            .iter()
            .filter_map(|(key, job)| job.handover.clone().map(|owner| (key.clone(), owner)))
            .collect();

        for (key, owner) in pending {
            let loaded = if live.contains(&owner) {
                match load_trigger_state(self.store.as_ref(), &self.state_index, &key).await {
                    Ok(Some(state)) if state.running_elsewhere(&self.node, live) => continue,
                    Ok(loaded) => loaded,
                    Err(e) => {
                        tracing::warn!(job = %key, error = %e, "failed to load trigger state");
                        continue;
                    }
                }
            } else {
                tracing::info!(job = %key, owner = %owner, "previous owner left, resuming job");
                None
            };

            let Some(job) = self.jobs.get_mut(&key) else {
                continue;
            };
            let state = match loaded {
                Some(loaded) if loaded.start_time == job.state.start_time => loaded,
                _ => job.state.clone(),
            };
            job.state = state.resume(&self.node);
            job.handover = None;
            job.dirty = true;
            tracing::debug!(job = %key, owner = %owner, "handover finished");
        }
    }

    /// Fire up to `capacity` due triggers.
    ///
    /// Triggers beyond capacity stay due and are picked up on a later call.
    /// A job that disallows concurrent execution is skipped while a run is
    /// in progress, here or on its previous owner.
    pub fn acquire_due(
        &mut self,
        now: DateTime<Utc>,
        capacity: usize,
        misfire_threshold: Duration,
        policy: MisfirePolicy,
    ) -> Acquired {
        let mut acquired = Acquired::default();

        for job in self.jobs.values_mut() {
            if job.state.status != TriggerStatus::Waiting || job.is_blocked() {
                continue;
            }
            let missed = job.state.next_fire_time;
            match job.state.check_misfire(job.config.schedule(), now, misfire_threshold, policy) {
                Misfire::None => {}
                outcome => {
                    job.dirty = true;
                    if let Some(missed_fire_time) = missed {
                        acquired.misfires.push(MisfireNotice {
                            key: job.config.key().clone(),
                            missed_fire_time,
                            fire_now: outcome == Misfire::FireNow,
                        });
                    }
                }
            }
        }

        let mut due: Vec<(DateTime<Utc>, JobKey)> = self
            .jobs
            .iter()
            .filter(|(_, job)| !job.is_blocked() && job.state.is_due(now))
            .filter_map(|(key, job)| job.state.next_fire_time.map(|t| (t, key.clone())))
            .collect();
        due.sort();

        for (_, key) in due.into_iter().take(capacity) {
            let Some(job) = self.jobs.get_mut(&key) else {
                continue;
            };
            let Some(scheduled_fire_time) = job.state.triggered(job.config.schedule()) else {
                continue;
            };
            if job.config.is_concurrent_execution_disallowed() {
                job.state.executing();
            } else {
                job.state.completed();
            }
            job.running += 1;
            job.dirty = true;

            acquired.fired.push(FiredTrigger {
                key: key.clone(),
                job_type: job.config.job_type().to_string(),
                run_id: RunId::new(),
                scheduled_fire_time,
                fire_time: now,
                data: job.config.data().clone(),
                node: self.node.clone(),
            });
        }

        acquired
    }

    /// Fire a job outside its schedule. The trigger's next fire time is left
    /// untouched.
    pub fn fire_now(&mut self, key: &JobKey, now: DateTime<Utc>) -> Result<FiredTrigger, SchedulerError> {
        let job = self
            .jobs
            .get_mut(key)
            .ok_or_else(|| SchedulerError::JobNotFound(key.to_string()))?;

        if job.is_blocked() {
            return Err(SchedulerError::AlreadyRunning(key.to_string()));
        }
        if job.config.is_concurrent_execution_disallowed()
            && job.state.status == TriggerStatus::Waiting
        {
            job.state.status = TriggerStatus::Executing;
            job.dirty = true;
        }
        job.running += 1;

        Ok(FiredTrigger {
            key: key.clone(),
            job_type: job.config.job_type().to_string(),
            run_id: RunId::new(),
            scheduled_fire_time: now,
            fire_time: now,
            data: job.config.data().clone(),
            node: self.node.clone(),
        })
    }

    /// Record that a run finished. Keys deleted while running are ignored.
    pub fn completed(&mut self, key: &JobKey) {
        let Some(job) = self
            .jobs
            .get_mut(key)
            .or_else(|| self.departed.get_mut(key))
        else {
            return;
        };
        job.running = job.running.saturating_sub(1);
        if job.running == 0 {
            job.state.completed();
            job.dirty = true;
        }
    }

    #[cfg(test)]
    pub fn running(&self, key: &JobKey) -> usize {
        self.jobs.get(key).map_or(0, |job| job.running)
    }

    /// Persist every changed trigger state. Failed writes stay dirty and are
    /// retried on the next flush. Jobs waiting on a handover are not written;
    /// the previous owner still holds their state.
    pub async fn flush(&mut self) {
        for (key, job) in self
            .jobs
            .iter_mut()
            .filter(|(_, job)| job.dirty && job.handover.is_none())
        {
            match save_trigger_state(self.store.as_ref(), &self.state_index, key, &job.state).await
            {
                Ok(()) => job.dirty = false,
                Err(e) => {
                    tracing::warn!(job = %key, error = %e, "failed to persist trigger state");
                }
            }
        }

        let finished: Vec<JobKey> = self
            .departed
            .iter()
            .filter(|(_, job)| job.running == 0)
            .map(|(key, _)| key.clone())
            .collect();
        for key in finished {
            let Some(job) = self.departed.get(&key) else {
                continue;
            };
            let result =
                save_trigger_state(self.store.as_ref(), &self.state_index, &key, &job.state).await;
            match result {
                Ok(()) => {
                    tracing::debug!(job = %key, "run of moved job finished, state released");
                    self.departed.remove(&key);
                }
                Err(e) => {
                    tracing::warn!(job = %key, error = %e, "failed to persist trigger state");
                }
            }
        }
    }

    async fn persist(&self, key: &JobKey, state: &TriggerState) {
        if let Err(e) = save_trigger_state(self.store.as_ref(), &self.state_index, key, state).await
        {
            tracing::warn!(job = %key, error = %e, "failed to persist trigger state");
        }
    }
}
