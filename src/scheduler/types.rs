//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the scheduler.

use std::fmt;

use crate::core::executable::JobError;
use crate::core::trigger::TriggerState;
use crate::core::types::{JobKey, RunId};
use crate::storage::StorageError;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// Invalid scheduler configuration.
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// The job could not be created.
    #[error("job error: {0}")]
    Job(#[from] JobError),

    /// The job disallows concurrent execution and is already running.
    #[error("job is already running: {0}")]
    AlreadyRunning(String),

    /// Every execution slot is busy.
    #[error("no free execution slot for job: {0}")]
    NoCapacity(String),

    /// The scheduler is shutting down.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Scheduler is paused.
    Paused,
}

/// What a config reload changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub new: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl UpdateSummary {
    pub fn is_empty(&self) -> bool {
        self.new == 0 && self.updated == 0 && self.deleted == 0
    }
}

impl fmt::Display for UpdateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "no changes")
        } else {
            write!(
                f,
                "new: {}; upd: {}; del: {}",
                self.new, self.updated, self.deleted
            )
        }
    }
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Trigger a job manually.
    Trigger {
        key: JobKey,
        response: oneshot::Sender<Result<RunId, SchedulerError>>,
    },
    /// Reload the config index.
    UpdateJobs {
        response: oneshot::Sender<Result<UpdateSummary, SchedulerError>>,
    },
    /// List the jobs this node currently schedules.
    OwnedJobs {
        response: oneshot::Sender<Result<Vec<JobKey>, SchedulerError>>,
    },
    /// Read the trigger state of an owned job.
    JobState {
        key: JobKey,
        response: oneshot::Sender<Result<Option<TriggerState>, SchedulerError>>,
    },
    /// Pause the scheduler.
    Pause { response: oneshot::Sender<()> },
    /// Resume the scheduler.
    Resume { response: oneshot::Sender<()> },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
