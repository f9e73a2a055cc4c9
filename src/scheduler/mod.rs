//! Scheduler engine.
//!
//! This module provides the main scheduling loop that loads job configs,
//! keeps the jobs this node owns and fires them into the execution pool.

mod builder;
mod engine;
mod handle;
mod jobs;
mod types;

pub use builder::{DEFAULT_JOB_TYPE, STATE_INDEX_SUFFIX, SchedulerBuilder};
pub use engine::Scheduler;
pub use handle::SchedulerHandle;
pub use types::{SchedulerError, SchedulerState, UpdateSummary};
