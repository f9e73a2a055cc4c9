//! Job execution engine.
//!
//! This module provides the bounded worker pool that runs fired jobs.

mod executor;

pub use executor::{ExecutionPool, JobResult};
