//! Core domain types: identifiers, job configs, schedules and triggers.

pub mod executable;
pub mod job;
pub mod schedule;
pub mod trigger;
pub mod types;
