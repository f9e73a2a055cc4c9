//! Bounded job execution.
//!
//! The `ExecutionPool` runs fired jobs with:
//! - A hard limit of `max_threads` concurrent executions
//! - Panic and error isolation per firing
//! - Completion reports sent back to the scheduler loop

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};

use crate::core::executable::{FiredTrigger, Job, JobError, JobExecutionContext};
use crate::core::types::{JobKey, RunId};

/// Result of one job execution.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub key: JobKey,
    pub run_id: RunId,
    /// Whether the job succeeded.
    pub success: bool,
    pub duration: Duration,
    /// Error if the job failed or panicked.
    pub error: Option<String>,
}

impl JobResult {
    /// Create a successful result.
    pub fn success(key: JobKey, run_id: RunId, duration: Duration) -> Self {
        Self {
            key,
            run_id,
            success: true,
            duration,
            error: None,
        }
    }

    /// Create a failed result.
    pub fn failure(key: JobKey, run_id: RunId, duration: Duration, error: String) -> Self {
        Self {
            key,
            run_id,
            success: false,
            duration,
            error: Some(error),
        }
    }
}

/// Worker pool bounded by a semaphore.
///
/// Callers check [`available_permits`](Self::available_permits) before
/// handing work over; [`try_execute`](Self::try_execute) never queues.
pub struct ExecutionPool {
    max_threads: usize,
    semaphore: Arc<Semaphore>,
    completions: mpsc::UnboundedSender<JobResult>,
}

impl ExecutionPool {
    /// Create a pool reporting completions on `completions`.
    pub fn new(max_threads: usize, completions: mpsc::UnboundedSender<JobResult>) -> Self {
        Self {
            max_threads,
            semaphore: Arc::new(Semaphore::new(max_threads)),
            completions,
        }
    }

    /// Get the maximum concurrency limit.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Get the number of free execution slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Number of executions in flight.
    pub fn running(&self) -> usize {
        self.max_threads.saturating_sub(self.available_permits())
    }

    /// Start a job if a slot is free. Returns the trigger back when the pool
    /// is saturated.
    pub fn try_execute(&self, trigger: FiredTrigger, job: Arc<dyn Job>) -> Result<(), FiredTrigger> {
        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(trigger),
        };
        let completions = self.completions.clone();

        tokio::spawn(async move {
            let ctx = JobExecutionContext::from_trigger(&trigger);
            let start = Instant::now();

            // Run on a separate task so a panic surfaces as a JoinError
            // instead of tearing down the pool.
            let outcome = tokio::spawn(async move { job.execute(&ctx).await })
                .await
                .unwrap_or_else(|e| Err(JobError::Panicked(e.to_string())));

            let result = match outcome {
                Ok(()) => JobResult::success(trigger.key, trigger.run_id, start.elapsed()),
                Err(e) => {
                    if matches!(e, JobError::Panicked(_)) {
                        tracing::error!(job = %trigger.key, run = %trigger.run_id, error = %e, "job panicked");
                    } else {
                        tracing::warn!(job = %trigger.key, run = %trigger.run_id, error = %e, "job failed");
                    }
                    JobResult::failure(trigger.key, trigger.run_id, start.elapsed(), e.to_string())
                }
            };

            drop(permit);
            let _ = completions.send(result);
        });

        Ok(())
    }

    /// Wait until no execution is in flight, polling every 100ms.
    ///
    /// Returns `false` if executions were still running at the timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.running() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
