//! Executable jobs.
//!
//! A [`JobConfig`](super::job::JobConfig) only names a job type. At fire time
//! the scheduler asks its [`JobFactory`] for an executable [`Job`] of that
//! type and runs it with a [`JobExecutionContext`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::types::{JobKey, NodeId, RunId};

/// Errors that can occur during job execution.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job execution failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// No executable is registered for the job type.
    #[error("no job registered for type '{0}'")]
    UnknownType(String),

    /// The job panicked.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// A due trigger handed from the scheduler loop to the execution pool.
#[derive(Debug, Clone)]
pub struct FiredTrigger {
    pub key: JobKey,
    pub job_type: String,
    pub run_id: RunId,
    /// The fire time the trigger was scheduled for.
    pub scheduled_fire_time: DateTime<Utc>,
    /// When the trigger was actually fired.
    pub fire_time: DateTime<Utc>,
    pub data: HashMap<String, Value>,
    pub node: NodeId,
}

/// What a job sees while it runs.
#[derive(Debug, Clone)]
pub struct JobExecutionContext {
    pub key: JobKey,
    pub run_id: RunId,
    pub scheduled_fire_time: DateTime<Utc>,
    pub fire_time: DateTime<Utc>,
    /// The job's data map.
    pub data: HashMap<String, Value>,
    /// Node the job runs on.
    pub node: NodeId,
}

impl JobExecutionContext {
    /// Build the context for a fired trigger.
    pub fn from_trigger(trigger: &FiredTrigger) -> Self {
        Self {
            key: trigger.key.clone(),
            run_id: trigger.run_id.clone(),
            scheduled_fire_time: trigger.scheduled_fire_time,
            fire_time: trigger.fire_time,
            data: trigger.data.clone(),
            node: trigger.node.clone(),
        }
    }

    /// Read a data value as `u64`.
    pub fn data_u64(&self, name: &str) -> Option<u64> {
        self.data.get(name).and_then(Value::as_u64)
    }

    /// Read a data value as a string.
    pub fn data_str(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }
}

/// The unit of work run when a trigger fires.
///
/// # Example
///
/// ```ignore
/// use clustercron::{Job, JobError, JobExecutionContext};
/// use async_trait::async_trait;
///
/// struct Cleanup;
///
/// #[async_trait]
/// impl Job for Cleanup {
///     async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobError> {
///         tracing::info!(job = %ctx.key, "cleaning up");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync {
    /// Run the job once.
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobError>;
}

/// Creates executable jobs for fired triggers.
pub trait JobFactory: Send + Sync {
    /// Create the job to run for this trigger.
    fn new_job(&self, trigger: &FiredTrigger) -> Result<Arc<dyn Job>, JobError>;

    /// Whether this factory can create jobs of the given type.
    fn supports(&self, job_type: &str) -> bool;
}

type JobConstructor = Arc<dyn Fn() -> Arc<dyn Job> + Send + Sync>;

/// Default [`JobFactory`]: a table from job type names to constructors.
#[derive(Default, Clone)]
pub struct JobRegistry {
    constructors: HashMap<String, JobConstructor>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for a job type.
    pub fn register<F>(mut self, job_type: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> Arc<dyn Job> + Send + Sync + 'static,
    {
        self.constructors
            .insert(job_type.into(), Arc::new(constructor));
        self
    }

    /// Register a single shared instance for a job type.
    pub fn register_instance(self, job_type: impl Into<String>, job: Arc<dyn Job>) -> Self {
        self.register(job_type, move || job.clone())
    }

    /// Registered job type names.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl JobFactory for JobRegistry {
    fn new_job(&self, trigger: &FiredTrigger) -> Result<Arc<dyn Job>, JobError> {
        self.constructors
            .get(&trigger.job_type)
            .map(|constructor| constructor())
            .ok_or_else(|| JobError::UnknownType(trigger.job_type.clone()))
    }

    fn supports(&self, job_type: &str) -> bool {
        self.constructors.contains_key(job_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        async fn execute(&self, _ctx: &JobExecutionContext) -> Result<(), JobError> {
            Ok(())
        }
    }

    struct Tally(AtomicU32);

    #[async_trait]
    impl Job for Tally {
        async fn execute(&self, _ctx: &JobExecutionContext) -> Result<(), JobError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn trigger(job_type: &str) -> FiredTrigger {
        let now = Utc::now();
        FiredTrigger {
            key: JobKey::new("jobs", "x"),
            job_type: job_type.to_string(),
            run_id: RunId::new(),
            scheduled_fire_time: now,
            fire_time: now,
            data: HashMap::from([("sleep_ms".to_string(), json!(5))]),
            node: NodeId::new("n1"),
        }
    }

    #[tokio::test]
    async fn test_registry_creates_registered_type() {
        let registry = JobRegistry::new().register("noop", || Arc::new(Noop) as Arc<dyn Job>);

        assert!(registry.supports("noop"));
        assert!(!registry.supports("other"));

        let job = registry.new_job(&trigger("noop")).unwrap();
        let ctx = JobExecutionContext::from_trigger(&trigger("noop"));
        assert!(job.execute(&ctx).await.is_ok());
    }

    #[test]
    fn test_registry_unknown_type() {
        let registry = JobRegistry::new();
        let result = registry.new_job(&trigger("missing"));
        assert!(matches!(result, Err(JobError::UnknownType(t)) if t == "missing"));
    }

    #[tokio::test]
    async fn test_register_instance_shares_state() {
        let tally = Arc::new(Tally(AtomicU32::new(0)));
        let registry = JobRegistry::new().register_instance("tally", tally.clone());

        for _ in 0..3 {
            let job = registry.new_job(&trigger("tally")).unwrap();
            let ctx = JobExecutionContext::from_trigger(&trigger("tally"));
            job.execute(&ctx).await.unwrap();
        }
        assert_eq!(tally.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_context_data_accessors() {
        let ctx = JobExecutionContext::from_trigger(&trigger("noop"));
        assert_eq!(ctx.data_u64("sleep_ms"), Some(5));
        assert_eq!(ctx.data_str("sleep_ms"), None);
        assert_eq!(ctx.node.as_str(), "n1");
    }

    #[test]
    fn test_job_types_are_sorted() {
        let registry = JobRegistry::new()
            .register("b", || Arc::new(Noop) as Arc<dyn Job>)
            .register("a", || Arc::new(Noop) as Arc<dyn Job>);
        assert_eq!(registry.job_types(), vec!["a", "b"]);
    }
}
