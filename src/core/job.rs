//! Job configuration model and document parsing.
//!
//! A [`JobConfig`] is the parsed form of one document in the config index.
//! Documents are turned into configs by a [`JobConfigFactory`]; the default
//! factory understands documents of the form
//!
//! ```json
//! {
//!   "hash": 1,
//!   "name": "nightly",
//!   "delay": 500,
//!   "trigger": { "schedule": { "interval": "100ms" } }
//! }
//! ```
//!
//! or with `"cron": "0 0 3 * * ?"` (a string or an array of strings) in place
//! of `interval`. Every top-level field except `trigger` becomes part of the
//! job's data map.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use super::schedule::{Schedule, ScheduleError, parse_duration};
use super::types::JobKey;

/// Version of a config whose origin did not report one.
pub const UNKNOWN_VERSION: i64 = -1;

/// Errors that can occur when building a job config from a document.
#[derive(Debug, Error)]
pub enum JobConfigError {
    /// The document is not a JSON object.
    #[error("document {0} is not an object")]
    NotAnObject(String),

    /// The document has no trigger specification.
    #[error("document {0} has no trigger.schedule")]
    MissingTrigger(String),

    /// The trigger specification is malformed.
    #[error("invalid trigger in {key}: {reason}")]
    InvalidTrigger { key: String, reason: String },

    /// A field has the wrong type.
    #[error("invalid field '{field}' in {key}: {reason}")]
    InvalidField {
        key: String,
        field: String,
        reason: String,
    },

    /// The schedule could not be parsed.
    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    /// No executable is registered for the job type.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),
}

/// Parsed configuration of one scheduled job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    key: JobKey,
    job_type: String,
    description: Option<String>,
    schedule: Schedule,
    data: HashMap<String, Value>,
    version: i64,
    hash: Option<u64>,
    concurrent_execution_disallowed: bool,
    enabled: bool,
}

impl JobConfig {
    /// Create a job config with the given identity, job type and schedule.
    pub fn new(key: JobKey, job_type: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            key,
            job_type: job_type.into(),
            description: None,
            schedule,
            data: HashMap::new(),
            version: UNKNOWN_VERSION,
            hash: None,
            concurrent_execution_disallowed: false,
            enabled: true,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Replace the schedule.
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Replace the data map.
    pub fn with_data(mut self, data: HashMap<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Add a single data value.
    pub fn with_data_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Set the document version.
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Force the ownership hash.
    pub fn with_hash(mut self, hash: u64) -> Self {
        self.hash = Some(hash);
        self
    }

    /// Allow at most one in-flight execution of this job.
    pub fn with_concurrent_execution_disallowed(mut self, disallowed: bool) -> Self {
        self.concurrent_execution_disallowed = disallowed;
        self
    }

    /// Set whether the job is enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// The explicit ownership hash, if one was set.
    pub fn hash_override(&self) -> Option<u64> {
        self.hash
    }

    /// The hash used to pick the owning node.
    pub fn effective_hash(&self) -> u64 {
        self.hash.unwrap_or_else(|| identity_hash(&self.key))
    }

    pub fn is_concurrent_execution_disallowed(&self) -> bool {
        self.concurrent_execution_disallowed
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `newer` should replace this config.
    ///
    /// Any version change wins, since a store restarts the version of a
    /// deleted and re-created document. When either side has an unknown
    /// version the definitions are compared instead.
    pub fn is_superseded_by(&self, newer: &JobConfig) -> bool {
        if self.version == UNKNOWN_VERSION || newer.version == UNKNOWN_VERSION {
            return self != newer;
        }
        newer.version != self.version
    }
}

/// Stable identity hash of a job: the first 8 bytes of SHA-256 over
/// `group.name`, big-endian. Every node computes the same value.
pub fn identity_hash(key: &JobKey) -> u64 {
    let digest = Sha256::digest(key.to_string().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Turns config index documents into [`JobConfig`]s.
///
/// Implementations must be stateless so the same factory can be shared by
/// every reload. Override [`ownership_hash`](Self::ownership_hash) to pin jobs
/// to specific nodes.
pub trait JobConfigFactory: Send + Sync {
    /// Build a bare config from the document: identity, job type, data map.
    /// The schedule is filled in by [`create_from_document`](Self::create_from_document).
    fn create_object(&self, key: JobKey, document: &Map<String, Value>)
    -> Result<JobConfig, JobConfigError>;

    /// The explicit ownership hash for a document, if any.
    ///
    /// The default reads the `hash` field, which may be an integer or a
    /// string. Non-numeric strings are hashed.
    fn ownership_hash(
        &self,
        key: &JobKey,
        document: &Map<String, Value>,
    ) -> Result<Option<u64>, JobConfigError> {
        match document.get("hash") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => match (n.as_u64(), n.as_i64()) {
                (Some(v), _) => Ok(Some(v)),
                (None, Some(v)) => Ok(Some(v as u64)),
                _ => Err(invalid_field(key, "hash", "expected an integer")),
            },
            Some(Value::String(s)) => match s.trim().parse::<i64>() {
                Ok(v) => Ok(Some(v as u64)),
                Err(_) => Ok(Some(identity_hash(&JobKey::new(key.group(), s.as_str())))),
            },
            Some(_) => Err(invalid_field(key, "hash", "expected an integer or string")),
        }
    }

    /// Build a complete config from a stored document.
    fn create_from_document(
        &self,
        key: JobKey,
        document: &Value,
        version: i64,
    ) -> Result<JobConfig, JobConfigError> {
        let object = document
            .as_object()
            .ok_or_else(|| JobConfigError::NotAnObject(key.to_string()))?;

        let schedule = parse_trigger(&key, object)?;
        let hash = self.ownership_hash(&key, object)?;
        let mut config = self
            .create_object(key, object)?
            .with_schedule(schedule)
            .with_version(version);
        if let Some(hash) = hash {
            config = config.with_hash(hash);
        }
        Ok(config)
    }
}

/// Factory for plain documents: every job gets the same job type unless the
/// document names its own in `type`.
#[derive(Debug, Clone)]
pub struct DefaultJobConfigFactory {
    job_type: String,
    concurrent_execution_disallowed: bool,
}

impl DefaultJobConfigFactory {
    /// Create a factory producing jobs of `job_type`.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            concurrent_execution_disallowed: false,
        }
    }

    /// Mark every produced job as disallowing concurrent execution.
    pub fn with_concurrent_execution_disallowed(mut self) -> Self {
        self.concurrent_execution_disallowed = true;
        self
    }
}

impl JobConfigFactory for DefaultJobConfigFactory {
    fn create_object(
        &self,
        key: JobKey,
        document: &Map<String, Value>,
    ) -> Result<JobConfig, JobConfigError> {
        let job_type = match document.get("type") {
            None | Some(Value::Null) => self.job_type.clone(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(invalid_field(&key, "type", "expected a string")),
        };
        let enabled = match document.get("active") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(invalid_field(&key, "active", "expected a boolean")),
        };
        let description = document
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);

        let data: HashMap<String, Value> = document
            .iter()
            .filter(|(k, _)| k.as_str() != "trigger")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        // Placeholder schedule; replaced once the trigger is parsed.
        let placeholder = Schedule::interval(Duration::from_secs(1))?;
        let mut config = JobConfig::new(key, job_type, placeholder)
            .with_data(data)
            .with_enabled(enabled)
            .with_concurrent_execution_disallowed(self.concurrent_execution_disallowed);
        if let Some(description) = description {
            config = config.with_description(description);
        }
        Ok(config)
    }
}

fn parse_trigger(key: &JobKey, document: &Map<String, Value>) -> Result<Schedule, JobConfigError> {
    let schedule = document
        .get("trigger")
        .and_then(|t| t.get("schedule"))
        .and_then(Value::as_object)
        .ok_or_else(|| JobConfigError::MissingTrigger(key.to_string()))?;

    let interval = schedule.get("interval").filter(|v| !v.is_null());
    let cron = schedule.get("cron").filter(|v| !v.is_null());

    let mut parsed = match (interval, cron) {
        (Some(_), Some(_)) => {
            return Err(invalid_trigger(key, "both interval and cron are set"));
        }
        (None, None) => return Err(JobConfigError::MissingTrigger(key.to_string())),
        (Some(Value::String(s)), None) => Schedule::parse_interval(s)?,
        (Some(Value::Number(n)), None) => {
            let ms = n
                .as_u64()
                .ok_or_else(|| invalid_trigger(key, "interval must be positive"))?;
            Schedule::interval(Duration::from_millis(ms))?
        }
        (Some(_), None) => return Err(invalid_trigger(key, "interval must be a string")),
        (None, Some(Value::String(s))) => Schedule::cron([s.as_str()])?,
        (None, Some(Value::Array(items))) => {
            let expressions = items
                .iter()
                .map(|v| {
                    v.as_str()
                        .ok_or_else(|| invalid_trigger(key, "cron entries must be strings"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Schedule::cron(expressions)?
        }
        (None, Some(_)) => {
            return Err(invalid_trigger(key, "cron must be a string or an array"));
        }
    };

    match schedule.get("timezone") {
        None | Some(Value::Null) => {}
        Some(Value::String(tz)) => parsed = parsed.with_timezone(tz)?,
        Some(_) => return Err(invalid_trigger(key, "timezone must be a string")),
    }

    match document.get("delay") {
        None | Some(Value::Null) => {}
        Some(Value::Number(n)) => {
            let ms = n
                .as_u64()
                .ok_or_else(|| invalid_field(key, "delay", "expected a non-negative integer"))?;
            parsed = parsed.with_delay(Duration::from_millis(ms));
        }
        Some(Value::String(s)) => parsed = parsed.with_delay(parse_duration(s)?),
        Some(_) => return Err(invalid_field(key, "delay", "expected milliseconds")),
    }

    Ok(parsed)
}

fn invalid_trigger(key: &JobKey, reason: &str) -> JobConfigError {
    JobConfigError::InvalidTrigger {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn invalid_field(key: &JobKey, field: &str, reason: &str) -> JobConfigError {
    JobConfigError::InvalidField {
        key: key.to_string(),
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
