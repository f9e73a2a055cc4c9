pub mod cluster;
pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use cluster::{
    ConfigUpdateBus, ConfigUpdateResponse, JobDistributor, LocalMembership, MembershipProvider,
    NodeComparator, NodeDescriptor, NodeFilter, NodeFilterError, NodeIdComparator,
    NodeNameComparator, SchedulerConfigUpdateAction, StaticMembership,
};
pub use config::{ConfigError, IndexJobConfigSource, NodeSettings, load_documents_from_directory};
pub use core::executable::{FiredTrigger, Job, JobError, JobExecutionContext, JobFactory, JobRegistry};
pub use core::job::{DefaultJobConfigFactory, JobConfig, JobConfigError, JobConfigFactory};
pub use core::schedule::{MisfirePolicy, Schedule, ScheduleError};
pub use core::trigger::{TriggerState, TriggerStatus};
pub use core::types::{JobKey, NodeId, RunId};
pub use events::{Event, EventBus, EventHandler};
pub use execution::{ExecutionPool, JobResult};
pub use scheduler::{
    Scheduler, SchedulerBuilder, SchedulerError, SchedulerHandle, SchedulerState, UpdateSummary,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
pub use storage::{DocumentStore, InMemoryStore, StorageError, StoredDocument};
