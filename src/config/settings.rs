//! Node settings file.
//!
//! One YAML file per node describes the scheduler instance it runs:
//!
//! ```yaml
//! scheduler_name: jobs
//! node_filter: "role:scheduler"
//! max_threads: 3
//! misfire_policy: fire_once_now
//! node:
//!   id: node-1
//!   attributes:
//!     role: scheduler
//! storage:
//!   type: sqlite
//!   path: /var/lib/ccron/store.db
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::error::ConfigError;
use crate::cluster::{
    NodeComparator, NodeDescriptor, NodeFilter, NodeIdComparator, NodeNameComparator,
    StaticMembership,
};
use crate::core::schedule::MisfirePolicy;
use crate::scheduler::SchedulerBuilder;
use crate::storage::{DocumentStore, InMemoryStore};

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

impl StorageConfig {
    /// Open the configured store.
    pub async fn open(&self) -> Result<Arc<dyn DocumentStore>, ConfigError> {
        match self {
            StorageConfig::Memory => Ok(Arc::new(InMemoryStore::new())),
            #[cfg(feature = "sqlite")]
            StorageConfig::Sqlite { path } => {
                let store = crate::storage::SqliteStore::new(path).await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "sqlite"))]
            StorageConfig::Sqlite { .. } => Err(ConfigError::InvalidConfig(
                "sqlite storage requires the 'sqlite' feature".into(),
            )),
        }
    }
}

/// How nodes are ordered before ownership is assigned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparatorKind {
    #[default]
    Id,
    Name,
}

/// Identity of the local node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalNodeSettings {
    pub id: String,
    /// Defaults to the id.
    pub name: Option<String>,
    pub attributes: HashMap<String, String>,
}

impl Default for LocalNodeSettings {
    fn default() -> Self {
        Self {
            id: "local".to_string(),
            name: None,
            attributes: HashMap::new(),
        }
    }
}

impl ComparatorKind {
    pub fn comparator(self) -> Arc<dyn NodeComparator> {
        match self {
            ComparatorKind::Id => Arc::new(NodeIdComparator),
            ComparatorKind::Name => Arc::new(NodeNameComparator),
        }
    }
}

impl LocalNodeSettings {
    pub fn descriptor(&self) -> NodeDescriptor {
        let mut node = NodeDescriptor::new(self.id.clone());
        if let Some(name) = &self.name {
            node = node.with_name(name.clone());
        }
        node.attributes = self.attributes.clone();
        node
    }
}

/// Settings of one scheduler node (ccron.yaml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Scheduler name; also the default config index.
    pub scheduler_name: String,
    pub config_index: Option<String>,
    pub state_index: Option<String>,
    /// Node filter expression; absent means every node.
    pub node_filter: Option<String>,
    pub max_threads: usize,
    pub misfire_threshold_ms: u64,
    pub misfire_policy: MisfirePolicy,
    pub poll_interval_ms: u64,
    pub config_poll_interval_ms: Option<u64>,
    pub shutdown_timeout_secs: u64,
    pub comparator: ComparatorKind,
    pub node: LocalNodeSettings,
    /// Other cluster members known statically.
    pub peers: Vec<NodeDescriptor>,
    pub storage: StorageConfig,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            scheduler_name: "jobs".to_string(),
            config_index: None,
            state_index: None,
            node_filter: None,
            max_threads: 3,
            misfire_threshold_ms: 10_000,
            misfire_policy: MisfirePolicy::default(),
            poll_interval_ms: 100,
            config_poll_interval_ms: None,
            shutdown_timeout_secs: 30,
            comparator: ComparatorKind::default(),
            node: LocalNodeSettings::default(),
            peers: Vec::new(),
            storage: StorageConfig::default(),
        }
    }
}

impl NodeSettings {
    /// Parse settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let settings: NodeSettings = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::file_read(path, e))?;
        let settings: NodeSettings =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source: e,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check value ranges and parse the node filter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler_name.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "scheduler_name cannot be empty".into(),
            ));
        }
        if self.max_threads == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_threads must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "poll_interval_ms must be at least 1".into(),
            ));
        }
        if self.node.id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("node.id cannot be empty".into()));
        }
        self.parsed_node_filter()?;
        Ok(())
    }

    /// The parsed node filter, if one is configured.
    pub fn parsed_node_filter(&self) -> Result<Option<NodeFilter>, ConfigError> {
        self.node_filter
            .as_deref()
            .map(NodeFilter::parse)
            .transpose()
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }

    /// The local node plus the static peers.
    pub fn roster(&self) -> Vec<NodeDescriptor> {
        let local = self.node.descriptor();
        let mut nodes = vec![local.clone()];
        nodes.extend(self.peers.iter().filter(|p| p.id != local.id).cloned());
        nodes
    }

    pub fn misfire_threshold(&self) -> Duration {
        Duration::from_millis(self.misfire_threshold_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn config_poll_interval(&self) -> Option<Duration> {
        self.config_poll_interval_ms.map(Duration::from_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Apply these settings to a scheduler builder. The store and job
    /// factory are left to the caller.
    pub fn configure(&self, builder: SchedulerBuilder) -> SchedulerBuilder {
        let membership = StaticMembership::new(self.node.descriptor(), self.roster());
        let mut builder = builder
            .name(self.scheduler_name.clone())
            .max_threads(self.max_threads)
            .misfire_threshold(self.misfire_threshold())
            .misfire_policy(self.misfire_policy)
            .poll_interval(self.poll_interval())
            .shutdown_timeout(self.shutdown_timeout())
            .node_comparator(self.comparator.comparator())
            .distributed(Arc::new(membership));

        if let Some(index) = &self.config_index {
            builder = builder.config_index(index.clone());
        }
        if let Some(index) = &self.state_index {
            builder = builder.state_index(index.clone());
        }
        if let Some(filter) = &self.node_filter {
            builder = builder.node_filter(filter.clone());
        }
        if let Some(interval) = self.config_poll_interval() {
            builder = builder.config_poll_interval(interval);
        }
        builder
    }
}
