//! Job configs read from the config index.

use std::sync::Arc;

use crate::core::executable::JobFactory;
use crate::core::job::{JobConfig, JobConfigError, JobConfigFactory};
use crate::core::types::JobKey;
use crate::storage::{DocumentStore, StorageError};

/// Result of one pass over the config index.
#[derive(Debug, Default)]
pub struct LoadedConfigs {
    /// Valid configs, ordered by document id.
    pub configs: Vec<JobConfig>,
    /// Documents that could not be turned into a config.
    pub rejected: Vec<(JobKey, JobConfigError)>,
}

/// Reads and parses every document of a config index.
pub struct IndexJobConfigSource {
    store: Arc<dyn DocumentStore>,
    config_index: String,
    factory: Arc<dyn JobConfigFactory>,
    job_factory: Option<Arc<dyn JobFactory>>,
}

impl IndexJobConfigSource {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config_index: impl Into<String>,
        factory: Arc<dyn JobConfigFactory>,
    ) -> Self {
        Self {
            store,
            config_index: config_index.into(),
            factory,
            job_factory: None,
        }
    }

    /// Reject documents whose job type this factory cannot create.
    pub fn with_job_factory(mut self, job_factory: Arc<dyn JobFactory>) -> Self {
        self.job_factory = Some(job_factory);
        self
    }

    pub fn config_index(&self) -> &str {
        &self.config_index
    }

    /// Load all configs.
    ///
    /// Invalid documents are logged and skipped. A store failure is returned
    /// as an error so the caller can keep its previous snapshot.
    pub async fn load(&self) -> Result<LoadedConfigs, StorageError> {
        let documents = self.store.list(&self.config_index).await?;
        let mut loaded = LoadedConfigs::default();

        for doc in documents {
            let key = JobKey::new(&self.config_index, &doc.id);
            match self.parse(key.clone(), &doc.source, doc.version) {
                Ok(config) => loaded.configs.push(config),
                Err(e) => {
                    tracing::warn!(job = %key, error = %e, "skipping invalid job document");
                    loaded.rejected.push((key, e));
                }
            }
        }

        Ok(loaded)
    }

    fn parse(
        &self,
        key: JobKey,
        source: &serde_json::Value,
        version: i64,
    ) -> Result<JobConfig, JobConfigError> {
        let config = self.factory.create_from_document(key, source, version)?;
        if let Some(job_factory) = &self.job_factory
            && !job_factory.supports(config.job_type())
        {
            return Err(JobConfigError::UnknownJobType(config.job_type().to_string()));
        }
        Ok(config)
    }
}
