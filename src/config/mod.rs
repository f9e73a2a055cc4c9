//! Configuration loading.
//!
//! This module provides the config index job source, YAML node settings and
//! a directory loader for job documents.

mod error;
mod loader;
mod settings;
mod source;

pub use error::ConfigError;
pub use loader::{import_documents, load_documents_from_directory};
pub use settings::{ComparatorKind, LocalNodeSettings, NodeSettings, StorageConfig};
pub use source::{IndexJobConfigSource, LoadedConfigs};
