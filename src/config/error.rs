//! Configuration error types.
//!
//! This module defines error types for settings and job document loading.

use std::path::PathBuf;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read file: {0}")]
    IoError(std::io::Error),

    /// Failed to read a specific file with context.
    #[error("failed to read file '{path}': {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to read a directory with context.
    #[error("failed to read directory '{path}': {source}")]
    DirReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("YAML parse error: {0}")]
    YamlError(serde_yaml::Error),

    /// Failed to parse YAML from a specific file.
    #[error("YAML parse error in '{path}': {source}")]
    YamlFileError {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Failed to parse JSON from a specific file.
    #[error("JSON parse error in '{path}': {source}")]
    JsonFileError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The document store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::YamlError(err)
    }
}

impl ConfigError {
    /// Create a FileReadError with path context.
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::FileReadError {
            path: path.into(),
            source,
        }
    }

    /// Create a DirReadError with path context.
    pub fn dir_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::DirReadError {
            path: path.into(),
            source,
        }
    }
}
