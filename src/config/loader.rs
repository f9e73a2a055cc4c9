//! Load job documents from a directory.

use serde_json::Value;
use std::path::Path;

use super::error::ConfigError;
use crate::storage::DocumentStore;

/// Read every `*.json`, `*.yaml` and `*.yml` file in `dir` as a job document.
///
/// The file stem becomes the document id. Results are ordered by id.
pub fn load_documents_from_directory(
    dir: impl AsRef<Path>,
) -> Result<Vec<(String, Value)>, ConfigError> {
    let dir = dir.as_ref();

    if !dir.is_dir() {
        return Err(ConfigError::InvalidConfig(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }

    let mut documents = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| ConfigError::dir_read(dir, e))? {
        let entry = entry.map_err(|e| ConfigError::dir_read(dir, e))?;
        let path = entry.path();

        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let document = match ext {
            "json" => {
                let content =
                    std::fs::read_to_string(&path).map_err(|e| ConfigError::file_read(&path, e))?;
                serde_json::from_str(&content).map_err(|e| ConfigError::JsonFileError {
                    path: path.clone(),
                    source: e,
                })?
            }
            "yaml" | "yml" => {
                let content =
                    std::fs::read_to_string(&path).map_err(|e| ConfigError::file_read(&path, e))?;
                serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlFileError {
                    path: path.clone(),
                    source: e,
                })?
            }
            _ => continue,
        };
        documents.push((id.to_string(), document));
    }

    documents.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(documents)
}

/// Write documents into `index`. Returns how many were written.
pub async fn import_documents(
    store: &dyn DocumentStore,
    index: &str,
    documents: Vec<(String, Value)>,
) -> Result<usize, ConfigError> {
    let count = documents.len();
    for (id, source) in documents {
        store.put(index, &id, source).await?;
    }
    Ok(count)
}
