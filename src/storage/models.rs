//! Local model discovery
//!
//! Scans configured directories for models and describes them to clients.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::inference::backend::ModelMetadata;
use crate::inference::model::{read_config_snippet, ModelLayout};
use crate::storage::StorageError;

/// Where a model identifier points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    Local,
    Hub,
}

/// Client-facing description of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub source: ModelSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ModelMetadata>,
    pub is_loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_path: Option<String>,
}

impl ModelInfo {
    /// Describe an identifier that is either a local path or a hub repository id
    pub fn describe(identifier: &str, adapter_path: Option<&str>, config: ModelMetadata) -> Self {
        let local = Path::new(identifier);
        let (path, source, name) = if local.exists() {
            let resolved = fs::canonicalize(local).unwrap_or_else(|_| local.to_path_buf());
            let name = display_name(&resolved);
            (Some(resolved.display().to_string()), ModelSource::Local, name)
        } else {
            (None, ModelSource::Hub, identifier.to_string())
        };

        Self {
            id: identifier.to_string(),
            name,
            path,
            source,
            config: (!config.is_empty()).then_some(config),
            is_loaded: true,
            adapter_path: adapter_path.map(str::to_string),
        }
    }

    fn from_layout(layout: &ModelLayout) -> Self {
        let path = layout.path();
        let id = path.display().to_string();
        let config = match read_config_snippet(path) {
            Ok(config) if !config.is_empty() => Some(config),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("No config snippet for {}: {}", id, e);
                None
            }
        };

        Self {
            name: display_name(path),
            path: Some(id.clone()),
            id,
            source: ModelSource::Local,
            config,
            is_loaded: false,
            adapter_path: None,
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Scan one directory for models
///
/// Immediate children only: model directories and `.gguf` files.
pub fn scan_models_directory(directory: &Path) -> Result<Vec<ModelInfo>, StorageError> {
    if !directory.is_dir() {
        tracing::warn!(
            "Model scan directory not found or not a directory: {}",
            directory.display()
        );
        return Ok(vec![]);
    }

    let mut models = vec![];

    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        let Some(layout) = ModelLayout::detect(&path) else {
            continue;
        };
        let resolved = match fs::canonicalize(layout.path()) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!("Failed to resolve model path {:?}: {}", path, e);
                continue;
            }
        };
        let layout = match layout {
            ModelLayout::Gguf(_) => ModelLayout::Gguf(resolved),
            ModelLayout::HuggingFace(_) => ModelLayout::HuggingFace(resolved),
        };

        let model = ModelInfo::from_layout(&layout);
        tracing::debug!("Found local model: {} at {}", model.name, model.id);
        models.push(model);
    }

    // Sort by name
    models.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(models)
}

/// Scan every configured directory
///
/// Identifiers are canonical paths; the first occurrence wins. The model
/// matching `loaded` (identifier, adapter) is marked as loaded.
pub fn list_local_models(
    directories: &[PathBuf],
    loaded: Option<(&str, Option<&str>)>,
) -> Vec<ModelInfo> {
    let mut seen = HashSet::new();
    let mut models = vec![];

    for directory in directories {
        tracing::info!("Scanning for models in: {}", directory.display());
        match scan_models_directory(directory) {
            Ok(found) => models.extend(found.into_iter().filter(|m| seen.insert(m.id.clone()))),
            Err(e) => tracing::error!("Error scanning directory {}: {}", directory.display(), e),
        }
    }

    if let Some((identifier, adapter_path)) = loaded {
        let loaded_id = fs::canonicalize(identifier)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| identifier.to_string());
        for model in models.iter_mut().filter(|m| m.id == loaded_id) {
            model.is_loaded = true;
            model.adapter_path = adapter_path.map(str::to_string);
        }
    }

    tracing::info!("Finished scanning. Found {} local model(s)", models.len());
    models
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::model::GGUF_MAGIC;
    use std::io::Write;
    use tempfile::TempDir;

    fn create_gguf(path: &Path) {
        let mut file = fs::File::create(path).unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.write_all(&3u32.to_le_bytes()).unwrap();
        file.write_all(&[0u8; 16]).unwrap();
    }

    fn create_hf_dir(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.json"), r#"{"model_type": "llama"}"#).unwrap();
        fs::write(dir.join("weights.safetensors"), b"").unwrap();
        fs::write(dir.join("tokenizer.model"), b"").unwrap();
        dir
    }

    #[test]
    fn test_scan_models_directory() {
        let temp_dir = TempDir::new().unwrap();
        create_gguf(&temp_dir.path().join("model1.gguf"));
        create_hf_dir(temp_dir.path(), "hf-model");
        fs::write(temp_dir.path().join("not_a_model.txt"), b"").unwrap();
        fs::create_dir(temp_dir.path().join("empty-dir")).unwrap();

        let models = scan_models_directory(temp_dir.path()).unwrap();

        assert_eq!(models.len(), 2);
        let hf = models.iter().find(|m| m.name == "hf-model").unwrap();
        assert_eq!(hf.source, ModelSource::Local);
        assert_eq!(
            hf.config.as_ref().and_then(|c| c.model_type.as_deref()),
            Some("llama")
        );
        let gguf = models.iter().find(|m| m.name == "model1.gguf").unwrap();
        assert!(gguf.config.is_none());
        assert!(!gguf.is_loaded);
    }

    #[test]
    fn test_scan_nonexistent_directory() {
        let nonexistent = PathBuf::from("/this/path/does/not/exist");
        let result = scan_models_directory(&nonexistent);

        assert!(result.is_ok());
        assert_eq!(result.unwrap().len(), 0);
    }

    #[test]
    fn test_list_deduplicates_and_marks_loaded() {
        let temp_dir = TempDir::new().unwrap();
        let dir = create_hf_dir(temp_dir.path(), "hf-model");
        let id = fs::canonicalize(&dir).unwrap().display().to_string();

        let directories = vec![temp_dir.path().to_path_buf(), temp_dir.path().to_path_buf()];
        let models = list_local_models(&directories, Some((&id, Some("/adapters/a"))));

        assert_eq!(models.len(), 1);
        assert!(models[0].is_loaded);
        assert_eq!(models[0].adapter_path.as_deref(), Some("/adapters/a"));
    }

    #[test]
    fn test_describe_hub_identifier() {
        let info = ModelInfo::describe("org/some-model-4bit", None, ModelMetadata::default());
        assert_eq!(info.source, ModelSource::Hub);
        assert_eq!(info.name, "org/some-model-4bit");
        assert!(info.path.is_none());
        assert!(info.config.is_none());

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["source"], "hub");
        assert_eq!(json["is_loaded"], true);
    }
}
