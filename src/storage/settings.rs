//! Settings storage
//!
//! Typed process configuration, persisted as JSON in the config directory.

use crate::storage::{get_config_dir, get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Server binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub host: String,
    pub port: u16,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

/// Model discovery and cache placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsSection {
    /// Directories scanned for local models
    pub scan_directories: Vec<PathBuf>,
    /// Model loaded at startup, if any
    pub default_model_identifier: Option<String>,
    /// Where persisted decode caches live
    pub cache_directory: PathBuf,
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Context window size for new decode caches
    pub context_size: u32,
}

impl Default for ModelsSection {
    fn default() -> Self {
        let data_dir = get_data_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            scan_directories: vec![data_dir.join("models")],
            default_model_identifier: None,
            cache_directory: data_dir.join("kv_caches"),
            gpu_layers: 99, // Offload all layers to GPU by default
            context_size: 4096,
        }
    }
}

/// Defaults for sampling fields a request leaves unset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    pub default_max_tokens: u32,
    pub default_temp: f32,
    pub default_top_p: f32,
    pub default_top_k: u32,
    pub default_repetition_penalty: f32,
    pub default_repetition_context_size: u32,
    /// `None` draws a random seed per request
    pub default_seed: Option<u64>,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            default_max_tokens: 512,
            default_temp: 0.6,
            default_top_p: 0.9,
            default_top_k: 50,
            default_repetition_penalty: 1.1,
            default_repetition_context_size: 25,
            default_seed: None,
        }
    }
}

/// Performance reporting knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSection {
    pub enabled: bool,
    pub history_size: u32,
    pub update_interval_ms: u64,
}

impl Default for PerformanceSection {
    fn default() -> Self {
        Self {
            enabled: true,
            history_size: 120,
            update_interval_ms: 2000,
        }
    }
}

/// Application settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub models: ModelsSection,
    pub generation: GenerationSection,
    pub performance: PerformanceSection,
}

impl AppConfig {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        let generation = &mut self.generation;
        generation.default_temp = generation.default_temp.clamp(0.0, 5.0);
        generation.default_top_p = generation.default_top_p.clamp(0.0, 1.0);
        if !(generation.default_repetition_penalty >= 0.0) {
            generation.default_repetition_penalty = 1.0;
        }
        if generation.default_max_tokens == 0 {
            generation.default_max_tokens = 512;
        }

        if self.models.context_size == 0 {
            self.models.context_size = 4096;
        }
        if self.app.host.trim().is_empty() {
            self.app.host = "127.0.0.1".to_string();
        }
        if self.performance.history_size == 0 {
            self.performance.history_size = 120;
        }
    }

    /// Read a value by dotted key path, e.g. `models.cache_directory`
    pub fn get_path(&self, key: &str) -> Option<Value> {
        let root = serde_json::to_value(self).ok()?;
        key.split('.')
            .try_fold(&root, |value, part| value.get(part))
            .cloned()
    }

    /// Set a value by dotted key path.
    ///
    /// The result must still deserialize into the typed config; otherwise the
    /// update is rejected and `self` is left untouched.
    pub fn set_path(&mut self, key: &str, new_value: Value) -> Result<(), StorageError> {
        let mut root = serde_json::to_value(&*self)?;
        let mut slot = &mut root;
        for part in key.split('.') {
            slot = slot
                .get_mut(part)
                .ok_or_else(|| StorageError::UnknownKey(key.to_string()))?;
        }
        *slot = new_value;

        let mut updated: AppConfig = serde_json::from_value(root)?;
        updated.validate();
        *self = updated;
        tracing::info!("Configuration updated: '{key}'");
        Ok(())
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_config_dir()?.join("config.json"))
}

/// Load settings from the default location
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> AppConfig {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            AppConfig::default()
        }
    }
}

/// Load settings from a specific file, creating it with defaults when absent
pub fn load_settings_from(path: &Path) -> Result<AppConfig, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        let settings = AppConfig::default();
        if let Err(e) = save_settings_to(&settings, path) {
            tracing::warn!("Could not write default settings to {}: {}", path.display(), e);
        }
        return Ok(settings);
    }

    let json = fs::read_to_string(path)?;
    let mut settings: AppConfig = serde_json::from_str(&json)?;

    // Validate loaded settings
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to a specific file
pub fn save_settings_to(settings: &AppConfig, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = AppConfig::default();
        assert_eq!(settings.app.port, 8000);
        assert_eq!(settings.generation.default_max_tokens, 512);
        assert_eq!(settings.generation.default_top_k, 50);
        assert_eq!(settings.generation.default_seed, None);
        assert!(settings.performance.enabled);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = AppConfig::default();

        settings.generation.default_temp = 9.0;
        settings.generation.default_top_p = 2.0;
        settings.generation.default_max_tokens = 0;
        settings.validate();

        assert_eq!(settings.generation.default_temp, 5.0);
        assert_eq!(settings.generation.default_top_p, 1.0);
        assert_eq!(settings.generation.default_max_tokens, 512);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{"generation": {"default_temp": 0.2}}"#).unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert!((settings.generation.default_temp - 0.2).abs() < f32::EPSILON);
        assert_eq!(settings.generation.default_top_k, 50);
        assert_eq!(settings.app.port, 8000);
    }

    #[test]
    fn test_missing_file_is_created() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.json");

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings, AppConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            load_settings_from(&path),
            Err(StorageError::JsonError(_))
        ));
    }

    #[test]
    fn test_key_path_access() {
        let mut settings = AppConfig::default();
        assert_eq!(settings.get_path("app.port"), Some(Value::from(8000)));
        assert_eq!(settings.get_path("app.missing"), None);

        settings
            .set_path("generation.default_top_k", Value::from(7))
            .unwrap();
        assert_eq!(settings.generation.default_top_k, 7);
    }

    #[test]
    fn test_key_path_rejects_bad_values() {
        let mut settings = AppConfig::default();
        assert!(matches!(
            settings.set_path("models.unknown", Value::from(1)),
            Err(StorageError::UnknownKey(_))
        ));
        assert!(settings
            .set_path("app.port", Value::from("not a port"))
            .is_err());
        assert_eq!(settings.app.port, 8000);
    }
}
