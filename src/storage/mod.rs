//! Persistent storage
//!
//! Directory layout, configuration persistence, model discovery and cache
//! file naming.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod models;
pub mod settings;

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "KVSTREAM_CONFIG_DIR";

/// Extension given to persisted decode caches
pub const CACHE_FILE_EXTENSION: &str = "session";

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid cache name: {0:?}")]
    InvalidCacheName(String),
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),
}

fn project_dirs() -> Result<directories::ProjectDirs, StorageError> {
    directories::ProjectDirs::from("com", "kvstream", "kvstream")
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\kvstream\kvstream\data`
/// - macOS: `/Users/{user}/Library/Application Support/com.kvstream.kvstream`
/// - Linux: `/home/{user}/.local/share/kvstream`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    if let Some(dir) = config_dir_override() {
        return Ok(dir);
    }
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Get the configuration directory, honoring `KVSTREAM_CONFIG_DIR`
pub fn get_config_dir() -> Result<PathBuf, StorageError> {
    if let Some(dir) = config_dir_override() {
        return Ok(dir);
    }
    Ok(project_dirs()?.config_dir().to_path_buf())
}

fn config_dir_override() -> Option<PathBuf> {
    std::env::var_os(CONFIG_DIR_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Initialize the storage directory structure
///
/// Creates the config directory, the default models directory and the
/// cache directory named in the configuration.
pub fn init_storage(config: &settings::AppConfig) -> Result<(), StorageError> {
    std::fs::create_dir_all(get_config_dir()?)?;
    std::fs::create_dir_all(get_data_dir()?.join("models"))?;
    std::fs::create_dir_all(&config.models.cache_directory)?;

    tracing::info!(
        "Initialized storage (cache directory: {})",
        config.models.cache_directory.display()
    );

    Ok(())
}

/// Path of a persisted cache for a caller-supplied base name.
///
/// Directory components and any extension are stripped, so `"../chat.bin"`
/// and `"chat"` both map to `<dir>/chat.session`.
pub fn cache_file_path(cache_dir: &Path, name: &str) -> Result<PathBuf, StorageError> {
    let stem = Path::new(name.trim())
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .ok_or_else(|| StorageError::InvalidCacheName(name.to_string()))?;
    Ok(cache_dir.join(format!("{stem}.{CACHE_FILE_EXTENSION}")))
}

/// Sidecar metadata path for a persisted cache
pub fn cache_metadata_path(cache_path: &Path) -> PathBuf {
    cache_path.with_extension("meta.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_retrieval() {
        let result = get_data_dir();
        assert!(result.is_ok());
    }

    #[test]
    fn test_cache_file_path_normalizes_extension() {
        let dir = Path::new("/tmp/caches");
        assert_eq!(
            cache_file_path(dir, "chat").unwrap(),
            PathBuf::from("/tmp/caches/chat.session")
        );
        assert_eq!(
            cache_file_path(dir, "chat.safetensors").unwrap(),
            PathBuf::from("/tmp/caches/chat.session")
        );
    }

    #[test]
    fn test_cache_file_path_strips_directories() {
        let dir = Path::new("/tmp/caches");
        assert_eq!(
            cache_file_path(dir, "../../etc/chat.bin").unwrap(),
            PathBuf::from("/tmp/caches/chat.session")
        );
    }

    #[test]
    fn test_cache_file_path_rejects_empty() {
        let dir = Path::new("/tmp/caches");
        assert!(matches!(
            cache_file_path(dir, "  "),
            Err(StorageError::InvalidCacheName(_))
        ));
        assert!(cache_file_path(dir, "..").is_err());
    }

    #[test]
    fn test_metadata_sidecar() {
        let path = PathBuf::from("/tmp/caches/chat.session");
        assert_eq!(
            cache_metadata_path(&path),
            PathBuf::from("/tmp/caches/chat.meta.json")
        );
    }
}
