//! Model files on disk
//!
//! GGUF header validation, model layout detection and the `config.json`
//! snippet exposed to clients.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::inference::backend::ModelMetadata;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Files accepted as a tokenizer in a Hugging Face style directory
const TOKENIZER_FILES: [&str; 2] = ["tokenizer.json", "tokenizer.model"];

/// Errors that can occur while probing model files
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,

    #[error("Invalid config.json: {0}")]
    InvalidConfig(#[from] serde_json::Error),
}

/// Header fields of a GGUF file
#[derive(Debug, Clone)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// How a model is laid out on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLayout {
    /// Single llama.cpp weights file
    Gguf(PathBuf),
    /// Directory with `config.json`, safetensors weights and a tokenizer
    HuggingFace(PathBuf),
}

impl ModelLayout {
    /// Classify a path, returning `None` if it is not a recognizable model
    pub fn detect(path: &Path) -> Option<Self> {
        if path.is_file() {
            return is_gguf_file(path).then(|| ModelLayout::Gguf(path.to_path_buf()));
        }
        if path.is_dir() && is_hf_model_dir(path) {
            return Some(ModelLayout::HuggingFace(path.to_path_buf()));
        }
        None
    }

    pub fn path(&self) -> &Path {
        match self {
            ModelLayout::Gguf(path) | ModelLayout::HuggingFace(path) => path,
        }
    }
}

fn read_u32(file: &mut File) -> Result<u32, ModelError> {
    let mut bytes = [0u8; 4];
    file.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(file: &mut File) -> Result<u64, ModelError> {
    let mut bytes = [0u8; 8];
    file.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Validates that a file is a GGUF model and reads its header.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let mut file = File::open(path)?;

    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < 24 {
        return Err(ModelError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    let magic = read_u32(&mut file)?;
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    // GGUF v2 and v3 are supported
    let version = read_u32(&mut file)?;
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    Ok(GgufHeader {
        version,
        tensor_count: read_u64(&mut file)?,
        metadata_kv_count: read_u64(&mut file)?,
    })
}

/// Checks extension first, then magic bytes.
pub fn is_gguf_file<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();
    let has_extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
        .unwrap_or(false);

    has_extension && validate_gguf(path).is_ok()
}

fn has_safetensors(dir: &Path) -> bool {
    let Some(dir_str) = dir.to_str() else {
        return false;
    };
    let pattern = format!("{}/*.safetensors", glob::Pattern::escape(dir_str));
    match glob::glob(&pattern) {
        Ok(mut paths) => paths.any(|entry| entry.is_ok()),
        Err(e) => {
            tracing::debug!("Bad glob pattern for {}: {}", dir.display(), e);
            false
        }
    }
}

/// True for a directory holding `config.json`, safetensors weights and a tokenizer
pub fn is_hf_model_dir(dir: &Path) -> bool {
    dir.join("config.json").is_file()
        && TOKENIZER_FILES.iter().any(|name| dir.join(name).is_file())
        && has_safetensors(dir)
}

/// First GGUF file directly inside a directory, in name order
pub fn find_gguf_in_dir(dir: &Path) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_gguf_file(path))
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Extract the client-facing snippet from a parsed `config.json`
pub fn metadata_from_config(config: &serde_json::Value) -> ModelMetadata {
    let text = |key: &str| config.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let number = |key: &str| config.get(key).and_then(|v| v.as_u64());

    ModelMetadata {
        model_type: text("model_type"),
        hidden_size: number("hidden_size"),
        num_hidden_layers: number("num_hidden_layers"),
        vocab_size: number("vocab_size"),
        quantization: config
            .get("quantization")
            .filter(|v| !v.is_null())
            .cloned(),
    }
}

/// Read `config.json` next to (or inside) a model path
pub fn read_config_snippet(model_path: &Path) -> Result<ModelMetadata, ModelError> {
    let dir = if model_path.is_dir() {
        model_path
    } else {
        model_path.parent().unwrap_or(model_path)
    };
    let json = fs::read_to_string(dir.join("config.json"))?;
    let config: serde_json::Value = serde_json::from_str(&json)?;
    Ok(metadata_from_config(&config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn write_header(file: &mut impl Write, magic: u32, version: u32) {
        file.write_all(&magic.to_le_bytes()).unwrap();
        file.write_all(&version.to_le_bytes()).unwrap();
        file.write_all(&10u64.to_le_bytes()).unwrap(); // tensor_count
        file.write_all(&5u64.to_le_bytes()).unwrap(); // metadata_kv_count
        file.flush().unwrap();
    }

    fn create_test_gguf() -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        write_header(&mut file, GGUF_MAGIC, 3);
        file
    }

    fn create_hf_dir(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.json"),
            r#"{"model_type": "qwen2", "hidden_size": 896, "num_hidden_layers": 24, "quantization": {"bits": 4}}"#,
        )
        .unwrap();
        fs::write(dir.join("model.safetensors"), b"").unwrap();
        fs::write(dir.join("tokenizer.json"), b"{}").unwrap();
        dir
    }

    #[test]
    fn test_validate_gguf_valid() {
        let file = create_test_gguf();
        let header = validate_gguf(file.path()).unwrap();

        assert_eq!(header.version, 3);
        assert_eq!(header.tensor_count, 10);
        assert_eq!(header.metadata_kv_count, 5);
    }

    #[test]
    fn test_validate_gguf_invalid_magic() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        write_header(&mut file, 0xDEADBEEF, 3);

        let result = validate_gguf(file.path());
        assert!(matches!(result, Err(ModelError::InvalidMagic(0xDEADBEEF))));
    }

    #[test]
    fn test_validate_gguf_old_version() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        write_header(&mut file, GGUF_MAGIC, 1);

        assert!(matches!(
            validate_gguf(file.path()),
            Err(ModelError::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn test_validate_gguf_file_too_small() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.flush().unwrap();

        let result = validate_gguf(file.path());
        assert!(matches!(result, Err(ModelError::FileTooSmall)));
    }

    #[test]
    fn test_is_gguf_file_wrong_extension() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        write_header(&mut file, GGUF_MAGIC, 3);

        assert!(!is_gguf_file(file.path()));
        assert!(is_gguf_file(create_test_gguf().path()));
    }

    #[test]
    fn test_detect_layouts() {
        let temp_dir = TempDir::new().unwrap();
        let hf = create_hf_dir(temp_dir.path(), "qwen");
        let gguf = create_test_gguf();

        assert_eq!(
            ModelLayout::detect(&hf),
            Some(ModelLayout::HuggingFace(hf.clone()))
        );
        assert!(matches!(
            ModelLayout::detect(gguf.path()),
            Some(ModelLayout::Gguf(_))
        ));

        // No tokenizer
        fs::remove_file(hf.join("tokenizer.json")).unwrap();
        assert_eq!(ModelLayout::detect(&hf), None);
    }

    #[test]
    fn test_config_snippet() {
        let temp_dir = TempDir::new().unwrap();
        let hf = create_hf_dir(temp_dir.path(), "qwen");

        let metadata = read_config_snippet(&hf).unwrap();
        assert_eq!(metadata.model_type.as_deref(), Some("qwen2"));
        assert_eq!(metadata.num_hidden_layers, Some(24));
        assert_eq!(metadata.vocab_size, None);
        assert_eq!(metadata.quantization, Some(serde_json::json!({"bits": 4})));
    }

    #[test]
    fn test_find_gguf_in_dir() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(find_gguf_in_dir(temp_dir.path()), None);

        let mut file = File::create(temp_dir.path().join("b.gguf")).unwrap();
        write_header(&mut file, GGUF_MAGIC, 3);
        fs::write(temp_dir.path().join("a.gguf"), b"junk").unwrap();

        assert_eq!(
            find_gguf_in_dir(temp_dir.path()),
            Some(temp_dir.path().join("b.gguf"))
        );
    }
}
