//! Model backend boundary
//!
//! Everything that touches weights, tensors or tokenizers sits behind
//! [`ModelBackend`]. All methods are blocking; callers run them on the
//! blocking pool via `tokio::task::spawn_blocking`.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::types::{ChatMessage, FinishReason};

/// Token id as exchanged with clients and stored in cache history
pub type TokenId = u32;

/// Errors reported by a backend
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend not available: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backend operation failed: {0}")]
    Failed(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Unavailable(_) => ErrorKind::BackendUnavailable,
            BackendError::NotFound(_) => ErrorKind::ModelNotFound,
            BackendError::Failed(_) => ErrorKind::LoadFailed,
            BackendError::Decode(_) => ErrorKind::DecodeFailure,
            BackendError::Unsupported(_) => ErrorKind::CacheUnsupportedOperation,
        }
    }
}

/// Snippet of model configuration exposed to clients
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_hidden_layers: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocab_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<serde_json::Value>,
}

impl ModelMetadata {
    /// Returns true if no field is known
    pub fn is_empty(&self) -> bool {
        *self == ModelMetadata::default()
    }
}

/// Which end of the cache a trim removes tokens from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimEnd {
    /// Oldest tokens; remaining positions shift down
    Front,
    /// Newest tokens
    Back,
}

/// Metadata record stored next to a persisted cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub model_identifier: Option<String>,
    pub adapter_path: Option<String>,
    pub token_count: usize,
    /// Name and version of the producing tool, e.g. `kvstream/0.1.0`
    pub tool_version: String,
    pub creation_timestamp: DateTime<Utc>,
}

/// Sampler settings resolved for one request
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    pub temperature: f32,
    pub top_p: f32,
    /// 0 disables top-k
    pub top_k: u32,
    pub min_p: f32,
    pub min_tokens_to_keep: u32,
    pub xtc_probability: f32,
    pub xtc_threshold: f32,
    pub seed: u64,
}

/// Logit processors resolved for one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogitProcessors {
    pub logit_bias: Vec<(TokenId, f32)>,
    pub repetition_penalty: Option<f32>,
    pub repetition_context_size: u32,
}

/// Cache quantization applied while decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvQuantization {
    pub bits: u8,
    pub group_size: u32,
    pub start: u32,
}

/// One step of decoder output
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeEvent {
    pub text: String,
    pub token: TokenId,
    pub finish_reason: Option<FinishReason>,
    /// Backend-measured throughput; 0.0 when the backend does not track it
    pub tokens_per_second: f64,
    pub from_draft: bool,
}

/// Lazy decode output; dropping it releases the backend stream
pub type DecodeStream<'a> = Box<dyn Iterator<Item = Result<DecodeEvent, BackendError>> + 'a>;

/// Everything a decode stream needs
pub struct DecodeRequest<'a, B: ModelBackend + ?Sized> {
    pub model: &'a B::Model,
    pub tokenizer: &'a B::Tokenizer,
    /// Tokens not yet encoded in the cache; may be empty on full reuse
    pub tokens: &'a [TokenId],
    pub max_tokens: usize,
    pub cache: &'a mut B::Cache,
    pub sampler: &'a SamplerConfig,
    pub logits: &'a LogitProcessors,
    pub draft: Option<&'a B::Model>,
    pub num_draft_tokens: usize,
    pub kv_quantization: Option<KvQuantization>,
}

/// Capabilities the orchestrator consumes from a model runtime
pub trait ModelBackend: Send + Sync + 'static {
    type Model: Send + Sync + 'static;
    type Tokenizer: Send + Sync + 'static;
    type Cache: Send + 'static;

    /// Whether the runtime initialized at process start
    fn is_available(&self) -> bool;

    /// Materialize a primary model and its tokenizer
    fn load(
        &self,
        identifier: &str,
        adapter_path: Option<&str>,
    ) -> Result<(Self::Model, Self::Tokenizer), BackendError>;

    /// Materialize a draft model next to the current primary
    fn load_draft(&self, identifier: &str) -> Result<(Self::Model, Self::Tokenizer), BackendError>;

    /// Release device-resident memory held for the current models
    fn release(&self) -> Result<(), BackendError>;

    /// Look up model configuration by identifier
    fn resolve_metadata(&self, identifier: &str) -> Result<ModelMetadata, BackendError>;

    /// Configuration embedded in a loaded model
    fn embedded_metadata(&self, model: &Self::Model) -> ModelMetadata;

    fn vocab_size(&self, tokenizer: &Self::Tokenizer) -> usize;

    fn tokenize(&self, tokenizer: &Self::Tokenizer, text: &str) -> Result<Vec<TokenId>, BackendError>;

    fn has_chat_template(&self, tokenizer: &Self::Tokenizer) -> bool;

    fn apply_chat_template(
        &self,
        tokenizer: &Self::Tokenizer,
        messages: &[ChatMessage],
    ) -> Result<String, BackendError>;

    /// Create an empty cache spanning the primary and, if given, the draft model
    fn make_cache(
        &self,
        model: &Self::Model,
        draft: Option<&Self::Model>,
        max_size: Option<usize>,
    ) -> Result<Self::Cache, BackendError>;

    fn can_trim(&self, cache: &Self::Cache) -> bool;

    /// Remove up to `n` tokens; returns the number actually removed
    fn trim(&self, cache: &mut Self::Cache, n: usize, end: TrimEnd) -> Result<usize, BackendError>;

    fn save_cache(
        &self,
        path: &Path,
        cache: &Self::Cache,
        metadata: &CacheMetadata,
    ) -> Result<(), BackendError>;

    fn load_cache(&self, path: &Path) -> Result<(Self::Cache, CacheMetadata), BackendError>;

    /// Start decoding; the returned stream yields one event per generated token
    fn decode_stream<'a>(&'a self, request: DecodeRequest<'a, Self>) -> Result<DecodeStream<'a>, BackendError>;
}

/// Run a blocking backend call on the blocking pool
pub async fn run_blocking<T, F>(f: F) -> Result<T, BackendError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::Failed(format!("Blocking task failed: {e}")))
}
