//! Scripted in-process backend for unit tests
//!
//! Tokens are whitespace-separated integers (non-numeric words hash to a
//! large id), decoding emits `1000, 1001, ...` and every call is recorded.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::inference::backend::{
    BackendError, CacheMetadata, DecodeEvent, DecodeRequest, DecodeStream, ModelBackend,
    ModelMetadata, TokenId, TrimEnd,
};
use crate::types::{ChatMessage, FinishReason};

pub const FIRST_GENERATED_TOKEN: TokenId = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedModel {
    pub identifier: String,
    pub vocab_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedTokenizer {
    pub vocab_size: usize,
    pub has_template: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedCache {
    pub len: usize,
    pub with_draft: bool,
    pub trimmable: bool,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    cache: ScriptedCache,
    metadata: CacheMetadata,
}

/// How the scripted decoder ends its stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ending {
    /// Final event carries `length` once the budget is used
    Length,
    /// The event at this index (0-based) carries `stop`
    StopAt(usize),
    /// Events run out at the budget without any finish reason
    Silent,
    /// The event at this index fails
    FailAt(usize),
    /// Fails before the prompt tail is encoded
    RejectPrompt,
}

pub struct ScriptedBackend {
    pub available: bool,
    pub models: HashMap<String, usize>,
    pub has_template: AtomicBool,
    pub trimmable: AtomicBool,
    /// Subtracted from the count reported by `trim`
    pub trim_shortfall: AtomicUsize,
    pub fail_metadata: AtomicBool,
    pub ending: Mutex<Ending>,
    pub calls: Mutex<Vec<String>>,
    pub fed: Mutex<Vec<Vec<TokenId>>>,
    pub last_draft_used: AtomicBool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        let mut models = HashMap::new();
        models.insert("main".to_string(), 32000);
        models.insert("other".to_string(), 32000);
        models.insert("draft".to_string(), 32000);
        models.insert("small-vocab-draft".to_string(), 151936);
        Self {
            available: true,
            models,
            has_template: AtomicBool::new(true),
            trimmable: AtomicBool::new(true),
            trim_shortfall: AtomicUsize::new(0),
            fail_metadata: AtomicBool::new(false),
            ending: Mutex::new(Ending::Length),
            calls: Mutex::new(Vec::new()),
            fed: Mutex::new(Vec::new()),
            last_draft_used: AtomicBool::new(false),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn set_ending(&self, ending: Ending) {
        *self.ending.lock().unwrap() = ending;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }

    pub fn last_fed(&self) -> Option<Vec<TokenId>> {
        self.fed.lock().unwrap().last().cloned()
    }

    fn record(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }

    fn lookup(&self, identifier: &str) -> Result<(ScriptedModel, ScriptedTokenizer), BackendError> {
        if identifier == "broken" {
            return Err(BackendError::Failed("corrupt weights".to_string()));
        }
        let vocab_size = *self
            .models
            .get(identifier)
            .ok_or_else(|| BackendError::NotFound(identifier.to_string()))?;
        Ok((
            ScriptedModel {
                identifier: identifier.to_string(),
                vocab_size,
            },
            ScriptedTokenizer {
                vocab_size,
                has_template: self.has_template.load(Ordering::SeqCst),
            },
        ))
    }
}

impl ModelBackend for ScriptedBackend {
    type Model = ScriptedModel;
    type Tokenizer = ScriptedTokenizer;
    type Cache = ScriptedCache;

    fn is_available(&self) -> bool {
        self.available
    }

    fn load(
        &self,
        identifier: &str,
        adapter_path: Option<&str>,
    ) -> Result<(Self::Model, Self::Tokenizer), BackendError> {
        self.record("load");
        if adapter_path == Some("missing-adapter") {
            return Err(BackendError::NotFound("missing-adapter".to_string()));
        }
        self.lookup(identifier)
    }

    fn load_draft(&self, identifier: &str) -> Result<(Self::Model, Self::Tokenizer), BackendError> {
        self.record("load_draft");
        self.lookup(identifier)
    }

    fn release(&self) -> Result<(), BackendError> {
        self.record("release");
        Ok(())
    }

    fn resolve_metadata(&self, identifier: &str) -> Result<ModelMetadata, BackendError> {
        self.record("resolve_metadata");
        if self.fail_metadata.load(Ordering::SeqCst) {
            return Err(BackendError::NotFound(format!("{identifier}/config.json")));
        }
        Ok(ModelMetadata {
            model_type: Some("scripted".to_string()),
            num_hidden_layers: Some(2),
            ..Default::default()
        })
    }

    fn embedded_metadata(&self, model: &Self::Model) -> ModelMetadata {
        ModelMetadata {
            model_type: Some("embedded".to_string()),
            vocab_size: Some(model.vocab_size as u64),
            ..Default::default()
        }
    }

    fn vocab_size(&self, tokenizer: &Self::Tokenizer) -> usize {
        tokenizer.vocab_size
    }

    fn tokenize(&self, _tokenizer: &Self::Tokenizer, text: &str) -> Result<Vec<TokenId>, BackendError> {
        self.record("tokenize");
        Ok(text
            .split_whitespace()
            .map(|word| {
                word.parse::<TokenId>()
                    .unwrap_or_else(|_| 500 + word.bytes().map(TokenId::from).sum::<TokenId>() % 400)
            })
            .collect())
    }

    fn has_chat_template(&self, tokenizer: &Self::Tokenizer) -> bool {
        tokenizer.has_template
    }

    fn apply_chat_template(
        &self,
        _tokenizer: &Self::Tokenizer,
        messages: &[ChatMessage],
    ) -> Result<String, BackendError> {
        self.record("apply_chat_template");
        Ok(messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn make_cache(
        &self,
        _model: &Self::Model,
        draft: Option<&Self::Model>,
        _max_size: Option<usize>,
    ) -> Result<Self::Cache, BackendError> {
        self.record("make_cache");
        Ok(ScriptedCache {
            len: 0,
            with_draft: draft.is_some(),
            trimmable: self.trimmable.load(Ordering::SeqCst),
        })
    }

    fn can_trim(&self, cache: &Self::Cache) -> bool {
        cache.trimmable
    }

    fn trim(&self, cache: &mut Self::Cache, n: usize, _end: TrimEnd) -> Result<usize, BackendError> {
        self.record("trim");
        if !cache.trimmable {
            return Err(BackendError::Unsupported("rotating cache".to_string()));
        }
        let trimmed = n.min(cache.len).saturating_sub(self.trim_shortfall.load(Ordering::SeqCst));
        cache.len -= trimmed;
        Ok(trimmed)
    }

    fn save_cache(
        &self,
        path: &Path,
        cache: &Self::Cache,
        metadata: &CacheMetadata,
    ) -> Result<(), BackendError> {
        self.record("save_cache");
        let file = CacheFile {
            cache: cache.clone(),
            metadata: metadata.clone(),
        };
        let json = serde_json::to_string(&file).map_err(|e| BackendError::Failed(e.to_string()))?;
        fs::write(path, json).map_err(|e| BackendError::Failed(e.to_string()))
    }

    fn load_cache(&self, path: &Path) -> Result<(Self::Cache, CacheMetadata), BackendError> {
        self.record("load_cache");
        let json = fs::read_to_string(path).map_err(|e| BackendError::NotFound(e.to_string()))?;
        let file: CacheFile =
            serde_json::from_str(&json).map_err(|e| BackendError::Failed(e.to_string()))?;
        Ok((file.cache, file.metadata))
    }

    fn decode_stream<'a>(&'a self, request: DecodeRequest<'a, Self>) -> Result<DecodeStream<'a>, BackendError> {
        self.record("decode_stream");
        self.fed.lock().unwrap().push(request.tokens.to_vec());
        self.last_draft_used
            .store(request.draft.is_some(), Ordering::SeqCst);

        let ending = *self.ending.lock().unwrap();
        if ending == Ending::RejectPrompt {
            return Ok(Box::new(std::iter::once(Err(BackendError::Decode(
                "context window exceeded".to_string(),
            )))));
        }
        request.cache.len += request.tokens.len();
        let max_tokens = request.max_tokens;
        let from_draft = request.draft.is_some();
        let cache = request.cache;

        let mut step = 0usize;
        let stream = std::iter::from_fn(move || {
            if step >= max_tokens {
                return None;
            }
            let index = step;
            step += 1;
            if ending == Ending::FailAt(index) {
                return Some(Err(BackendError::Decode("device lost".to_string())));
            }
            cache.len += 1;
            let finish_reason = match ending {
                Ending::StopAt(at) if at == index => Some(FinishReason::Stop),
                Ending::Length if index + 1 == max_tokens => Some(FinishReason::Length),
                _ => None,
            };
            Some(Ok(DecodeEvent {
                text: format!("t{index} "),
                token: FIRST_GENERATED_TOKEN + index as TokenId,
                finish_reason,
                tokens_per_second: 0.0,
                from_draft: from_draft && index % 2 == 1,
            }))
        });
        Ok(Box::new(stream))
    }
}
