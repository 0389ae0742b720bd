//! Decode cache management
//!
//! Owns the backend cache object together with the token history it encodes,
//! decides how much of a new prompt can be served from the cache, and
//! persists or restores cache state.
//!
//! Every method is blocking and expects to run on the blocking pool while the
//! caller holds the cache lease.

use std::path::Path;

use chrono::Utc;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::inference::backend::{BackendError, CacheMetadata, ModelBackend, TokenId, TrimEnd};

/// Tag recorded in persisted cache metadata
pub const TOOL_VERSION: &str = concat!("kvstream/", env!("CARGO_PKG_VERSION"));

/// Errors from cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("No model loaded")]
    NoModelLoaded,

    #[error("No active cache")]
    NoCache,

    #[error("Cache file not found: {0}")]
    CacheNotFound(String),

    #[error("Unsupported cache operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid cache name: {0:?}")]
    InvalidName(String),

    #[error("Cannot trim {requested} tokens from a cache of {size}")]
    TrimOutOfRange { requested: usize, size: usize },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Cache storage error: {0}")]
    Io(#[from] crate::storage::StorageError),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::NoModelLoaded => ErrorKind::NoModelLoaded,
            CacheError::NoCache | CacheError::CacheNotFound(_) => ErrorKind::CacheNotFound,
            CacheError::UnsupportedOperation(_) => ErrorKind::CacheUnsupportedOperation,
            CacheError::InvalidName(_) | CacheError::TrimOutOfRange { .. } => {
                ErrorKind::InvalidRequest
            }
            CacheError::Backend(e) => e.kind(),
            CacheError::Io(_) => ErrorKind::CacheNotFound,
        }
    }
}

/// Models a cache is built for
pub struct CacheShape<'a, B: ModelBackend> {
    pub model: &'a B::Model,
    pub draft: Option<&'a B::Model>,
    /// Rotating-cache bound applied when a new cache is created
    pub max_size: Option<usize>,
}

/// How a prompt was matched against the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// No cache existed; one was created
    Created,
    /// Cache history equals the prompt
    FullReuse,
    /// Prompt extends the cache history
    Extended { reused: usize },
    /// Diverging tail was trimmed off
    Trimmed { reused: usize, trimmed: usize },
    /// Cache could not be trimmed and was rebuilt from scratch
    Rebuilt,
}

/// Result of reconciling a prompt with the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// Tokens the backend still has to encode
    pub to_process: Vec<TokenId>,
    pub outcome: Reconciliation,
}

/// Decode cache plus the token history it represents
pub struct CacheManager<B: ModelBackend> {
    cache: Option<B::Cache>,
    history: Vec<TokenId>,
    /// The cache was built with a draft model alongside the primary
    spans_draft: bool,
}

impl<B: ModelBackend> Default for CacheManager<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ModelBackend> CacheManager<B> {
    pub fn new() -> Self {
        Self {
            cache: None,
            history: Vec::new(),
            spans_draft: false,
        }
    }

    /// Whether a cache object currently exists
    pub fn is_active(&self) -> bool {
        self.cache.is_some()
    }

    /// Number of tokens in the history
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn history(&self) -> &[TokenId] {
        &self.history
    }

    /// Drop the cache and its history
    pub fn invalidate(&mut self) {
        if self.cache.is_some() {
            tracing::debug!("Invalidating decode cache ({} tokens)", self.history.len());
        }
        self.cache = None;
        self.history.clear();
        self.spans_draft = false;
    }

    /// Cache and history for an in-flight decode
    pub fn split_mut(&mut self) -> Option<(&mut B::Cache, &mut Vec<TokenId>)> {
        let history = &mut self.history;
        self.cache.as_mut().map(|cache| (cache, history))
    }

    fn rebuild(
        &mut self,
        backend: &B,
        shape: &CacheShape<'_, B>,
        prompt: &[TokenId],
    ) -> Result<(), CacheError> {
        // Release the old cache before allocating a new one
        self.invalidate();
        let cache = backend.make_cache(shape.model, shape.draft, shape.max_size)?;
        self.cache = Some(cache);
        self.history = prompt.to_vec();
        self.spans_draft = shape.draft.is_some();
        Ok(())
    }

    /// Match `prompt` against the cached history and return the tokens that
    /// still need encoding.
    ///
    /// On divergence the mismatched tail is trimmed; if that is not possible
    /// exactly, the cache is rebuilt and the whole prompt is returned.
    pub fn reconcile(
        &mut self,
        backend: &B,
        shape: &CacheShape<'_, B>,
        prompt: &[TokenId],
    ) -> Result<Reconciled, CacheError> {
        if self.cache.is_some() && shape.draft.is_some() && !self.spans_draft {
            self.rebuild(backend, shape, prompt)?;
            tracing::info!("Cache rebuilt with draft model; encoding {} prompt tokens", prompt.len());
            return Ok(Reconciled {
                to_process: prompt.to_vec(),
                outcome: Reconciliation::Rebuilt,
            });
        }

        let Some(cache) = self.cache.as_mut() else {
            self.rebuild(backend, shape, prompt)?;
            tracing::info!("Created decode cache; encoding {} prompt tokens", prompt.len());
            return Ok(Reconciled {
                to_process: prompt.to_vec(),
                outcome: Reconciliation::Created,
            });
        };

        let common = self
            .history
            .iter()
            .zip(prompt)
            .take_while(|(cached, new)| cached == new)
            .count();
        let cached_len = self.history.len();

        if common == cached_len {
            if cached_len == prompt.len() {
                tracing::info!("Cache fully reused ({} tokens)", cached_len);
                return Ok(Reconciled {
                    to_process: Vec::new(),
                    outcome: Reconciliation::FullReuse,
                });
            }
            let tail = prompt[common..].to_vec();
            self.history.extend_from_slice(&tail);
            tracing::info!(
                "Cache prefix reused: {} tokens cached, {} new",
                common,
                tail.len()
            );
            return Ok(Reconciled {
                to_process: tail,
                outcome: Reconciliation::Extended { reused: common },
            });
        }

        let excess = cached_len - common;
        if backend.can_trim(cache) {
            match backend.trim(cache, excess, TrimEnd::Back) {
                Ok(trimmed) if trimmed == excess => {
                    self.history.truncate(common);
                    let tail = prompt[common..].to_vec();
                    self.history.extend_from_slice(&tail);
                    tracing::info!(
                        "Cache trimmed by {} tokens; reusing {}, encoding {}",
                        excess,
                        common,
                        tail.len()
                    );
                    return Ok(Reconciled {
                        to_process: tail,
                        outcome: Reconciliation::Trimmed {
                            reused: common,
                            trimmed: excess,
                        },
                    });
                }
                Ok(trimmed) => tracing::warn!(
                    "Cache trim reported {}, expected {}. Rebuilding cache",
                    trimmed,
                    excess
                ),
                Err(e) => tracing::error!("Error trimming cache: {}. Rebuilding cache", e),
            }
        } else {
            tracing::debug!("Cache cannot be trimmed. Rebuilding cache");
        }

        self.rebuild(backend, shape, prompt)?;
        tracing::info!("Cache rebuilt; encoding {} prompt tokens", prompt.len());
        Ok(Reconciled {
            to_process: prompt.to_vec(),
            outcome: Reconciliation::Rebuilt,
        })
    }

    /// Persist the cache; returns the saved token count
    pub fn save(
        &self,
        backend: &B,
        path: &Path,
        model_identifier: &str,
        adapter_path: Option<&str>,
    ) -> Result<usize, CacheError> {
        let cache = self.cache.as_ref().ok_or(CacheError::NoCache)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(crate::storage::StorageError::from)?;
        }

        let metadata = CacheMetadata {
            model_identifier: Some(model_identifier.to_string()),
            adapter_path: adapter_path.map(str::to_string),
            token_count: self.history.len(),
            tool_version: TOOL_VERSION.to_string(),
            creation_timestamp: Utc::now(),
        };

        tracing::info!(
            "Saving decode cache ({} tokens) to {}",
            metadata.token_count,
            path.display()
        );
        backend.save_cache(path, cache, &metadata)?;
        Ok(metadata.token_count)
    }

    /// Install a persisted cache; returns the restored token count.
    ///
    /// Only the token count survives a round trip, so the history becomes a
    /// placeholder of that length. On failure the cache is left empty.
    pub fn load(
        &mut self,
        backend: &B,
        path: &Path,
        current_identifier: &str,
    ) -> Result<usize, CacheError> {
        if !path.is_file() {
            tracing::error!("Cache file not found: {}", path.display());
            return Err(CacheError::CacheNotFound(path.display().to_string()));
        }

        let (cache, metadata) = match backend.load_cache(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!("Failed to load decode cache from {}: {}", path.display(), e);
                self.invalidate();
                return Err(match e {
                    BackendError::NotFound(what) => CacheError::CacheNotFound(what),
                    other => CacheError::Backend(other),
                });
            }
        };

        if let Some(saved_for) = metadata.model_identifier.as_deref() {
            if saved_for != current_identifier {
                tracing::warn!(
                    "Cache model mismatch (cache: '{}', current: '{}'). Loading anyway",
                    saved_for,
                    current_identifier
                );
            }
        }

        self.cache = Some(cache);
        self.history = vec![0; metadata.token_count];
        self.spans_draft = false;
        tracing::info!(
            "Decode cache ({} tokens) loaded from {}",
            metadata.token_count,
            path.display()
        );
        Ok(metadata.token_count)
    }

    /// Remove `n` tokens from the front of the cache; returns the new size
    pub fn trim(&mut self, backend: &B, n: usize) -> Result<usize, CacheError> {
        let cache = self.cache.as_mut().ok_or(CacheError::NoCache)?;
        if !backend.can_trim(cache) {
            tracing::warn!("Current cache type does not support trimming");
            return Err(CacheError::UnsupportedOperation(
                "cache does not support trimming".to_string(),
            ));
        }
        let size = self.history.len();
        if n > size {
            return Err(CacheError::TrimOutOfRange { requested: n, size });
        }

        let trimmed = backend.trim(cache, n, TrimEnd::Front)?;
        if trimmed != n {
            tracing::warn!("Cache trim removed {} of {} requested tokens", trimmed, n);
        }
        self.history.drain(..trimmed.min(size));
        tracing::info!(
            "Trimmed {} tokens. Cache size now: {} tokens",
            trimmed,
            self.history.len()
        );
        Ok(self.history.len())
    }
}
