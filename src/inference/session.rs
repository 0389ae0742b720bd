//! Model session lifecycle
//!
//! [`SessionManager`] owns the current primary model, the optional draft
//! model and the decode cache. Load and unload are serialized by a dedicated
//! lock; the cache sits behind its own mutex and is leased to one request at
//! a time.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::ErrorKind;
use crate::inference::backend::{run_blocking, BackendError, ModelBackend, ModelMetadata};
use crate::inference::cache::{CacheError, CacheManager};
use crate::storage::models::ModelInfo;
use crate::storage::{cache_file_path, StorageError};

/// Errors from loading a model
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Model backend not available")]
    BackendUnavailable,

    #[error("Model or adapter not found: {0}")]
    NotFound(String),

    #[error("Failed to load model: {0}")]
    LoadFailed(String),
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::BackendUnavailable => ErrorKind::BackendUnavailable,
            LoadError::NotFound(_) => ErrorKind::ModelNotFound,
            LoadError::LoadFailed(_) => ErrorKind::LoadFailed,
        }
    }
}

impl From<BackendError> for LoadError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound(what) => LoadError::NotFound(what),
            BackendError::Unavailable(_) => LoadError::BackendUnavailable,
            other => LoadError::LoadFailed(other.to_string()),
        }
    }
}

/// Errors from unloading a model
#[derive(Debug, Error)]
pub enum UnloadError {
    #[error("Backend failed to release model: {0}")]
    BackendFailure(String),
}

impl UnloadError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::LoadFailed
    }
}

/// The loaded primary model
pub struct ModelSession<B: ModelBackend> {
    pub identifier: String,
    pub adapter_path: Option<String>,
    pub model: B::Model,
    pub tokenizer: B::Tokenizer,
    pub metadata: ModelMetadata,
}

impl<B: ModelBackend> ModelSession<B> {
    fn matches(&self, identifier: &str, adapter_path: Option<&str>) -> bool {
        self.identifier == identifier && self.adapter_path.as_deref() == adapter_path
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo::describe(
            &self.identifier,
            self.adapter_path.as_deref(),
            self.metadata.clone(),
        )
    }
}

/// The loaded draft model used for speculative decoding
pub struct DraftSession<B: ModelBackend> {
    pub identifier: String,
    pub model: B::Model,
    pub tokenizer: B::Tokenizer,
}

/// Result of a successful `load`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The same model and adapter were already current
    AlreadyLoaded,
    Loaded,
}

/// Result of activating a draft model
pub enum DraftOutcome<B: ModelBackend> {
    AlreadyLoaded(Arc<DraftSession<B>>),
    /// Newly loaded; the cache was invalidated
    Loaded {
        draft: Arc<DraftSession<B>>,
        vocab_mismatch: bool,
    },
    /// Loading failed; decode without a draft
    Failed(String),
}

/// Exclusive access to the decode cache for one request
pub type CacheLease<B> = OwnedMutexGuard<CacheManager<B>>;

/// Owner of the current model session and decode cache
pub struct SessionManager<B: ModelBackend> {
    backend: Arc<B>,
    load_lock: Mutex<()>,
    current: RwLock<Option<Arc<ModelSession<B>>>>,
    draft: RwLock<Option<Arc<DraftSession<B>>>>,
    cache: Arc<Mutex<CacheManager<B>>>,
    cache_directory: PathBuf,
    last_tps: AtomicU64,
}

impl<B: ModelBackend> SessionManager<B> {
    pub fn new(backend: Arc<B>, cache_directory: PathBuf) -> Self {
        Self {
            backend,
            load_lock: Mutex::new(()),
            current: RwLock::new(None),
            draft: RwLock::new(None),
            cache: Arc::new(Mutex::new(CacheManager::new())),
            cache_directory,
            last_tps: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    /// Load a model, replacing any current one
    pub async fn load(
        &self,
        identifier: &str,
        adapter_path: Option<&str>,
    ) -> Result<LoadOutcome, LoadError> {
        if !self.backend.is_available() {
            return Err(LoadError::BackendUnavailable);
        }
        let _guard = self.load_lock.lock().await;

        if let Some(session) = self.current.read().await.as_ref() {
            if session.matches(identifier, adapter_path) {
                tracing::info!("Model '{}' is already loaded", identifier);
                return Ok(LoadOutcome::AlreadyLoaded);
            }
        }

        if self.current.read().await.is_some() {
            if let Err(e) = self.unload_locked().await {
                tracing::warn!("Unload before switching models failed: {}", e);
            }
        }

        tracing::info!(
            "Loading model '{}' (adapter: {:?})",
            identifier,
            adapter_path
        );
        let started = std::time::Instant::now();

        let backend = self.backend.clone();
        let id = identifier.to_string();
        let adapter = adapter_path.map(str::to_string);
        let loaded = run_blocking(move || {
            let (model, tokenizer) = backend.load(&id, adapter.as_deref())?;
            let metadata = match backend.resolve_metadata(&id) {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::debug!("Metadata lookup failed ({}); using embedded config", e);
                    backend.embedded_metadata(&model)
                }
            };
            Ok::<_, BackendError>((model, tokenizer, metadata))
        })
        .await
        .and_then(|result| result);

        let (model, tokenizer, metadata) = match loaded {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!("Failed to load model '{}': {}", identifier, e);
                self.reset().await;
                return Err(e.into());
            }
        };

        let session = ModelSession {
            identifier: identifier.to_string(),
            adapter_path: adapter_path.map(str::to_string),
            model,
            tokenizer,
            metadata,
        };

        self.cache.lock().await.invalidate();
        *self.draft.write().await = None;
        *self.current.write().await = Some(Arc::new(session));

        tracing::info!(
            "Model '{}' loaded in {:.2}s",
            identifier,
            started.elapsed().as_secs_f64()
        );
        Ok(LoadOutcome::Loaded)
    }

    /// Unload the current model; a no-op when nothing is loaded
    pub async fn unload(&self) -> Result<(), UnloadError> {
        let _guard = self.load_lock.lock().await;
        self.unload_locked().await
    }

    async fn unload_locked(&self) -> Result<(), UnloadError> {
        let Some(identifier) = self.identifier().await else {
            return Ok(());
        };
        tracing::info!("Unloading model '{}'", identifier);

        // Waits for any in-flight decode to give the cache back
        self.reset().await;

        let backend = self.backend.clone();
        let released = run_blocking(move || backend.release())
            .await
            .and_then(|result| result);
        match released {
            Ok(()) => {
                tracing::info!("Model '{}' unloaded", identifier);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Backend failed to release '{}': {}", identifier, e);
                Err(UnloadError::BackendFailure(e.to_string()))
            }
        }
    }

    async fn reset(&self) {
        let mut cache = self.cache.lock().await;
        cache.invalidate();
        *self.draft.write().await = None;
        *self.current.write().await = None;
    }

    /// The current session, if any
    pub async fn session(&self) -> Option<Arc<ModelSession<B>>> {
        self.current.read().await.clone()
    }

    pub async fn is_loaded(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub async fn identifier(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|s| s.identifier.clone())
    }

    /// Identifier and adapter of the current session
    pub async fn loaded_pair(&self) -> Option<(String, Option<String>)> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|s| (s.identifier.clone(), s.adapter_path.clone()))
    }

    pub async fn current_info(&self) -> Option<ModelInfo> {
        let session = self.session().await?;
        run_blocking(move || session.info()).await.ok()
    }

    pub async fn draft(&self) -> Option<Arc<DraftSession<B>>> {
        self.draft.read().await.clone()
    }

    /// Take exclusive ownership of the decode cache
    pub async fn cache_lease(&self) -> CacheLease<B> {
        self.cache.clone().lock_owned().await
    }

    /// Make `identifier` the active draft model.
    ///
    /// The caller holds the cache lease; a newly loaded draft invalidates it
    /// since the cache spans both models.
    pub async fn ensure_draft(
        &self,
        identifier: &str,
        primary: &ModelSession<B>,
        lease: &mut CacheLease<B>,
    ) -> DraftOutcome<B> {
        if let Some(draft) = self.draft.read().await.as_ref() {
            if draft.identifier == identifier {
                return DraftOutcome::AlreadyLoaded(draft.clone());
            }
        }

        tracing::info!("Loading draft model '{}'", identifier);
        let backend = self.backend.clone();
        let id = identifier.to_string();
        let loaded = run_blocking(move || backend.load_draft(&id))
            .await
            .and_then(|result| result);

        let (model, tokenizer) = match loaded {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(
                    "Failed to load draft model '{}': {}. Continuing without speculative decoding",
                    identifier,
                    e
                );
                *self.draft.write().await = None;
                // A failed draft load can discard the backend's decode context
                lease.invalidate();
                return DraftOutcome::Failed(e.to_string());
            }
        };

        let draft_vocab = self.backend.vocab_size(&tokenizer);
        let primary_vocab = self.backend.vocab_size(&primary.tokenizer);
        let vocab_mismatch = draft_vocab != primary_vocab;
        if vocab_mismatch {
            tracing::warn!(
                "Draft model vocab size ({}) differs from main model ({})",
                draft_vocab,
                primary_vocab
            );
        }

        let draft = Arc::new(DraftSession {
            identifier: identifier.to_string(),
            model,
            tokenizer,
        });
        *self.draft.write().await = Some(draft.clone());
        lease.invalidate();

        tracing::info!("Draft model '{}' loaded", identifier);
        DraftOutcome::Loaded {
            draft,
            vocab_mismatch,
        }
    }

    fn cache_path(&self, name: &str) -> Result<PathBuf, CacheError> {
        cache_file_path(&self.cache_directory, name).map_err(|e| match e {
            StorageError::InvalidCacheName(name) => CacheError::InvalidName(name),
            other => CacheError::Io(other),
        })
    }

    /// Persist the cache under `name`; returns the file path and token count
    pub async fn save_cache(&self, name: &str) -> Result<(PathBuf, usize), CacheError> {
        let session = self.session().await.ok_or(CacheError::NoModelLoaded)?;
        let path = self.cache_path(name)?;
        let lease = self.cache_lease().await;

        let backend = self.backend.clone();
        let target = path.clone();
        let count = run_blocking(move || {
            lease.save(
                &*backend,
                &target,
                &session.identifier,
                session.adapter_path.as_deref(),
            )
        })
        .await??;

        tracing::info!("Decode cache saved to {}", path.display());
        Ok((path, count))
    }

    /// Restore the cache saved under `name`; returns the token count
    pub async fn load_cache(&self, name: &str) -> Result<usize, CacheError> {
        let session = self.session().await.ok_or(CacheError::NoModelLoaded)?;
        let path = self.cache_path(name)?;
        let mut lease = self.cache_lease().await;

        let backend = self.backend.clone();
        run_blocking(move || lease.load(&*backend, &path, &session.identifier)).await?
    }

    /// Drop `n` tokens from the front of the cache; returns the new size
    pub async fn trim_cache(&self, n: usize) -> Result<usize, CacheError> {
        if !self.is_loaded().await {
            return Err(CacheError::NoModelLoaded);
        }
        let mut lease = self.cache_lease().await;

        let backend = self.backend.clone();
        run_blocking(move || lease.trim(&*backend, n)).await?
    }

    /// Tokens per second of the most recent generation
    pub fn last_generation_tps(&self) -> f64 {
        f64::from_bits(self.last_tps.load(Ordering::Relaxed))
    }

    pub fn record_generation_tps(&self, tps: f64) {
        self.last_tps.store(tps.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::cache::CacheShape;
    use crate::inference::testing::ScriptedBackend;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn manager_with(backend: ScriptedBackend, dir: &TempDir) -> SessionManager<ScriptedBackend> {
        SessionManager::new(Arc::new(backend), dir.path().to_path_buf())
    }

    async fn prime_cache(manager: &SessionManager<ScriptedBackend>, tokens: &[u32]) {
        let session = manager.session().await.unwrap();
        let mut lease = manager.cache_lease().await;
        let shape = CacheShape {
            model: &session.model,
            draft: None,
            max_size: None,
        };
        lease
            .reconcile(manager.backend(), &shape, tokens)
            .unwrap();
        let (cache, history) = lease.split_mut().unwrap();
        cache.len = history.len();
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(ScriptedBackend::new(), &dir);

        assert_eq!(manager.load("main", None).await.unwrap(), LoadOutcome::Loaded);
        prime_cache(&manager, &[1, 2, 3]).await;

        assert_eq!(
            manager.load("main", None).await.unwrap(),
            LoadOutcome::AlreadyLoaded
        );
        assert_eq!(manager.backend().call_count("load"), 1);
        assert_eq!(manager.cache_lease().await.len(), 3);
    }

    #[tokio::test]
    async fn test_adapter_change_reloads() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(ScriptedBackend::new(), &dir);

        manager.load("main", None).await.unwrap();
        assert_eq!(
            manager.load("main", Some("/adapters/a")).await.unwrap(),
            LoadOutcome::Loaded
        );
        assert_eq!(manager.backend().call_count("load"), 2);
        assert_eq!(manager.backend().call_count("release"), 1);
        assert_eq!(
            manager.loaded_pair().await,
            Some(("main".to_string(), Some("/adapters/a".to_string())))
        );
    }

    #[tokio::test]
    async fn test_switch_clears_cache_and_draft() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(ScriptedBackend::new(), &dir);
        manager.load("main", None).await.unwrap();
        prime_cache(&manager, &[1, 2, 3]).await;

        let session = manager.session().await.unwrap();
        let mut lease = manager.cache_lease().await;
        let outcome = manager.ensure_draft("draft", &session, &mut lease).await;
        assert!(matches!(outcome, DraftOutcome::Loaded { vocab_mismatch: false, .. }));
        assert!(!lease.is_active());
        drop(lease);

        manager.load("other", None).await.unwrap();
        assert!(manager.draft().await.is_none());
        assert!(!manager.cache_lease().await.is_active());
        assert_eq!(manager.identifier().await.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_load_errors_reset_state() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(ScriptedBackend::new(), &dir);
        manager.load("main", None).await.unwrap();

        let err = manager.load("missing", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelNotFound);
        assert!(!manager.is_loaded().await);

        manager.load("main", None).await.unwrap();
        let err = manager.load("broken", None).await.unwrap_err();
        assert!(matches!(err, LoadError::LoadFailed(_)));
        assert!(!manager.is_loaded().await);

        let err = manager
            .load("main", Some("missing-adapter"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(ScriptedBackend::unavailable(), &dir);

        let err = manager.load("main", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(manager.backend().call_count("load"), 0);
    }

    #[tokio::test]
    async fn test_metadata_falls_back_to_embedded() {
        let dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::new();
        backend.fail_metadata.store(true, Ordering::SeqCst);
        let manager = manager_with(backend, &dir);

        manager.load("main", None).await.unwrap();
        let info = manager.current_info().await.unwrap();
        let config = info.config.unwrap();
        assert_eq!(config.model_type.as_deref(), Some("embedded"));
        assert_eq!(config.vocab_size, Some(32000));
    }

    #[tokio::test]
    async fn test_unload() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(ScriptedBackend::new(), &dir);

        manager.unload().await.unwrap();
        assert_eq!(manager.backend().call_count("release"), 0);

        manager.load("main", None).await.unwrap();
        prime_cache(&manager, &[4, 5]).await;
        manager.unload().await.unwrap();

        assert!(!manager.is_loaded().await);
        assert!(manager.current_info().await.is_none());
        assert!(!manager.cache_lease().await.is_active());
        assert_eq!(manager.backend().call_count("release"), 1);
    }

    #[tokio::test]
    async fn test_draft_reuse_and_failure() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(ScriptedBackend::new(), &dir);
        manager.load("main", None).await.unwrap();
        let session = manager.session().await.unwrap();
        let mut lease = manager.cache_lease().await;

        let outcome = manager
            .ensure_draft("small-vocab-draft", &session, &mut lease)
            .await;
        assert!(matches!(outcome, DraftOutcome::Loaded { vocab_mismatch: true, .. }));

        let outcome = manager
            .ensure_draft("small-vocab-draft", &session, &mut lease)
            .await;
        assert!(matches!(outcome, DraftOutcome::AlreadyLoaded(_)));
        assert_eq!(manager.backend().call_count("load_draft"), 1);

        let outcome = manager.ensure_draft("nope", &session, &mut lease).await;
        assert!(matches!(outcome, DraftOutcome::Failed(_)));
        assert!(manager.draft().await.is_none());
    }

    #[tokio::test]
    async fn test_cache_ops_need_model() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(ScriptedBackend::new(), &dir);

        assert!(matches!(
            manager.save_cache("x").await,
            Err(CacheError::NoModelLoaded)
        ));
        assert!(matches!(
            manager.load_cache("x").await,
            Err(CacheError::NoModelLoaded)
        ));
        assert!(matches!(
            manager.trim_cache(1).await,
            Err(CacheError::NoModelLoaded)
        ));
    }

    #[tokio::test]
    async fn test_cache_round_trip_reports_size() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(ScriptedBackend::new(), &dir);
        manager.load("main", None).await.unwrap();
        prime_cache(&manager, &[1, 2, 3, 4, 5, 6]).await;

        let (path, saved) = manager.save_cache("../conversation.bin").await.unwrap();
        assert_eq!(saved, 6);
        assert_eq!(path, dir.path().join("conversation.session"));

        manager.load("other", None).await.unwrap();
        assert_eq!(manager.load_cache("conversation").await.unwrap(), 6);
        assert_eq!(manager.trim_cache(2).await.unwrap(), 4);

        let err = manager.load_cache("absent").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CacheNotFound);
    }

    #[test]
    fn test_tps_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(ScriptedBackend::new(), &dir);
        assert_eq!(manager.last_generation_tps(), 0.0);
        manager.record_generation_tps(42.5);
        assert_eq!(manager.last_generation_tps(), 42.5);
    }
}
