//! llama.cpp model backend
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain
//! raw pointers that are not `Send`, so a dedicated worker thread owns the
//! backend, the loaded models and the decode contexts. [`LlamaCppBackend`]
//! forwards every [`ModelBackend`] call to the worker over a channel and waits
//! for the reply. Decode events come back over a rendezvous channel, so the
//! worker never runs ahead of the consumer.

use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::Utc;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaLoraAdapter, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::logit_bias::LlamaLogitBias;
use llama_cpp_2::token::LlamaToken;

use crate::inference::backend::{
    BackendError, CacheMetadata, DecodeEvent, DecodeRequest, DecodeStream, KvQuantization,
    LogitProcessors, ModelBackend, ModelMetadata, SamplerConfig, TokenId, TrimEnd,
};
use crate::inference::model::{find_gguf_in_dir, read_config_snippet, validate_gguf};
use crate::storage::cache_metadata_path;
use crate::storage::settings::ModelsSection;
use crate::types::{ChatMessage, FinishReason};

/// Tokens per `llama_decode` call
const DEFAULT_BATCH_SIZE: u32 = 512;

/// Smallest context window handed to llama.cpp
const MIN_CONTEXT_SIZE: u32 = 512;

/// Upper bound on draft tokens proposed per step
const MAX_DRAFT_TOKENS: usize = 16;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

fn next_handle_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Runtime settings for the llama.cpp worker
#[derive(Debug, Clone, PartialEq)]
pub struct LlamaSettings {
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Context window for new decode caches
    pub context_size: u32,
    pub batch_size: u32,
}

impl LlamaSettings {
    pub fn from_config(models: &ModelsSection) -> Self {
        Self {
            gpu_layers: models.gpu_layers,
            context_size: models.context_size.max(MIN_CONTEXT_SIZE),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// A model resident on the worker thread
#[derive(Debug, Clone)]
pub struct LlamaModelHandle {
    id: u64,
    path: PathBuf,
    metadata: ModelMetadata,
}

impl LlamaModelHandle {
    /// Resolved GGUF file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Tokenizer facts captured at load time; tokenization itself runs on the worker
#[derive(Debug, Clone)]
pub struct LlamaTokenizerHandle {
    vocab_size: usize,
    has_template: bool,
}

/// The worker's active decode context, identified by id
#[derive(Debug)]
pub struct LlamaCacheHandle {
    id: u64,
}

struct LoadedModel {
    model: LlamaModelHandle,
    tokenizer: LlamaTokenizerHandle,
}

type Reply<T> = Sender<Result<T, BackendError>>;
type EventTx = SyncSender<Result<DecodeEvent, BackendError>>;

/// Owned copy of a decode request for the worker
struct WorkerDecode {
    tokens: Vec<TokenId>,
    max_tokens: usize,
    sampler: SamplerConfig,
    logits: LogitProcessors,
    num_draft_tokens: usize,
    kv_quantization: Option<KvQuantization>,
}

/// Commands sent to the worker thread
enum Command {
    LoadModel {
        path: PathBuf,
        adapter: Option<PathBuf>,
        reply: Reply<LoadedModel>,
    },
    LoadDraft {
        path: PathBuf,
        reply: Reply<LoadedModel>,
    },
    Release {
        reply: Reply<()>,
    },
    Tokenize {
        text: String,
        reply: Reply<Vec<TokenId>>,
    },
    ApplyTemplate {
        messages: Vec<ChatMessage>,
        reply: Reply<String>,
    },
    MakeCache {
        with_draft: bool,
        max_size: Option<usize>,
        reply: Reply<u64>,
    },
    Trim {
        cache_id: u64,
        n: usize,
        end: TrimEnd,
        reply: Reply<usize>,
    },
    SaveCache {
        cache_id: u64,
        path: PathBuf,
        reply: Reply<()>,
    },
    LoadCache {
        path: PathBuf,
        reply: Reply<(u64, usize)>,
    },
    Decode {
        cache_id: u64,
        job: WorkerDecode,
        events: EventTx,
    },
    Shutdown,
}

impl Command {
    /// Answer a command that cannot run in the worker's current state
    fn reject(self, error: BackendError) {
        match self {
            Command::LoadModel { reply, .. } | Command::LoadDraft { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Release { reply } => {
                let _ = reply.send(Err(error));
            }
            Command::Tokenize { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::ApplyTemplate { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::MakeCache { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Trim { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::SaveCache { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::LoadCache { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Decode { events, .. } => {
                let _ = events.send(Err(error));
            }
            Command::Shutdown => {}
        }
    }
}

/// [`ModelBackend`] on llama.cpp
///
/// Uses a dedicated worker thread for all llama-cpp operations since the
/// underlying types are not Send.
pub struct LlamaCppBackend {
    command_tx: Sender<Command>,
    worker_handle: Option<JoinHandle<()>>,
    available: bool,
}

impl LlamaCppBackend {
    /// Spawn the worker and initialize llama.cpp on it
    ///
    /// Initialization failure is not fatal: the backend reports itself as
    /// unavailable and every call fails fast.
    pub fn start(settings: LlamaSettings) -> Self {
        let (command_tx, command_rx) = mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || worker_main(command_rx, ready_tx, settings));

        let (worker_handle, available) = match spawned {
            Ok(handle) => (Some(handle), ready_rx.recv().unwrap_or(false)),
            Err(e) => {
                tracing::error!("Failed to spawn llama.cpp worker thread: {}", e);
                (None, false)
            }
        };

        if available {
            tracing::info!("llama.cpp worker thread started");
        }
        Self {
            command_tx,
            worker_handle,
            available,
        }
    }

    fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, BackendError> {
        let (reply, response) = mpsc::channel();
        self.command_tx
            .send(command(reply))
            .map_err(|_| worker_gone())?;
        response.recv().map_err(|_| worker_gone())?
    }
}

impl Drop for LlamaCppBackend {
    fn drop(&mut self) {
        let _ = self.command_tx.send(Command::Shutdown);
        // Wait for worker thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_gone() -> BackendError {
    BackendError::Unavailable("llama.cpp worker thread stopped".to_string())
}

/// Map an identifier to a GGUF file; a directory resolves to the first GGUF inside it
fn resolve_weights(identifier: &str) -> Result<PathBuf, BackendError> {
    let path = Path::new(identifier);
    if !path.exists() {
        return Err(BackendError::NotFound(format!("Model path not found: {identifier}")));
    }
    let file = if path.is_dir() {
        find_gguf_in_dir(path).ok_or_else(|| {
            BackendError::NotFound(format!("No GGUF weights in {}", path.display()))
        })?
    } else {
        path.to_path_buf()
    };

    validate_gguf(&file).map_err(|e| BackendError::Failed(e.to_string()))?;
    tracing::debug!("GGUF validation passed for {:?}", file);
    Ok(file)
}

impl ModelBackend for LlamaCppBackend {
    type Model = LlamaModelHandle;
    type Tokenizer = LlamaTokenizerHandle;
    type Cache = LlamaCacheHandle;

    fn is_available(&self) -> bool {
        self.available
    }

    fn load(
        &self,
        identifier: &str,
        adapter_path: Option<&str>,
    ) -> Result<(Self::Model, Self::Tokenizer), BackendError> {
        let path = resolve_weights(identifier)?;
        let adapter = match adapter_path {
            Some(adapter) if !Path::new(adapter).exists() => {
                return Err(BackendError::NotFound(format!("Adapter not found: {adapter}")));
            }
            other => other.map(PathBuf::from),
        };

        let loaded = self.request(|reply| Command::LoadModel {
            path,
            adapter,
            reply,
        })?;
        Ok((loaded.model, loaded.tokenizer))
    }

    fn load_draft(&self, identifier: &str) -> Result<(Self::Model, Self::Tokenizer), BackendError> {
        let path = resolve_weights(identifier)?;
        let loaded = self.request(|reply| Command::LoadDraft { path, reply })?;
        Ok((loaded.model, loaded.tokenizer))
    }

    fn release(&self) -> Result<(), BackendError> {
        self.request(|reply| Command::Release { reply })
    }

    fn resolve_metadata(&self, identifier: &str) -> Result<ModelMetadata, BackendError> {
        let metadata = read_config_snippet(Path::new(identifier))
            .map_err(|e| BackendError::NotFound(format!("config.json for {identifier}: {e}")))?;
        if metadata.is_empty() {
            return Err(BackendError::NotFound(format!(
                "config.json for {identifier} has no known fields"
            )));
        }
        Ok(metadata)
    }

    fn embedded_metadata(&self, model: &Self::Model) -> ModelMetadata {
        model.metadata.clone()
    }

    fn vocab_size(&self, tokenizer: &Self::Tokenizer) -> usize {
        tokenizer.vocab_size
    }

    fn tokenize(&self, _tokenizer: &Self::Tokenizer, text: &str) -> Result<Vec<TokenId>, BackendError> {
        let text = text.to_string();
        self.request(|reply| Command::Tokenize { text, reply })
    }

    fn has_chat_template(&self, tokenizer: &Self::Tokenizer) -> bool {
        tokenizer.has_template
    }

    fn apply_chat_template(
        &self,
        _tokenizer: &Self::Tokenizer,
        messages: &[ChatMessage],
    ) -> Result<String, BackendError> {
        let messages = messages.to_vec();
        self.request(|reply| Command::ApplyTemplate { messages, reply })
    }

    fn make_cache(
        &self,
        _model: &Self::Model,
        draft: Option<&Self::Model>,
        max_size: Option<usize>,
    ) -> Result<Self::Cache, BackendError> {
        let id = self.request(|reply| Command::MakeCache {
            with_draft: draft.is_some(),
            max_size,
            reply,
        })?;
        Ok(LlamaCacheHandle { id })
    }

    fn can_trim(&self, _cache: &Self::Cache) -> bool {
        true
    }

    fn trim(&self, cache: &mut Self::Cache, n: usize, end: TrimEnd) -> Result<usize, BackendError> {
        let cache_id = cache.id;
        self.request(|reply| Command::Trim {
            cache_id,
            n,
            end,
            reply,
        })
    }

    fn save_cache(
        &self,
        path: &Path,
        cache: &Self::Cache,
        metadata: &CacheMetadata,
    ) -> Result<(), BackendError> {
        let cache_id = cache.id;
        let target = path.to_path_buf();
        self.request(|reply| Command::SaveCache {
            cache_id,
            path: target,
            reply,
        })?;

        let json = serde_json::to_string_pretty(metadata)
            .map_err(|e| BackendError::Failed(e.to_string()))?;
        fs::write(cache_metadata_path(path), json).map_err(|e| BackendError::Failed(e.to_string()))
    }

    fn load_cache(&self, path: &Path) -> Result<(Self::Cache, CacheMetadata), BackendError> {
        if !path.is_file() {
            return Err(BackendError::NotFound(path.display().to_string()));
        }
        let target = path.to_path_buf();
        let (id, token_count) = self.request(|reply| Command::LoadCache { path: target, reply })?;

        let sidecar = cache_metadata_path(path);
        let metadata = match fs::read_to_string(&sidecar)
            .map_err(|e| e.to_string())
            .and_then(|json| serde_json::from_str::<CacheMetadata>(&json).map_err(|e| e.to_string()))
        {
            Ok(metadata) => CacheMetadata {
                token_count,
                ..metadata
            },
            Err(e) => {
                tracing::warn!("No usable cache metadata at {}: {}", sidecar.display(), e);
                CacheMetadata {
                    model_identifier: None,
                    adapter_path: None,
                    token_count,
                    tool_version: "unknown".to_string(),
                    creation_timestamp: Utc::now(),
                }
            }
        };
        Ok((LlamaCacheHandle { id }, metadata))
    }

    fn decode_stream<'a>(&'a self, request: DecodeRequest<'a, Self>) -> Result<DecodeStream<'a>, BackendError> {
        let (events, stream) = mpsc::sync_channel(0);
        let job = WorkerDecode {
            tokens: request.tokens.to_vec(),
            max_tokens: request.max_tokens,
            sampler: request.sampler.clone(),
            logits: request.logits.clone(),
            num_draft_tokens: if request.draft.is_some() {
                request.num_draft_tokens.min(MAX_DRAFT_TOKENS)
            } else {
                0
            },
            kv_quantization: request.kv_quantization,
        };
        self.command_tx
            .send(Command::Decode {
                cache_id: request.cache.id,
                job,
                events,
            })
            .map_err(|_| worker_gone())?;

        // Dropping the receiver makes the worker's next send fail, which ends the decode
        Ok(Box::new(stream.into_iter()))
    }
}

/// How a model scope ended
enum Flow {
    Exit,
    Released(Reply<()>),
    Switch(Command),
    LoadDraft { path: PathBuf, reply: Reply<LoadedModel> },
}

/// Worker thread main loop
///
/// Owns the LlamaBackend; each loaded model lives for one `serve_model` scope.
fn worker_main(command_rx: Receiver<Command>, ready: Sender<bool>, settings: LlamaSettings) {
    let backend = match LlamaBackend::init() {
        Ok(backend) => {
            tracing::info!("LlamaBackend initialized in worker thread");
            let _ = ready.send(true);
            backend
        }
        Err(e) => {
            tracing::error!("Failed to init backend: {}", e);
            let _ = ready.send(false);
            let reason = e.to_string();
            for command in command_rx.iter() {
                if matches!(command, Command::Shutdown) {
                    break;
                }
                command.reject(BackendError::Unavailable(reason.clone()));
            }
            return;
        }
    };

    let mut pending: Option<Command> = None;
    loop {
        let command = match pending.take() {
            Some(command) => command,
            None => match command_rx.recv() {
                Ok(command) => command,
                Err(_) => {
                    // Channel closed, exit
                    tracing::debug!("Command channel closed, worker exiting");
                    break;
                }
            },
        };

        match command {
            Command::LoadModel {
                path,
                adapter,
                reply,
            } => {
                let (model, mut lora, loaded) =
                    match load_primary(&backend, &path, adapter.as_deref(), &settings) {
                        Ok(parts) => parts,
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            continue;
                        }
                    };
                let _ = reply.send(Ok(loaded));

                let flow = serve_model(&backend, &model, lora.as_mut(), &command_rx, &settings);
                // The adapter must go before the model it was created from
                drop(lora);
                drop(model);
                tracing::info!("Model unloaded in worker thread");

                match flow {
                    Flow::Exit => break,
                    Flow::Released(reply) => {
                        let _ = reply.send(Ok(()));
                    }
                    Flow::Switch(command) => pending = Some(command),
                    Flow::LoadDraft { reply, .. } => {
                        let _ = reply.send(Err(BackendError::Failed("No model loaded".to_string())));
                    }
                }
            }
            Command::Release { reply } => {
                let _ = reply.send(Ok(()));
            }
            Command::Shutdown => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            other => other.reject(BackendError::Failed("No model loaded".to_string())),
        }
    }
}

/// Serve commands for one primary model; draft loads restart the inner scope
fn serve_model(
    backend: &LlamaBackend,
    model: &LlamaModel,
    mut lora: Option<&mut LlamaLoraAdapter>,
    command_rx: &Receiver<Command>,
    settings: &LlamaSettings,
) -> Flow {
    let mut draft: Option<LlamaModel> = None;
    loop {
        match run_scope(
            backend,
            model,
            draft.as_ref(),
            lora.as_deref_mut(),
            command_rx,
            settings,
        ) {
            Flow::LoadDraft { path, reply } => {
                draft = None;
                match load_draft_model(backend, &path, settings) {
                    Ok((draft_model, loaded)) => {
                        tracing::info!("Draft model loaded: {}", path.display());
                        draft = Some(draft_model);
                        let _ = reply.send(Ok(loaded));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            other => return other,
        }
    }
}

/// Serve commands with a fixed (primary, draft) pair; owns the decode context
fn run_scope<'m>(
    backend: &LlamaBackend,
    model: &'m LlamaModel,
    draft: Option<&'m LlamaModel>,
    mut lora: Option<&mut LlamaLoraAdapter>,
    command_rx: &Receiver<Command>,
    settings: &LlamaSettings,
) -> Flow {
    let mut cache: Option<WorkerCache<'m>> = None;

    loop {
        let Ok(command) = command_rx.recv() else {
            return Flow::Exit;
        };

        match command {
            Command::Tokenize { text, reply } => {
                let _ = reply.send(tokenize(model, &text));
            }
            Command::ApplyTemplate { messages, reply } => {
                let _ = reply.send(apply_template(model, &messages));
            }
            Command::MakeCache {
                with_draft,
                max_size,
                reply,
            } => {
                // Free the old context first
                cache = None;
                let draft = draft.filter(|_| with_draft);
                match WorkerCache::new(backend, model, draft, max_size, lora.as_deref_mut(), settings) {
                    Ok(created) => {
                        let _ = reply.send(Ok(created.id));
                        cache = Some(created);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Trim {
                cache_id,
                n,
                end,
                reply,
            } => {
                let result = active(&mut cache, cache_id).and_then(|c| c.trim(n, end));
                let _ = reply.send(result);
            }
            Command::SaveCache {
                cache_id,
                path,
                reply,
            } => {
                let result = active(&mut cache, cache_id).and_then(|c| c.save(&path));
                let _ = reply.send(result);
            }
            Command::LoadCache { path, reply } => {
                cache = None;
                let restored = WorkerCache::new(backend, model, draft, None, lora.as_deref_mut(), settings)
                    .and_then(|mut created| created.restore(&path).map(|len| (created, len)));
                match restored {
                    Ok((created, len)) => {
                        let _ = reply.send(Ok((created.id, len)));
                        cache = Some(created);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Decode {
                cache_id,
                job,
                events,
            } => match active(&mut cache, cache_id) {
                Ok(current) => {
                    if let Err(e) = current.decode(model, draft, job, &events) {
                        tracing::error!("Decode failed: {}", e);
                        let _ = events.send(Err(e));
                    }
                }
                Err(e) => {
                    let _ = events.send(Err(e));
                }
            },
            command @ Command::LoadModel { .. } => return Flow::Switch(command),
            Command::LoadDraft { path, reply } => return Flow::LoadDraft { path, reply },
            Command::Release { reply } => return Flow::Released(reply),
            Command::Shutdown => {
                tracing::info!("Worker thread shutting down");
                return Flow::Exit;
            }
        }
    }
}

fn active<'c, 'm>(
    cache: &'c mut Option<WorkerCache<'m>>,
    cache_id: u64,
) -> Result<&'c mut WorkerCache<'m>, BackendError> {
    match cache.as_mut() {
        Some(cache) if cache.id == cache_id => Ok(cache),
        Some(_) => Err(BackendError::Failed("Stale cache handle".to_string())),
        None => Err(BackendError::Failed("No decode context".to_string())),
    }
}

fn load_primary(
    backend: &LlamaBackend,
    path: &Path,
    adapter: Option<&Path>,
    settings: &LlamaSettings,
) -> Result<(LlamaModel, Option<LlamaLoraAdapter>, LoadedModel), BackendError> {
    let model_params = LlamaModelParams::default().with_n_gpu_layers(settings.gpu_layers);
    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| BackendError::Failed(format!("Failed to load model: {e}")))?;

    let lora = match adapter {
        Some(adapter) => Some(
            model
                .lora_adapter_init(adapter)
                .map_err(|e| BackendError::Failed(format!("Failed to load adapter: {e}")))?,
        ),
        None => None,
    };

    let loaded = describe(&model, path);
    tracing::info!(
        "Model loaded: {} ({} vocab, {} ctx)",
        path.display(),
        loaded.tokenizer.vocab_size,
        model.n_ctx_train()
    );
    Ok((model, lora, loaded))
}

fn load_draft_model(
    backend: &LlamaBackend,
    path: &Path,
    settings: &LlamaSettings,
) -> Result<(LlamaModel, LoadedModel), BackendError> {
    let model_params = LlamaModelParams::default().with_n_gpu_layers(settings.gpu_layers);
    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| BackendError::Failed(format!("Failed to load draft model: {e}")))?;
    let loaded = describe(&model, path);
    Ok((model, loaded))
}

fn describe(model: &LlamaModel, path: &Path) -> LoadedModel {
    LoadedModel {
        model: LlamaModelHandle {
            id: next_handle_id(),
            path: path.to_path_buf(),
            metadata: gguf_metadata(model),
        },
        tokenizer: LlamaTokenizerHandle {
            vocab_size: model.n_vocab().max(0) as usize,
            has_template: model.chat_template(None).is_ok(),
        },
    }
}

/// Config snippet from the GGUF key/value header
fn gguf_metadata(model: &LlamaModel) -> ModelMetadata {
    let architecture = model.meta_val_str("general.architecture").ok();
    let block_count = architecture
        .as_deref()
        .and_then(|arch| model.meta_val_str(&format!("{arch}.block_count")).ok())
        .and_then(|count| count.parse::<u64>().ok());

    ModelMetadata {
        model_type: architecture,
        hidden_size: Some(model.n_embd().max(0) as u64),
        num_hidden_layers: block_count,
        vocab_size: Some(model.n_vocab().max(0) as u64),
        quantization: model
            .meta_val_str("general.file_type")
            .ok()
            .map(|file_type| serde_json::json!({ "file_type": file_type })),
    }
}

fn tokenize(model: &LlamaModel, text: &str) -> Result<Vec<TokenId>, BackendError> {
    let tokens = model
        .str_to_token(text, AddBos::Always)
        .map_err(|e| BackendError::Failed(format!("Failed to tokenize: {e}")))?;
    Ok(tokens.into_iter().map(|t| t.0 as TokenId).collect())
}

fn apply_template(model: &LlamaModel, messages: &[ChatMessage]) -> Result<String, BackendError> {
    let template = model
        .chat_template(None)
        .map_err(|e| BackendError::Failed(format!("Failed to load chat template: {e}")))?;
    let chat = messages
        .iter()
        .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BackendError::Failed(format!("Failed to build chat message: {e}")))?;
    model
        .apply_chat_template(&template, &chat, true)
        .map_err(|e| BackendError::Failed(format!("Failed to apply chat template: {e}")))
}

fn kv_error(e: impl std::fmt::Display) -> BackendError {
    BackendError::Failed(format!("KV cache operation failed: {e}"))
}

/// Remove cache positions `[p0, p1)` of sequence 0
fn clear_positions(ctx: &mut LlamaContext, p0: usize, p1: Option<usize>) -> Result<(), BackendError> {
    let removed = ctx
        .clear_kv_cache_seq(Some(0), Some(p0 as u32), p1.map(|p| p as u32))
        .map_err(kv_error)?;
    if removed {
        Ok(())
    } else {
        Err(BackendError::Unsupported(
            "partial KV cache removal not supported by this model".to_string(),
        ))
    }
}

/// Decode `tokens` at positions starting from `start`.
///
/// Returns the logits index of the last token within the final batch.
fn feed(
    ctx: &mut LlamaContext,
    start: usize,
    tokens: &[LlamaToken],
    batch_size: usize,
    all_logits: bool,
) -> Result<i32, BackendError> {
    let mut batch = LlamaBatch::new(batch_size, 1);
    let mut position = start;
    let mut last_index = 0;

    for chunk in tokens.chunks(batch_size.max(1)) {
        batch.clear();
        for (i, token) in chunk.iter().enumerate() {
            let is_last = position + 1 == start + tokens.len();
            batch
                .add(*token, position as i32, &[0], all_logits || is_last)
                .map_err(|e| BackendError::Decode(format!("Failed to add token to batch: {e}")))?;
            position += 1;
            last_index = i as i32;
        }
        ctx.decode(&mut batch)
            .map_err(|e| BackendError::Decode(format!("Failed to decode: {e}")))?;
    }
    Ok(last_index)
}

fn build_sampler(model: &LlamaModel, config: &SamplerConfig, logits: &LogitProcessors) -> LlamaSampler {
    let mut stages = Vec::new();

    if !logits.logit_bias.is_empty() {
        let biases: Vec<LlamaLogitBias> = logits
            .logit_bias
            .iter()
            .map(|(token, bias)| LlamaLogitBias::new(LlamaToken::new(*token as i32), *bias))
            .collect();
        stages.push(LlamaSampler::logit_bias(model.n_vocab(), &biases));
    }
    if let Some(penalty) = logits.repetition_penalty {
        stages.push(LlamaSampler::penalties(
            logits.repetition_context_size as i32,
            penalty,
            0.0,
            0.0,
        ));
    }

    if config.temperature <= 0.0 {
        // Greedy sampling for zero temperature
        stages.push(LlamaSampler::greedy());
    } else {
        let keep = config.min_tokens_to_keep.max(1) as usize;
        let seed = config.seed as u32;
        if config.top_k > 0 {
            stages.push(LlamaSampler::top_k(config.top_k as i32));
        }
        stages.push(LlamaSampler::top_p(config.top_p, keep));
        if config.min_p > 0.0 {
            stages.push(LlamaSampler::min_p(config.min_p, keep));
        }
        if config.xtc_probability > 0.0 {
            stages.push(LlamaSampler::xtc(
                config.xtc_probability,
                config.xtc_threshold,
                keep,
                seed,
            ));
        }
        stages.push(LlamaSampler::temp(config.temperature));
        stages.push(LlamaSampler::dist(seed));
    }

    LlamaSampler::chain_simple(stages)
}

/// Accumulates token bytes and releases only complete UTF-8 text
#[derive(Debug, Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            // Incomplete sequence at the end: keep it for the next token
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => self.flush(),
        }
    }

    fn flush(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Running state of one decode on the worker
struct DecodeRun<'e> {
    events: &'e EventTx,
    started: Instant,
    generated: usize,
    max_tokens: usize,
    text: Utf8Stream,
}

/// What happened to an emitted token
enum Emitted {
    Continue,
    Finished,
    Disconnected,
}

impl DecodeRun<'_> {
    fn emit(&mut self, model: &LlamaModel, token: LlamaToken, from_draft: bool) -> Result<Emitted, BackendError> {
        self.generated += 1;
        let end_of_generation = model.is_eog_token(token);
        let finish_reason = if end_of_generation {
            Some(FinishReason::Stop)
        } else if self.generated >= self.max_tokens {
            Some(FinishReason::Length)
        } else {
            None
        };

        let text = if end_of_generation {
            self.text.flush()
        } else {
            let bytes = model
                .token_to_bytes(token, Special::Tokenize)
                .map_err(|e| BackendError::Decode(format!("Failed to convert token to bytes: {e}")))?;
            let mut text = self.text.push(&bytes);
            if finish_reason.is_some() {
                text.push_str(&self.text.flush());
            }
            text
        };

        let elapsed = self.started.elapsed().as_secs_f64();
        let event = DecodeEvent {
            text,
            token: token.0 as TokenId,
            finish_reason,
            tokens_per_second: if elapsed > 0.0 {
                self.generated as f64 / elapsed
            } else {
                0.0
            },
            from_draft,
        };

        if self.events.send(Ok(event)).is_err() {
            tracing::debug!("Receiver dropped, stopping generation");
            return Ok(Emitted::Disconnected);
        }
        Ok(if finish_reason.is_some() {
            Emitted::Finished
        } else {
            Emitted::Continue
        })
    }
}

/// Decode contexts for the primary and optional draft model plus the tokens
/// they hold
struct WorkerCache<'m> {
    id: u64,
    main: LlamaContext<'m>,
    draft: Option<LlamaContext<'m>>,
    /// Tokens encoded in `main`, in position order
    tokens: Vec<LlamaToken>,
    /// Length of the prefix of `tokens` also encoded in `draft`
    draft_len: usize,
    n_ctx: usize,
    batch_size: usize,
}

impl<'m> WorkerCache<'m> {
    fn new(
        backend: &LlamaBackend,
        model: &'m LlamaModel,
        draft: Option<&'m LlamaModel>,
        max_size: Option<usize>,
        lora: Option<&mut LlamaLoraAdapter>,
        settings: &LlamaSettings,
    ) -> Result<Self, BackendError> {
        let n_ctx = max_size
            .map(|max| (max.min(settings.context_size as usize)) as u32)
            .unwrap_or(settings.context_size)
            .max(MIN_CONTEXT_SIZE);
        let params = || {
            LlamaContextParams::default()
                .with_n_ctx(NonZeroU32::new(n_ctx))
                .with_n_batch(settings.batch_size)
        };

        let mut main = model
            .new_context(backend, params())
            .map_err(|e| BackendError::Failed(format!("Failed to create context: {e}")))?;
        if let Some(adapter) = lora {
            main.lora_adapter_set(adapter, 1.0)
                .map_err(|e| BackendError::Failed(format!("Failed to apply adapter: {e}")))?;
        }
        let draft = match draft {
            Some(draft) => Some(draft.new_context(backend, params()).map_err(|e| {
                BackendError::Failed(format!("Failed to create draft context: {e}"))
            })?),
            None => None,
        };

        tracing::debug!("Created decode context ({} tokens, draft: {})", n_ctx, draft.is_some());
        Ok(Self {
            id: next_handle_id(),
            main,
            draft,
            tokens: Vec::new(),
            draft_len: 0,
            n_ctx: n_ctx as usize,
            batch_size: settings.batch_size as usize,
        })
    }

    /// Drop everything from position `keep` onwards
    fn truncate(&mut self, keep: usize) -> Result<(), BackendError> {
        if keep < self.tokens.len() {
            clear_positions(&mut self.main, keep, None)?;
            self.tokens.truncate(keep);
        }
        if self.draft_len > keep {
            if let Some(draft) = self.draft.as_mut() {
                clear_positions(draft, keep, None)?;
            }
            self.draft_len = keep;
        }
        Ok(())
    }

    fn trim(&mut self, n: usize, end: TrimEnd) -> Result<usize, BackendError> {
        let n = n.min(self.tokens.len());
        if n == 0 {
            return Ok(0);
        }
        match end {
            TrimEnd::Back => self.truncate(self.tokens.len() - n)?,
            TrimEnd::Front => {
                clear_positions(&mut self.main, 0, Some(n))?;
                self.main
                    .kv_cache_seq_add(0, Some(n as u32), None, -(n as i32))
                    .map_err(kv_error)?;
                self.tokens.drain(..n);
                // The draft resyncs from scratch on the next speculative step
                if let Some(draft) = self.draft.as_mut() {
                    draft.clear_kv_cache();
                }
                self.draft_len = 0;
            }
        }
        Ok(n)
    }

    fn save(&self, path: &Path) -> Result<(), BackendError> {
        self.main
            .save_session_file(path, &self.tokens)
            .map_err(|e| BackendError::Failed(format!("Failed to save session: {e}")))
    }

    fn restore(&mut self, path: &Path) -> Result<usize, BackendError> {
        self.tokens = self
            .main
            .load_session_file(path, self.n_ctx)
            .map_err(|e| BackendError::Failed(format!("Failed to load session: {e}")))?;
        self.draft_len = 0;
        Ok(self.tokens.len())
    }

    /// Append tokens to the main context
    fn extend(&mut self, tokens: &[LlamaToken], all_logits: bool) -> Result<i32, BackendError> {
        if self.tokens.len() + tokens.len() > self.n_ctx {
            return Err(BackendError::Decode(format!(
                "Context window of {} tokens exceeded",
                self.n_ctx
            )));
        }
        let index = feed(&mut self.main, self.tokens.len(), tokens, self.batch_size, all_logits)?;
        self.tokens.extend_from_slice(tokens);
        Ok(index)
    }

    fn decode(
        &mut self,
        model: &LlamaModel,
        draft_model: Option<&LlamaModel>,
        job: WorkerDecode,
        events: &EventTx,
    ) -> Result<(), BackendError> {
        if let Some(quantization) = job.kv_quantization {
            tracing::debug!(
                "KV cache quantization to {} bits is not applied by the llama.cpp backend",
                quantization.bits
            );
        }

        let mut input: Vec<LlamaToken> = job
            .tokens
            .iter()
            .map(|t| LlamaToken::new(*t as i32))
            .collect();
        if input.is_empty() {
            // Full reuse: re-encode the last token to get fresh logits
            let last = *self
                .tokens
                .last()
                .ok_or_else(|| BackendError::Decode("Nothing to decode".to_string()))?;
            self.truncate(self.tokens.len() - 1)?;
            input.push(last);
        }

        let mut index = self.extend(&input, false)?;
        let mut sampler = build_sampler(model, &job.sampler, &job.logits);
        let mut draft_sampler = LlamaSampler::greedy();
        let speculative = job.num_draft_tokens > 0 && self.draft.is_some() && draft_model.is_some();

        let mut run = DecodeRun {
            events,
            started: Instant::now(),
            generated: 0,
            max_tokens: job.max_tokens,
            text: Utf8Stream::default(),
        };

        while run.generated < run.max_tokens {
            let token = sampler.sample(&self.main, index);
            sampler.accept(token);

            let budget = run.max_tokens - run.generated - 1;
            if !speculative || budget == 0 || model.is_eog_token(token) {
                // Encode before emitting so every delivered token is in the context
                let next = self.extend(&[token], false)?;
                match run.emit(model, token, false)? {
                    Emitted::Continue => index = next,
                    Emitted::Finished => return Ok(()),
                    Emitted::Disconnected => {
                        self.truncate(self.tokens.len() - 1)?;
                        return Ok(());
                    }
                }
                continue;
            }

            // Draft proposes, main verifies the whole run in one batch
            let proposals = self.propose(token, job.num_draft_tokens.min(budget), &mut draft_sampler)?;
            let base = self.tokens.len();
            let mut batch = Vec::with_capacity(proposals.len() + 1);
            batch.push(token);
            batch.extend_from_slice(&proposals);
            self.extend(&batch, true)?;

            let mut accepted = 0;
            for (i, proposal) in proposals.iter().enumerate() {
                let verified = sampler.sample(&self.main, i as i32);
                if verified != *proposal {
                    break;
                }
                sampler.accept(verified);
                accepted += 1;
            }
            self.truncate(base + 1 + accepted)?;
            index = accepted as i32;

            let emitted_tokens = std::iter::once((token, false))
                .chain(proposals[..accepted].iter().map(|t| (*t, true)));
            for (delivered, (emitted, from_draft)) in emitted_tokens.enumerate() {
                match run.emit(model, emitted, from_draft)? {
                    Emitted::Continue => {}
                    Emitted::Finished => {
                        self.truncate(base + delivered + 1)?;
                        return Ok(());
                    }
                    Emitted::Disconnected => {
                        self.truncate(base + delivered)?;
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Bring the draft context up to date, then propose `count` tokens after `pending`
    fn propose(
        &mut self,
        pending: LlamaToken,
        count: usize,
        greedy: &mut LlamaSampler,
    ) -> Result<Vec<LlamaToken>, BackendError> {
        let Some(draft) = self.draft.as_mut() else {
            return Ok(Vec::new());
        };
        if self.tokens.len() + 1 + count > self.n_ctx {
            return Ok(Vec::new());
        }

        let mut catch_up = self.tokens[self.draft_len..].to_vec();
        catch_up.push(pending);
        let mut index = feed(draft, self.draft_len, &catch_up, self.batch_size, false)?;
        let mut position = self.draft_len + catch_up.len();

        let mut proposals = Vec::with_capacity(count);
        for i in 0..count {
            let proposal = greedy.sample(draft, index);
            greedy.accept(proposal);
            proposals.push(proposal);
            if i + 1 < count {
                index = feed(draft, position, &[proposal], self.batch_size, false)?;
                position += 1;
            }
        }
        self.draft_len = position;
        Ok(proposals)
    }
}
