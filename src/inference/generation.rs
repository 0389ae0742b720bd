//! Generation orchestration
//!
//! Runs one request through the per-request state machine:
//! `ResolvingPrompt -> ReconcilingCache -> (LoadingDraft) -> Decoding ->
//! Finished | Errored`, turning backend decode events into [`TokenChunk`]s.
//!
//! Every request produces exactly one terminal chunk unless the client went
//! away first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::ErrorKind;
use crate::inference::backend::{
    run_blocking, BackendError, DecodeRequest, KvQuantization, LogitProcessors, ModelBackend,
    SamplerConfig, TokenId,
};
use crate::inference::cache::{CacheError, CacheManager, CacheShape, Reconciled};
use crate::inference::session::{CacheLease, DraftOutcome, DraftSession, ModelSession, SessionManager};
use crate::storage::settings::GenerationSection;
use crate::types::request::{
    bias_value, DEFAULT_KV_GROUP_SIZE, DEFAULT_QUANTIZED_KV_START,
};
use crate::types::{FinishReason, GenerationRequest, PromptSource, RequestError, TokenChunk};

/// Errors that end a generation with an error chunk
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Model backend not available.")]
    BackendUnavailable,

    #[error("No model loaded.")]
    NoModelLoaded,

    #[error("Generation failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Generation failed: {0}")]
    Cache(#[from] CacheError),
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::Request(e) => e.kind(),
            GenerationError::BackendUnavailable => ErrorKind::BackendUnavailable,
            GenerationError::NoModelLoaded => ErrorKind::NoModelLoaded,
            GenerationError::Backend(BackendError::Decode(_)) => ErrorKind::DecodeFailure,
            GenerationError::Backend(e) => e.kind(),
            GenerationError::Cache(e) => e.kind(),
        }
    }
}

/// Per-request orchestration state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    ResolvingPrompt,
    ReconcilingCache,
    LoadingDraft,
    Decoding,
    Finished,
    Errored,
}

/// What happened during one request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSummary {
    pub state: GenerationState,
    /// Tokens in the resolved prompt
    pub prompt_tokens: usize,
    /// Prompt tokens actually fed to the backend
    pub processed_tokens: usize,
    pub generated_tokens: usize,
    pub tokens_per_second: f64,
    /// The client disconnected or the stop flag was raised
    pub cancelled: bool,
    pub duration: Duration,
}

/// Sending half of a chunk stream that lets at most one terminal chunk through
#[derive(Clone)]
pub struct ChunkSink {
    tx: mpsc::Sender<TokenChunk>,
    terminated: Arc<AtomicBool>,
}

impl ChunkSink {
    pub fn new(tx: mpsc::Sender<TokenChunk>) -> Self {
        Self {
            tx,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    fn admit(&self, chunk: &TokenChunk) -> bool {
        if chunk.is_finished {
            !self.terminated.swap(true, Ordering::SeqCst)
        } else {
            !self.terminated.load(Ordering::SeqCst)
        }
    }

    /// Send from async code; false if the chunk was not delivered
    pub async fn send(&self, chunk: TokenChunk) -> bool {
        self.admit(&chunk) && self.tx.send(chunk).await.is_ok()
    }

    /// Send from the blocking pool; false if the chunk was not delivered
    pub fn send_blocking(&self, chunk: TokenChunk) -> bool {
        self.admit(&chunk) && self.tx.blocking_send(chunk).is_ok()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// The receiving side is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Counters carried through a request
struct Progress {
    state: GenerationState,
    prompt_tokens: usize,
    processed_tokens: usize,
    generated_tokens: usize,
    tokens_per_second: f64,
    cancelled: bool,
}

impl Progress {
    fn transition(&mut self, next: GenerationState) {
        tracing::debug!("Generation state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Outcome of the blocking decode loop
#[derive(Default)]
struct DecodeTally {
    generated: usize,
    tokens_per_second: f64,
    cancelled: bool,
}

/// Everything the blocking decode needs, owned
struct DecodeJob<B: ModelBackend> {
    session: Arc<ModelSession<B>>,
    draft: Option<Arc<DraftSession<B>>>,
    to_process: Vec<TokenId>,
    max_tokens: usize,
    prompt_tokens: usize,
    sampler: SamplerConfig,
    logits: LogitProcessors,
    num_draft_tokens: usize,
    kv_quantization: Option<KvQuantization>,
    stop_strings: Vec<String>,
}

/// Drives generation requests against the session manager
pub struct Generator<B: ModelBackend> {
    sessions: Arc<SessionManager<B>>,
    defaults: GenerationSection,
}

impl<B: ModelBackend> Generator<B> {
    pub fn new(sessions: Arc<SessionManager<B>>, defaults: GenerationSection) -> Self {
        Self { sessions, defaults }
    }

    pub fn sessions(&self) -> &Arc<SessionManager<B>> {
        &self.sessions
    }

    /// Run one request, streaming chunks into `tx`.
    ///
    /// Raising `stop` (or dropping the receiver) cancels decoding after the
    /// current token; tokens already decoded stay in the cache history.
    pub async fn generate(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<TokenChunk>,
        stop: Arc<AtomicBool>,
    ) -> GenerationSummary {
        let started = Instant::now();
        let sink = ChunkSink::new(tx);
        let mut progress = Progress {
            state: GenerationState::ResolvingPrompt,
            prompt_tokens: 0,
            processed_tokens: 0,
            generated_tokens: 0,
            tokens_per_second: 0.0,
            cancelled: false,
        };

        match self.run(request, &sink, &stop, &mut progress).await {
            Ok(()) => progress.transition(GenerationState::Finished),
            Err(e) => {
                match &e {
                    GenerationError::Request(_) => tracing::error!("Config error during generation: {}", e),
                    _ => tracing::error!("Error during generation stream: {}", e),
                }
                progress.transition(GenerationState::Errored);
                sink.send(TokenChunk::error(e.to_string())).await;
            }
        }

        let duration = started.elapsed();
        tracing::info!(
            "Stream generation took {:.2}s. Processed {} prompt tokens, generated {} tokens",
            duration.as_secs_f64(),
            progress.processed_tokens,
            progress.generated_tokens
        );

        GenerationSummary {
            state: progress.state,
            prompt_tokens: progress.prompt_tokens,
            processed_tokens: progress.processed_tokens,
            generated_tokens: progress.generated_tokens,
            tokens_per_second: progress.tokens_per_second,
            cancelled: progress.cancelled,
            duration,
        }
    }

    async fn run(
        &self,
        request: GenerationRequest,
        sink: &ChunkSink,
        stop: &Arc<AtomicBool>,
        progress: &mut Progress,
    ) -> Result<(), GenerationError> {
        request.validate()?;
        if !self.sessions.is_available() {
            return Err(GenerationError::BackendUnavailable);
        }
        let session = self
            .sessions
            .session()
            .await
            .ok_or(GenerationError::NoModelLoaded)?;

        let request = Arc::new(request);
        let prompt = self.resolve_prompt(&session, &request).await?;
        progress.prompt_tokens = prompt.len();

        progress.transition(GenerationState::ReconcilingCache);
        let max_size = request
            .kv_cache_options
            .as_ref()
            .and_then(|o| o.max_size)
            .map(|n| n as usize);
        let lease = self.sessions.cache_lease().await;
        let current_draft = match request.speculative_draft() {
            Some(_) => self.sessions.draft().await,
            None => None,
        };
        let (mut lease, mut reconciled) = self
            .reconcile(lease, &session, current_draft, &prompt, max_size)
            .await?;

        let mut active_draft = None;
        if let Some(draft_id) = request.speculative_draft() {
            progress.transition(GenerationState::LoadingDraft);
            match self.sessions.ensure_draft(draft_id, &session, &mut lease).await {
                DraftOutcome::AlreadyLoaded(draft) => active_draft = Some(draft),
                DraftOutcome::Loaded { draft, .. } => {
                    // The cache now spans both models
                    progress.transition(GenerationState::ReconcilingCache);
                    let (relet, again) = self
                        .reconcile(lease, &session, Some(draft.clone()), &prompt, max_size)
                        .await?;
                    lease = relet;
                    reconciled = again;
                    active_draft = Some(draft);
                }
                DraftOutcome::Failed(_) => {
                    progress.transition(GenerationState::ReconcilingCache);
                    let (relet, again) = self
                        .reconcile(lease, &session, None, &prompt, max_size)
                        .await?;
                    lease = relet;
                    reconciled = again;
                }
            }
        }

        progress.transition(GenerationState::Decoding);
        progress.processed_tokens = reconciled.to_process.len();
        tracing::info!(
            "Decoding with {} effective prompt tokens (of {}){}",
            reconciled.to_process.len(),
            prompt.len(),
            if active_draft.is_some() { ", speculative" } else { "" }
        );

        let max_tokens = request
            .max_tokens
            .unwrap_or(self.defaults.default_max_tokens) as usize;
        let job = DecodeJob {
            session,
            num_draft_tokens: if active_draft.is_some() {
                request.draft_token_count() as usize
            } else {
                0
            },
            draft: active_draft,
            to_process: reconciled.to_process,
            max_tokens,
            prompt_tokens: prompt.len(),
            sampler: sampler_config(&request, &self.defaults),
            logits: logit_processors(&request, &self.defaults),
            kv_quantization: kv_quantization(&request),
            stop_strings: request
                .extra_eos_tokens
                .iter()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect(),
        };

        let backend = self.sessions.backend().clone();
        let decode_sink = sink.clone();
        let decode_stop = stop.clone();
        let (tally, result) = run_blocking(move || {
            decode(&*backend, lease, job, &decode_sink, &decode_stop)
        })
        .await?;

        progress.generated_tokens = tally.generated;
        progress.tokens_per_second = tally.tokens_per_second;
        progress.cancelled = tally.cancelled;
        self.sessions.record_generation_tps(tally.tokens_per_second);
        result?;

        if tally.cancelled {
            tracing::info!("Generation cancelled after {} tokens", tally.generated);
            return Ok(());
        }

        if !sink.is_terminated() {
            let reason = if tally.generated >= max_tokens {
                tracing::info!("Generation finished: max_tokens ({}) reached", max_tokens);
                FinishReason::Length
            } else {
                tracing::debug!("Decode stream ended early without a finish reason");
                FinishReason::Stop
            };
            sink.send(TokenChunk {
                prompt_tokens: Some(prompt.len()),
                generation_tokens: Some(tally.generated),
                generation_tps: Some(tally.tokens_per_second),
                ..TokenChunk::finished(reason)
            })
            .await;
        }
        Ok(())
    }

    async fn resolve_prompt(
        &self,
        session: &Arc<ModelSession<B>>,
        request: &Arc<GenerationRequest>,
    ) -> Result<Vec<TokenId>, GenerationError> {
        let backend = self.sessions.backend().clone();
        let session = session.clone();
        let request = request.clone();

        run_blocking(move || {
            let template = backend.has_chat_template(&session.tokenizer);
            let text = match request.prompt_source(template)? {
                PromptSource::Messages(messages) => {
                    backend.apply_chat_template(&session.tokenizer, messages)?
                }
                PromptSource::Text(text) => text.into_owned(),
            };
            let tokens = backend.tokenize(&session.tokenizer, &text)?;
            if tokens.is_empty() {
                return Err(RequestError::OutOfRange {
                    field: "prompt",
                    detail: "prompt produced no tokens".to_string(),
                }
                .into());
            }
            Ok(tokens)
        })
        .await?
    }

    async fn reconcile(
        &self,
        mut lease: CacheLease<B>,
        session: &Arc<ModelSession<B>>,
        draft: Option<Arc<DraftSession<B>>>,
        prompt: &[TokenId],
        max_size: Option<usize>,
    ) -> Result<(CacheLease<B>, Reconciled), GenerationError> {
        let backend = self.sessions.backend().clone();
        let session = session.clone();
        let prompt = prompt.to_vec();

        let (lease, reconciled) = run_blocking(move || {
            let shape = CacheShape {
                model: &session.model,
                draft: draft.as_ref().map(|d| &d.model),
                max_size,
            };
            let reconciled = lease.reconcile(&*backend, &shape, &prompt);
            (lease, reconciled)
        })
        .await?;
        Ok((lease, reconciled?))
    }
}

/// Blocking decode loop; owns the cache lease until the stream ends
fn decode<B: ModelBackend>(
    backend: &B,
    mut lease: CacheLease<B>,
    job: DecodeJob<B>,
    sink: &ChunkSink,
    stop: &AtomicBool,
) -> (DecodeTally, Result<(), GenerationError>) {
    let mut tally = DecodeTally::default();
    let result = stream_tokens(backend, &mut lease, &job, sink, stop, &mut tally);
    if let Err(e) = &result {
        // The history may claim tokens the backend never encoded
        tracing::warn!("Discarding decode cache after failed decode: {}", e);
        lease.invalidate();
    }
    (tally, result)
}

fn stream_tokens<B: ModelBackend>(
    backend: &B,
    manager: &mut CacheManager<B>,
    job: &DecodeJob<B>,
    sink: &ChunkSink,
    stop: &AtomicBool,
    tally: &mut DecodeTally,
) -> Result<(), GenerationError> {
    let (cache, history) = manager.split_mut().ok_or(CacheError::NoCache)?;

    let request = DecodeRequest::<B> {
        model: &job.session.model,
        tokenizer: &job.session.tokenizer,
        tokens: &job.to_process,
        max_tokens: job.max_tokens,
        cache,
        sampler: &job.sampler,
        logits: &job.logits,
        draft: job.draft.as_ref().map(|d| &d.model),
        num_draft_tokens: job.num_draft_tokens,
        kv_quantization: job.kv_quantization,
    };
    let mut stream = backend.decode_stream(request)?;

    let started = Instant::now();
    let mut text = String::new();
    loop {
        if stop.load(Ordering::SeqCst) || sink.is_closed() {
            tally.cancelled = true;
            break;
        }
        let event = match stream.next() {
            Some(Ok(event)) => event,
            Some(Err(e)) => return Err(e.into()),
            None => break,
        };

        history.push(event.token);
        tally.generated += 1;
        tally.tokens_per_second = if event.tokens_per_second > 0.0 {
            event.tokens_per_second
        } else {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                tally.generated as f64 / elapsed
            } else {
                0.0
            }
        };

        text.push_str(&event.text);
        let finish_reason = event.finish_reason.or_else(|| {
            let tail = text.trim_end();
            job.stop_strings
                .iter()
                .any(|s| tail.ends_with(s.as_str()))
                .then_some(FinishReason::Stop)
        });

        let chunk = TokenChunk {
            text: event.text,
            is_finished: finish_reason.is_some(),
            finish_reason,
            error: None,
            from_draft: Some(event.from_draft),
            token_count: Some(1),
            token: Some(event.token),
            prompt_tokens: Some(job.prompt_tokens),
            generation_tokens: Some(tally.generated),
            generation_tps: Some(tally.tokens_per_second),
        };
        if !sink.send_blocking(chunk) {
            tally.cancelled = true;
            break;
        }
        if let Some(reason) = finish_reason {
            tracing::info!("Generation stream finished by model. Reason: {:?}", reason);
            break;
        }
    }

    Ok(())
}

/// Sampler settings: request values win over configured defaults
pub fn sampler_config(request: &GenerationRequest, defaults: &GenerationSection) -> SamplerConfig {
    SamplerConfig {
        temperature: request.temperature.unwrap_or(defaults.default_temp),
        top_p: request.top_p.unwrap_or(defaults.default_top_p),
        top_k: request.top_k.unwrap_or(defaults.default_top_k),
        min_p: request.min_p.unwrap_or(0.0),
        min_tokens_to_keep: request.min_tokens_to_keep.unwrap_or(1),
        xtc_probability: request.xtc_probability.unwrap_or(0.0),
        xtc_threshold: request.xtc_threshold.unwrap_or(0.0),
        seed: request
            .seed
            .or(defaults.default_seed)
            .unwrap_or_else(|| uuid::Uuid::new_v4().as_u64_pair().0),
    }
}

/// Logit bias and repetition penalty; bias keys that are not token ids are dropped
pub fn logit_processors(request: &GenerationRequest, defaults: &GenerationSection) -> LogitProcessors {
    let mut logit_bias = Vec::new();
    for (key, value) in request.logit_bias.iter().flatten() {
        match (key.trim().parse::<TokenId>(), bias_value(value)) {
            (Ok(token), Some(bias)) => logit_bias.push((token, bias)),
            _ => tracing::warn!("Ignoring invalid logit_bias entry '{}': {}", key, value),
        }
    }

    let penalty = request
        .repetition_penalty
        .unwrap_or(defaults.default_repetition_penalty);
    LogitProcessors {
        logit_bias,
        repetition_penalty: (penalty > 0.0 && penalty != 1.0).then_some(penalty),
        repetition_context_size: request
            .repetition_context_size
            .unwrap_or(defaults.default_repetition_context_size),
    }
}

fn kv_quantization(request: &GenerationRequest) -> Option<KvQuantization> {
    let options = request.kv_cache_options.as_ref()?;
    let bits = options.bits.filter(|b| *b > 0)?;
    Some(KvQuantization {
        bits,
        group_size: options.group_size.unwrap_or(DEFAULT_KV_GROUP_SIZE),
        start: options.quantized_kv_start.unwrap_or(DEFAULT_QUANTIZED_KV_START),
    })
}
