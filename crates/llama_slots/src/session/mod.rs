//! Functionality for the [`Session`] and [`InferenceSession`] structs

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tokio::task::JoinError;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{AdapterHandle, BackendError, ContextParams, InferenceBackend};
use crate::config::snapshot;
use crate::registry::SequenceIdAllocator;
use crate::standard_sampler::Candidates;
use crate::weights::{WeightsHandle, WeightsLoadError, WeightsRegistry};
use crate::{SequenceId, SharedConfig, Token};

mod context;
mod params;
mod token_decoder;

use context::LiveContext;
pub use params::default_thread_count;
pub use token_decoder::TokenDecoder;

/// A shared reference to a [`Session`].
pub type SessionHandle = Arc<Session>;

/// An error raised by an [`InferenceSession`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The session holds no weights, so there is nothing to build a context from.
    #[error("session has no weights loaded")]
    NotLoaded,

    /// The backend refused to build a context from valid weights; check your logs.
    #[error("failed to create context: {0}")]
    ContextInit(BackendError),

    /// The input produced no tokens; the turn should be skipped.
    #[error("input produced no tokens")]
    TokenizationEmpty,

    /// The backend tokenizer failed.
    #[error("tokenization failed: {0}")]
    Tokenization(BackendError),

    /// The backend reported a nonzero status while decoding.
    #[error("advancing context failed (error code {0})")]
    DecodeFailed(i32),

    /// The input does not fit in what is left of the context window.
    #[error("{requested} tokens were provided, but only {available} fit in the context")]
    ContextFull {
        /// The number of tokens that were to be decoded.
        requested: usize,

        /// The number of free positions in the context.
        available: usize,
    },

    /// Weights could not be acquired.
    #[error(transparent)]
    Weights(#[from] WeightsLoadError),

    /// A LoRA adapter could not be loaded or applied.
    #[error("adapter failed: {0}")]
    Adapter(BackendError),

    /// The blocking worker running a session operation panicked or was cancelled.
    #[error("session worker failed: {0}")]
    Worker(String),
}

impl From<JoinError> for SessionError {
    fn from(value: JoinError) -> Self {
        SessionError::Worker(value.to_string())
    }
}

/// Where an [`InferenceSession`] is in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No context is live. Weights may still be held.
    Unloaded,
    /// Weights or a context are being built.
    Loading,
    /// A context is live and ready to decode.
    Loaded,
    /// The last load failed.
    Error(String),
}

/// Why the last [`InferenceSession::completion_loop`] call returned `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The model produced an end-of-generation token.
    EndOfGeneration,
    /// The per-turn token limit was reached.
    MaxTokens,
    /// The cancellation flag was set.
    Cancelled,
    /// The context window has no room left.
    ContextExhausted,
    /// The backend failed to produce logits or to decode the sampled token.
    DecodeFailed,
    /// The session has no live context.
    NoContext,
}

/// The per-slot inference state machine.
///
/// Owns one backend context, the sampler and decode batch bound to it, the tokens decoded
/// so far, and a reference to the weights the context was built from. All methods are
/// blocking; [`Session`] wraps them for use from async code.
pub struct InferenceSession {
    id: String,
    sequence_id: Option<SequenceId>,
    sequences: Arc<SequenceIdAllocator>,
    cancelled: Arc<AtomicBool>,

    backend: Arc<dyn InferenceBackend>,
    weights_registry: Arc<WeightsRegistry>,
    config: SharedConfig,

    model_path: Option<PathBuf>,
    weights: Option<WeightsHandle>,
    context: Option<LiveContext>,

    /// Every token decoded into the live context, in order.
    tokens: Vec<Token>,
    decoder: TokenDecoder,

    /// The position the next decoded token is written at.
    n_cur: usize,
    restarted: bool,
    last_stop: Option<StopReason>,

    adapters: HashMap<PathBuf, AdapterHandle>,
    state: SessionState,
}

impl InferenceSession {
    pub(crate) fn new(
        id: impl Into<String>,
        backend: Arc<dyn InferenceBackend>,
        weights_registry: Arc<WeightsRegistry>,
        sequences: Arc<SequenceIdAllocator>,
        config: SharedConfig,
    ) -> Self {
        let sequence_id = sequences.allocate();

        Self {
            id: id.into(),
            sequence_id: Some(sequence_id),
            sequences,
            cancelled: Arc::new(AtomicBool::new(false)),
            backend,
            weights_registry,
            config,
            model_path: None,
            weights: None,
            context: None,
            tokens: Vec::new(),
            decoder: TokenDecoder::new(),
            n_cur: 0,
            restarted: true,
            last_stop: None,
            adapters: HashMap::new(),
            state: SessionState::Unloaded,
        }
    }

    /// Binds weights acquired elsewhere to this session. The context is built on first use.
    pub(crate) fn attach_weights(&mut self, weights: WeightsHandle) {
        if let Some(previous) = self.weights.take() {
            self.weights_registry.release(previous);
        }

        self.model_path = Some(weights.path().to_path_buf());
        self.weights = Some(weights);
    }

    /// Loads the weights at `path` (sharing them if already resident) and builds a fresh
    /// context on top of them.
    ///
    /// If this session already has a context, it is torn down first; weights held under a
    /// different key are released.
    pub fn load_model(&mut self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref();
        let key = WeightsRegistry::key_for(path);

        self.cancelled.store(false, Ordering::SeqCst);
        self.state = SessionState::Loading;

        if self.context.is_some() {
            self.teardown_context();
        }

        let reuse = self.weights.as_ref().is_some_and(|w| w.key() == key);
        if !reuse {
            if let Some(previous) = self.weights.take() {
                info!(session = self.id, key = previous.key(), "Switching weights");
                self.weights_registry.release(previous);
            }

            match self.weights_registry.acquire_for(&self.id, &key, path) {
                Ok(weights) => self.weights = Some(weights),
                Err(err) => {
                    error!(session = self.id, "Failed to acquire weights: {err}");
                    self.model_path = None;
                    self.state = SessionState::Error(err.to_string());
                    return Err(err.into());
                }
            }
        }

        self.model_path = Some(path.to_path_buf());
        self.build_context()
    }

    /// Builds a context from the held weights unless one is already live.
    pub fn ensure_context(&mut self) -> Result<(), SessionError> {
        if self.context.is_some() {
            return Ok(());
        }

        info!(session = self.id, "Rebuilding context from resident weights");
        self.build_context()
    }

    fn build_context(&mut self) -> Result<(), SessionError> {
        let Some(model) = self.weights.as_ref().map(WeightsHandle::model) else {
            return Err(SessionError::NotLoaded);
        };

        self.state = SessionState::Loading;

        let config = snapshot(&self.config);
        let sequence_id = self.sequence_id();
        let params = ContextParams::for_session(&config, sequence_id);

        let handle = match self.backend.create_context(model, &params) {
            Ok(handle) => handle,
            Err(err) => {
                error!(session = self.id, "Failed to create context: {err}");
                self.state = SessionState::Error(err.to_string());
                return Err(SessionError::ContextInit(err));
            }
        };

        // A fresh context must start empty.
        self.backend.clear_kv_cache(handle);

        self.context = Some(LiveContext::new(self.backend.clone(), handle, model, config));
        self.tokens.clear();
        self.decoder.clear();
        self.n_cur = 0;
        self.restarted = true;
        self.last_stop = None;
        self.cancelled.store(false, Ordering::SeqCst);
        self.state = SessionState::Loaded;

        info!(
            session = self.id,
            sequence_id,
            n_ctx = params.n_ctx,
            n_threads = params.n_threads,
            "Context ready"
        );

        Ok(())
    }

    /// Tokenizes `text` and decodes it into the context, so that generation continues from
    /// its end.
    ///
    /// Rebuilds the context first if it was unloaded while weights were kept. Special
    /// prefix tokens are only added when the context is empty.
    ///
    /// This starts a turn, so a cancellation requested before it is dropped; one requested
    /// while the turn runs still stops it.
    pub fn completion_init(&mut self, text: &str) -> Result<(), SessionError> {
        self.begin_turn();
        self.ensure_context()?;

        let tokens = self.tokenize(text, self.n_cur == 0)?;
        self.ingest(&tokens)?;
        self.restarted = false;

        Ok(())
    }

    /// Tokenizes `text` without special prefix tokens and appends it to the context.
    ///
    /// Like [`InferenceSession::completion_init`], this starts a turn.
    pub fn append_user_message(&mut self, text: &str) -> Result<(), SessionError> {
        self.begin_turn();
        self.ensure_context()?;

        let tokens = self.tokenize(text, false)?;
        self.ingest(&tokens)
    }

    fn begin_turn(&self) {
        if self.cancelled.swap(false, Ordering::SeqCst) {
            debug!(session = self.id, "Dropping cancellation left over from an idle session");
        }
    }

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<Token>, SessionError> {
        let Some(model) = self.weights.as_ref().map(WeightsHandle::model) else {
            return Err(SessionError::NotLoaded);
        };

        self.backend
            .tokenize(model, text, add_special, true)
            .map_err(SessionError::Tokenization)
    }

    /// Decodes `tokens` at the current position, splitting them into batch sized chunks.
    /// Only the very last token produces logits.
    fn ingest(&mut self, tokens: &[Token]) -> Result<(), SessionError> {
        if tokens.is_empty() {
            return Err(SessionError::TokenizationEmpty);
        }

        let sequence_id = self.sequence_id();
        let Some(context) = self.context.as_mut() else {
            return Err(SessionError::NotLoaded);
        };

        let available = context.window().saturating_sub(self.n_cur);
        if tokens.len() > available {
            return Err(SessionError::ContextFull {
                requested: tokens.len(),
                available,
            });
        }

        let chunk_size = (context.config.batch_size as usize)
            .min(context.batch.capacity())
            .max(1);
        let n_tokens = tokens.len();

        if n_tokens > chunk_size {
            info!(
                session = self.id,
                "Number of tokens exceeds the maximum batch size ({chunk_size}), splitting the input"
            );
        }

        let mut written = 0;
        for chunk in tokens.chunks(chunk_size) {
            context.batch.clear();

            for (i, token) in chunk.iter().enumerate() {
                let last = written + i + 1 == n_tokens;
                context
                    .batch
                    .add(*token, self.n_cur + i, &[sequence_id], last);
            }

            trace!(session = self.id, tokens = chunk.len(), "Starting decode for batch");

            let status = self.backend.decode(context.handle, &context.batch);
            if status != 0 {
                error!(session = self.id, "Failed to decode context ({status})");
                return Err(SessionError::DecodeFailed(status));
            }

            self.n_cur += chunk.len();
            self.tokens.extend_from_slice(chunk);
            written += chunk.len();
        }

        debug!(session = self.id, n_tokens, n_cur = self.n_cur, "Advanced context");
        Ok(())
    }

    /// Samples, decodes, and returns the text of one more token.
    ///
    /// Returns `None` to stop: the session was cancelled, `current_token` reached
    /// `max_tokens`, the model produced an end-of-generation token, or decoding failed. See
    /// [`InferenceSession::stop_reason`] for which. `Some("")` means a token was produced but
    /// its bytes do not complete a character yet.
    pub fn completion_loop(
        &mut self,
        max_tokens: usize,
        current_token: &mut usize,
    ) -> Option<String> {
        if self.cancelled.load(Ordering::SeqCst) {
            return self.stop(StopReason::Cancelled);
        }
        if *current_token >= max_tokens {
            return self.stop(StopReason::MaxTokens);
        }

        let sequence_id = self.sequence_id();
        let (Some(context), Some(weights)) = (self.context.as_mut(), self.weights.as_ref()) else {
            self.last_stop = Some(StopReason::NoContext);
            return None;
        };
        let model = weights.model();

        if self.n_cur >= context.window() {
            warn!(session = self.id, n_cur = self.n_cur, "Context window exhausted");
            self.last_stop = Some(StopReason::ContextExhausted);
            return None;
        }

        let logits = context
            .batch
            .last_logits_index()
            .and_then(|index| self.backend.logits(context.handle, index));
        let Some(logits) = logits else {
            error!(session = self.id, "No logits available for sampling");
            self.last_stop = Some(StopReason::DecodeFailed);
            return None;
        };

        let Some(token) = context
            .sampler
            .sample(Candidates::from_logits(&logits), &self.tokens)
        else {
            error!(session = self.id, "Sampler produced no token");
            self.last_stop = Some(StopReason::DecodeFailed);
            return None;
        };

        if self.backend.is_end_of_generation(model, token) {
            trace!(session = self.id, "End of generation");
            self.decoder.clear();
            self.last_stop = Some(StopReason::EndOfGeneration);
            return None;
        }

        let piece = self.backend.token_to_piece(model, token);
        let text = self.decoder.add_token(&piece);

        context.batch.clear();
        context.batch.add(token, self.n_cur, &[sequence_id], true);

        let status = self.backend.decode(context.handle, &context.batch);
        if status != 0 {
            error!(session = self.id, "Failed to decode sampled token ({status})");
            self.last_stop = Some(StopReason::DecodeFailed);
            return None;
        }

        *current_token += 1;
        self.n_cur += 1;
        self.tokens.push(token);
        trace!(session = self.id, token = token.0, n_cur = self.n_cur, "Decoded token");

        Some(text)
    }

    fn stop(&mut self, reason: StopReason) -> Option<String> {
        self.last_stop = Some(reason);
        None
    }

    /// Returns true when the next turn might not fit: the current position plus one batch
    /// plus a full turn of generated tokens reaches the context size.
    ///
    /// Without a live context there is nothing to roll over, so this is false.
    pub fn check_reset_pending(&self) -> bool {
        let Some(context) = self.context.as_ref() else {
            return false;
        };

        let config = &context.config;
        self.n_cur + config.batch_size as usize + config.max_tokens as usize
            >= config.context_size as usize
    }

    /// Forgets everything decoded so far, so the next turn starts from position 0.
    pub fn clear_context(&mut self, clear_kv_cache: bool) {
        if clear_kv_cache {
            if let Some(context) = self.context.as_ref() {
                self.backend.clear_kv_cache(context.handle);
            }
        }

        self.tokens.clear();
        self.decoder.clear();
        self.n_cur = 0;
        self.restarted = true;

        info!(session = self.id, "Cleared context");
    }

    /// Rebuilds the sampler from the current configuration. The context is left untouched.
    pub fn rebuild_sampler(&mut self) -> Result<(), SessionError> {
        let Some(model) = self.weights.as_ref().map(WeightsHandle::model) else {
            return Err(SessionError::NotLoaded);
        };
        let Some(context) = self.context.as_mut() else {
            return Err(SessionError::NotLoaded);
        };

        context.rebuild_sampler(model, snapshot(&self.config));
        Ok(())
    }

    /// Makes the adapter at `path` the only active one.
    ///
    /// Returns `Ok(false)` without touching the context if the file does not exist or the
    /// adapter is already the only one applied.
    pub fn apply_adapter(&mut self, path: impl AsRef<Path>) -> Result<bool, SessionError> {
        let path = path.as_ref();

        if !path.exists() {
            warn!(session = self.id, "Adapter {} does not exist, skipping", path.display());
            return Ok(false);
        }
        if self.adapters.len() == 1 && self.adapters.contains_key(path) {
            info!(session = self.id, "Adapter {} already active, skipping", path.display());
            return Ok(false);
        }

        self.ensure_context()?;
        self.clear_adapters();

        let (Some(context), Some(weights)) = (self.context.as_ref(), self.weights.as_ref()) else {
            return Err(SessionError::NotLoaded);
        };

        let adapter = self
            .backend
            .load_adapter(weights.model(), path)
            .map_err(SessionError::Adapter)?;

        let scale = snapshot(&self.config).lora_scale;
        if let Err(err) = self.backend.attach_adapter(context.handle, adapter, scale) {
            error!(session = self.id, "Failed to apply adapter: {err}");
            self.backend.free_adapter(adapter);
            return Err(SessionError::Adapter(err));
        }

        info!(session = self.id, scale, "Applied adapter {}", path.display());
        self.adapters.insert(path.to_path_buf(), adapter);

        Ok(true)
    }

    /// Detaches and frees every loaded adapter.
    pub fn clear_adapters(&mut self) {
        if self.adapters.is_empty() {
            return;
        }

        if let Some(context) = self.context.as_ref() {
            self.backend.clear_adapters(context.handle);
        }

        for (path, adapter) in self.adapters.drain() {
            debug!(session = self.id, "Freeing adapter {}", path.display());
            self.backend.free_adapter(adapter);
        }
    }

    /// Frees the context, its sampler, and its batch. Weights are kept.
    fn teardown_context(&mut self) {
        self.clear_adapters();

        if self.context.take().is_some() {
            info!(session = self.id, "Tore down context");
        }

        self.tokens.clear();
        self.decoder.clear();
        self.n_cur = 0;
        self.restarted = true;
    }

    /// Cancels in-flight work and frees the context. With `release_weights`, the weights
    /// reference and the sequence id are given back as well.
    pub fn cleanup_internal(&mut self, release_weights: bool) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.teardown_context();

        if release_weights {
            if let Some(weights) = self.weights.take() {
                self.weights_registry.release(weights);
            }
            if let Some(id) = self.sequence_id.take() {
                self.sequences.release(id);
            }
            self.model_path = None;
        }

        self.state = SessionState::Unloaded;
    }

    /// Returns this session's sequence id, allocating a new one if it was released.
    pub fn sequence_id(&mut self) -> SequenceId {
        *self
            .sequence_id
            .get_or_insert_with(|| self.sequences.allocate())
    }

    /// Sets or clears the cancellation flag.
    pub fn set_cancelled(&self, cancelled: bool) {
        self.cancelled.store(cancelled, Ordering::SeqCst);
    }

    /// Whether the cancellation flag is set.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The session's id in its registry.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The position the next token is decoded at.
    pub fn decode_position(&self) -> usize {
        self.n_cur
    }

    /// Where the session is in its lifecycle.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// True until the first successful [`InferenceSession::completion_init`] after a load
    /// or a reset.
    pub fn is_restarted(&self) -> bool {
        self.restarted
    }

    /// Why generation last stopped.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.last_stop
    }

    /// The path the session's weights were loaded from.
    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    /// The registry key of the held weights.
    pub fn weights_key(&self) -> Option<&str> {
        self.weights.as_ref().map(WeightsHandle::key)
    }

    /// Whether the session holds a weights reference.
    pub fn has_weights(&self) -> bool {
        self.weights.is_some()
    }

    /// Whether a context is live.
    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    /// The tokens decoded into the live context.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Paths of the adapters currently applied.
    pub fn active_adapters(&self) -> Vec<PathBuf> {
        self.adapters.keys().cloned().collect()
    }
}

impl fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceSession")
            .field("id", &self.id)
            .field("sequence_id", &self.sequence_id)
            .field("state", &self.state)
            .field("weights", &self.weights_key())
            .field("n_cur", &self.n_cur)
            .finish()
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        self.clear_adapters();
        self.context = None;

        if let Some(weights) = self.weights.take() {
            warn!(session = self.id, "Session dropped while holding weights, releasing them");
            self.weights_registry.release(weights);
        }
        if let Some(id) = self.sequence_id.take() {
            self.sequences.release(id);
        }
    }
}

/// An [`InferenceSession`] shared between tasks.
///
/// At most one operation runs against the session at a time. The cancellation flag lives
/// outside the lock, so a generation holding the session can be asked to stop.
pub struct Session {
    id: String,
    cancelled: Arc<AtomicBool>,
    config: SharedConfig,
    inner: Arc<Mutex<InferenceSession>>,
}

impl Session {
    pub(crate) fn new(session: InferenceSession) -> SessionHandle {
        Arc::new(Self {
            id: session.id.clone(),
            cancelled: session.cancelled.clone(),
            config: session.config.clone(),
            inner: Arc::new(Mutex::new(session)),
        })
    }

    /// The session's id in its registry.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Asks in-flight generation to stop at its next token.
    ///
    /// The request only applies to the turn running now; the next turn clears it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the cancellation flag is set.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Waits for exclusive access to the session.
    pub async fn lock(&self) -> MutexGuard<'_, InferenceSession> {
        self.inner.lock().await
    }

    /// Waits for exclusive access to the session, returning a guard that can be moved to a
    /// blocking worker.
    pub async fn lock_owned(&self) -> OwnedMutexGuard<InferenceSession> {
        self.inner.clone().lock_owned().await
    }

    /// Runs `f` against the session on a blocking worker.
    async fn run<R, F>(&self, f: F) -> Result<R, SessionError>
    where
        F: FnOnce(&mut InferenceSession) -> R + Send + 'static,
        R: Send + 'static,
    {
        let guard = self.lock_owned().await;
        let (_, result) = run_blocking(guard, f).await?;
        Ok(result)
    }

    /// Loads weights and builds a context.
    ///
    /// This is a thin `tokio::spawn_blocking` wrapper around
    /// [`InferenceSession::load_model`].
    pub async fn load_model(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref().to_owned();
        self.run(move |session| session.load_model(path)).await?
    }

    /// This is a thin `tokio::spawn_blocking` wrapper around
    /// [`InferenceSession::ensure_context`].
    pub async fn ensure_context(&self) -> Result<(), SessionError> {
        self.run(InferenceSession::ensure_context).await?
    }

    /// This is a thin `tokio::spawn_blocking` wrapper around
    /// [`InferenceSession::completion_init`].
    pub async fn completion_init(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        self.run(move |session| session.completion_init(&text)).await?
    }

    /// This is a thin `tokio::spawn_blocking` wrapper around
    /// [`InferenceSession::append_user_message`].
    pub async fn append_user_message(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        self.run(move |session| session.append_user_message(&text))
            .await?
    }

    /// See [`InferenceSession::check_reset_pending`].
    pub async fn check_reset_pending(&self) -> bool {
        self.lock().await.check_reset_pending()
    }

    /// This is a thin `tokio::spawn_blocking` wrapper around
    /// [`InferenceSession::clear_context`].
    pub async fn clear_context(&self, clear_kv_cache: bool) -> Result<(), SessionError> {
        self.run(move |session| session.clear_context(clear_kv_cache))
            .await
    }

    /// Swaps the active LoRA adapter for the one at `adapter`.
    ///
    /// In-flight generation is cancelled and the context cleared before the swap, and
    /// generation is re-enabled afterwards. Returns whether an adapter was applied.
    pub async fn switch_agent(&self, adapter: impl AsRef<Path>) -> Result<bool, SessionError> {
        let path = adapter.as_ref().to_owned();
        let settle = snapshot(&self.config).adapter_settle();

        info!(session = self.id, "Switching agent to {}", path.display());
        self.cancel();

        let guard = self.lock_owned().await;
        let (guard, _) = run_blocking(guard, |session| session.clear_context(true)).await?;

        tokio::time::sleep(settle).await;

        let (guard, applied) =
            run_blocking(guard, move |session| session.apply_adapter(path)).await?;
        guard.set_cancelled(false);

        applied
    }

    /// Frees the context but keeps the weights, so the next use rebuilds it cheaply.
    pub async fn unload_context_only(&self) -> Result<(), SessionError> {
        self.cancel();
        self.run(|session| session.cleanup_internal(false)).await
    }

    /// Frees the context and gives back the weights and the sequence id.
    pub async fn unload_fully(&self) -> Result<(), SessionError> {
        self.cancel();
        self.run(|session| session.cleanup_internal(true)).await
    }

    /// See [`InferenceSession::decode_position`].
    pub async fn decode_position(&self) -> usize {
        self.lock().await.decode_position()
    }

    /// See [`InferenceSession::state`].
    pub async fn state(&self) -> SessionState {
        self.lock().await.state().clone()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

/// Runs `f` on a blocking worker and hands the guard back with the result.
pub(crate) async fn run_blocking<R, F>(
    mut guard: OwnedMutexGuard<InferenceSession>,
    f: F,
) -> Result<(OwnedMutexGuard<InferenceSession>, R), SessionError>
where
    F: FnOnce(&mut InferenceSession) -> R + Send + 'static,
    R: Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || {
        let result = f(&mut guard);
        (guard, result)
    })
    .await?;

    Ok(result)
}
