//! A scripted [`InferenceBackend`] that needs no model files.
//!
//! The vocabulary is bytes: tokens `0..=255` stand for themselves, followed by
//! [`ScriptedBackend::EOS`] and [`ScriptedBackend::BOS`]. Every turn (a decode that is not
//! the token the backend just proposed) pops the next scripted reply, which the backend then
//! proposes byte by byte through one-hot logits before proposing EOS.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use llama_slots::batch::Batch;
use llama_slots::{
    AdapterHandle, BackendError, ContextHandle, ContextParams, InferenceBackend, ModelHandle,
    ModelParams, Token,
};

const VOCAB: usize = 258;

struct ContextState {
    model: u64,
    params: ContextParams,
    kv_tokens: usize,
    reply: Option<(Vec<u8>, usize)>,
    awaiting_sample: bool,
    adapters: Vec<u64>,
}

#[derive(Default)]
struct State {
    models: HashMap<u64, PathBuf>,
    contexts: HashMap<u64, ContextState>,
    adapters: HashMap<u64, PathBuf>,
    replies: VecDeque<String>,
    prompts: Vec<String>,
    last_context_params: Option<ContextParams>,
}

/// Counters for every native resource the backend handed out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    /// Weights loaded from disk.
    pub models_loaded: usize,
    /// Weights freed.
    pub models_freed: usize,
    /// Contexts created.
    pub contexts_created: usize,
    /// Contexts freed.
    pub contexts_freed: usize,
    /// Adapters loaded.
    pub adapters_loaded: usize,
    /// Adapters freed.
    pub adapters_freed: usize,
    /// Calls to `decode`.
    pub decodes: usize,
}

/// The scripted backend.
#[derive(Default)]
pub struct ScriptedBackend {
    state: Mutex<State>,
    next_handle: AtomicU64,
    counters: Mutex<Counters>,
    token_delay_ms: AtomicU64,
    load_delay_ms: AtomicU64,
    fail_next_decode: AtomicBool,
    fail_contexts: AtomicBool,
    fail_adapters: AtomicBool,
    sampled: AtomicUsize,
}

impl ScriptedBackend {
    /// The end-of-sequence token.
    pub const EOS: Token = Token(256);

    /// The beginning-of-sequence token, prepended when special tokens are requested.
    pub const BOS: Token = Token(257);

    /// A backend that answers every turn with "ok".
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that answers the next turns with `replies`, then with "ok".
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let backend = Self::new();
        backend.push_replies(replies);
        backend
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count(&self, f: impl FnOnce(&mut Counters)) {
        f(&mut self.counters.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Queues more replies.
    pub fn push_replies<I, S>(&self, replies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock()
            .replies
            .extend(replies.into_iter().map(Into::into));
    }

    /// Sleeps this long before proposing each token.
    pub fn set_token_delay(&self, delay: Duration) {
        self.token_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sleeps this long inside every `load_model` call.
    pub fn set_load_delay(&self, delay: Duration) {
        self.load_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes the next `decode` call fail with status 1.
    pub fn fail_next_decode(&self) {
        self.fail_next_decode.store(true, Ordering::SeqCst);
    }

    /// Makes context creation fail until called again with `false`.
    pub fn fail_contexts(&self, fail: bool) {
        self.fail_contexts.store(fail, Ordering::SeqCst);
    }

    /// Makes attaching adapters fail until called again with `false`.
    pub fn fail_adapters(&self, fail: bool) {
        self.fail_adapters.store(fail, Ordering::SeqCst);
    }

    /// A snapshot of the resource counters.
    pub fn counters(&self) -> Counters {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of weights currently loaded.
    pub fn live_models(&self) -> usize {
        self.lock().models.len()
    }

    /// Number of contexts currently alive.
    pub fn live_contexts(&self) -> usize {
        self.lock().contexts.len()
    }

    /// Number of adapters loaded and not yet freed.
    pub fn live_adapters(&self) -> usize {
        self.lock().adapters.len()
    }

    /// The parameters of the most recently created context.
    pub fn last_context_params(&self) -> Option<ContextParams> {
        self.lock().last_context_params.clone()
    }

    /// Every text passed to `tokenize` with special tokens added, in order.
    pub fn primed_prompts(&self) -> Vec<String> {
        self.lock().prompts.clone()
    }

    /// Number of tokens sampled from proposed logits so far.
    pub fn sampled_tokens(&self) -> usize {
        self.sampled.load(Ordering::SeqCst)
    }

    /// Sum of KV cache occupancy over every live context.
    pub fn kv_tokens(&self) -> usize {
        self.lock().contexts.values().map(|c| c.kv_tokens).sum()
    }

    /// Paths of the adapters attached to any live context.
    pub fn attached_adapters(&self) -> Vec<PathBuf> {
        let state = self.lock();
        state
            .contexts
            .values()
            .flat_map(|c| c.adapters.iter())
            .filter_map(|id| state.adapters.get(id).cloned())
            .collect()
    }
}

impl InferenceBackend for ScriptedBackend {
    fn load_model(&self, path: &Path, _params: &ModelParams) -> Result<ModelHandle, BackendError> {
        let delay = self.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }

        let bytes = std::fs::read(path).map_err(|_| BackendError::LoadFailed(path.into()))?;
        if bytes.starts_with(b"corrupt") {
            return Err(BackendError::LoadFailed(path.into()));
        }

        let id = self.next();
        self.lock().models.insert(id, path.to_path_buf());
        self.count(|c| c.models_loaded += 1);

        Ok(ModelHandle(id))
    }

    fn free_model(&self, model: ModelHandle) {
        let mut state = self.lock();
        assert!(
            state.models.remove(&model.0).is_some(),
            "model {} freed twice",
            model.0
        );
        assert!(
            state.contexts.values().all(|c| c.model != model.0),
            "model {} freed while a context still uses it",
            model.0
        );
        drop(state);

        self.count(|c| c.models_freed += 1);
    }

    fn vocabulary_size(&self, model: ModelHandle) -> usize {
        if self.lock().models.contains_key(&model.0) {
            VOCAB
        } else {
            0
        }
    }

    fn create_context(
        &self,
        model: ModelHandle,
        params: &ContextParams,
    ) -> Result<ContextHandle, BackendError> {
        if self.fail_contexts.load(Ordering::SeqCst) {
            return Err(BackendError::ContextFailed("out of memory".into()));
        }

        let mut state = self.lock();
        if !state.models.contains_key(&model.0) {
            return Err(BackendError::UnknownHandle(model.0));
        }

        let id = self.next();
        state.contexts.insert(
            id,
            ContextState {
                model: model.0,
                params: params.clone(),
                kv_tokens: 0,
                reply: None,
                awaiting_sample: false,
                adapters: Vec::new(),
            },
        );
        state.last_context_params = Some(params.clone());
        drop(state);

        self.count(|c| c.contexts_created += 1);
        Ok(ContextHandle(id))
    }

    fn free_context(&self, ctx: ContextHandle) {
        assert!(
            self.lock().contexts.remove(&ctx.0).is_some(),
            "context {} freed twice",
            ctx.0
        );
        self.count(|c| c.contexts_freed += 1);
    }

    fn tokenize(
        &self,
        model: ModelHandle,
        text: &str,
        add_special: bool,
        _parse_special: bool,
    ) -> Result<Vec<Token>, BackendError> {
        let mut state = self.lock();
        if !state.models.contains_key(&model.0) {
            return Err(BackendError::UnknownHandle(model.0));
        }

        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(Self::BOS);
            state.prompts.push(text.to_string());
        }
        tokens.extend(text.bytes().map(|b| Token(i32::from(b))));

        Ok(tokens)
    }

    fn token_to_piece(&self, _model: ModelHandle, token: Token) -> Vec<u8> {
        match u8::try_from(token.0) {
            Ok(byte) => vec![byte],
            Err(_) => Vec::new(),
        }
    }

    fn is_end_of_generation(&self, _model: ModelHandle, token: Token) -> bool {
        token == Self::EOS
    }

    fn decode(&self, ctx: ContextHandle, batch: &Batch) -> i32 {
        self.count(|c| c.decodes += 1);

        if self.fail_next_decode.swap(false, Ordering::SeqCst) {
            return 1;
        }

        let mut state = self.lock();
        let Some(context) = state.contexts.get_mut(&ctx.0) else {
            return -1;
        };

        for entry in batch.entries() {
            if entry.position >= context.params.n_ctx as usize {
                return -2;
            }
            if entry
                .sequence_ids
                .iter()
                .any(|&id| id < 0 || id as u32 >= context.params.n_seq_max)
            {
                return -3;
            }
        }

        let sampled = match (&mut context.reply, batch.entries()) {
            (Some((reply, cursor)), [entry]) if context.awaiting_sample => {
                match reply.get(*cursor) {
                    Some(&byte) if entry.token == Token(i32::from(byte)) => {
                        *cursor += 1;
                        true
                    }
                    _ => false,
                }
            }
            _ => false,
        };

        if sampled {
            self.sampled.fetch_add(1, Ordering::SeqCst);
        } else {
            context.reply = None;
        }

        context.awaiting_sample = false;
        context.kv_tokens += batch.tokens();

        0
    }

    fn logits(&self, ctx: ContextHandle, index: usize) -> Option<Vec<f32>> {
        let delay = self.token_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }

        let mut state = self.lock();
        let next_reply = if state
            .contexts
            .get(&ctx.0)
            .is_some_and(|context| context.reply.is_none())
        {
            Some(
                state
                    .replies
                    .pop_front()
                    .unwrap_or_else(|| "ok".to_string()),
            )
        } else {
            None
        };

        let context = state.contexts.get_mut(&ctx.0)?;
        if index >= context.params.n_batch.max(1) as usize + context.params.n_ctx as usize {
            return None;
        }

        if let Some(reply) = next_reply {
            context.reply = Some((reply.into_bytes(), 0));
        }

        let next = match &context.reply {
            Some((reply, cursor)) => reply
                .get(*cursor)
                .map_or(Self::EOS, |&byte| Token(i32::from(byte))),
            None => Self::EOS,
        };
        context.awaiting_sample = true;

        let mut logits = vec![0.0; VOCAB];
        logits[next.0 as usize] = 10.0;
        Some(logits)
    }

    fn clear_kv_cache(&self, ctx: ContextHandle) {
        if let Some(context) = self.lock().contexts.get_mut(&ctx.0) {
            context.kv_tokens = 0;
            context.reply = None;
            context.awaiting_sample = false;
        }
    }

    fn kv_cache_tokens(&self, ctx: ContextHandle) -> usize {
        self.lock().contexts.get(&ctx.0).map_or(0, |c| c.kv_tokens)
    }

    fn load_adapter(&self, model: ModelHandle, path: &Path) -> Result<AdapterHandle, BackendError> {
        let mut state = self.lock();
        if !state.models.contains_key(&model.0) {
            return Err(BackendError::UnknownHandle(model.0));
        }

        let id = self.next();
        state.adapters.insert(id, path.to_path_buf());
        drop(state);

        self.count(|c| c.adapters_loaded += 1);
        Ok(AdapterHandle(id))
    }

    fn attach_adapter(
        &self,
        ctx: ContextHandle,
        adapter: AdapterHandle,
        _scale: f32,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        let path = state.adapters.get(&adapter.0).cloned().unwrap_or_default();

        if self.fail_adapters.load(Ordering::SeqCst) {
            return Err(BackendError::AdapterFailed {
                path,
                reason: "incompatible adapter".into(),
            });
        }

        let context = state
            .contexts
            .get_mut(&ctx.0)
            .ok_or(BackendError::UnknownHandle(ctx.0))?;
        context.adapters.push(adapter.0);

        Ok(())
    }

    fn clear_adapters(&self, ctx: ContextHandle) {
        if let Some(context) = self.lock().contexts.get_mut(&ctx.0) {
            context.adapters.clear();
        }
    }

    fn free_adapter(&self, adapter: AdapterHandle) {
        let mut state = self.lock();
        assert!(
            state.adapters.remove(&adapter.0).is_some(),
            "adapter {} freed twice",
            adapter.0
        );
        for context in state.contexts.values_mut() {
            context.adapters.retain(|&id| id != adapter.0);
        }
        drop(state);

        self.count(|c| c.adapters_freed += 1);
    }
}
