//! An [`InferenceBackend`] over [llama.cpp][llama.cpp]'s C API, enabled with the `llama`
//! feature.
//!
//! The bundled GGML and llama.cpp logs are re-routed through [`tracing`][tracing] under the
//! `llama.cpp` target instead of `stderr`.
//!
//! [llama.cpp]: https://github.com/ggerganov/llama.cpp/
//! [tracing]: https://docs.rs/tracing/latest/tracing/

use std::collections::HashMap;
use std::ffi::{c_char, CString};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{error, info, warn};

use llama_cpp_sys::{
    llama_context, llama_context_default_params, llama_decode, llama_free, llama_free_model,
    llama_get_kv_cache_token_count, llama_get_logits_ith, llama_kv_cache_clear,
    llama_load_model_from_file, llama_model, llama_model_default_params, llama_n_vocab,
    llama_new_context_with_model, llama_token, llama_token_eos, llama_token_eot,
    llama_token_to_piece, llama_tokenize,
};

use crate::backend::{
    AdapterHandle, BackendError, ContextHandle, ContextParams, InferenceBackend, ModelHandle,
    ModelParams,
};
use crate::batch::Batch;
use crate::Token;

mod batch;
mod detail;

use batch::NativeBatch;
use detail::BackendRef;

struct ModelEntry {
    ptr: *mut llama_model,
    n_vocab: usize,
}

struct ContextEntry {
    ptr: *mut llama_context,
    n_vocab: usize,
    batch: Option<NativeBatch>,
}

// SAFETY: llama.cpp models are immutable after loading and contexts are only touched while
// the backend's lock is held.
unsafe impl Send for ModelEntry {}
unsafe impl Send for ContextEntry {}

#[derive(Default)]
struct Handles {
    models: HashMap<u64, ModelEntry>,
    contexts: HashMap<u64, ContextEntry>,
}

/// The llama.cpp backend.
///
/// Every call into llama.cpp is made with an internal lock held, so the backend can be
/// shared between sessions on any number of threads.
pub struct LlamaBackend {
    handles: Mutex<Handles>,
    next_handle: AtomicU64,
    _backend_ref: BackendRef,
}

impl LlamaBackend {
    /// Initialises llama.cpp (once per process) and creates an empty backend.
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(Handles::default()),
            next_handle: AtomicU64::new(1),
            _backend_ref: BackendRef::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Handles> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for LlamaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for LlamaBackend {
    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<ModelHandle, BackendError> {
        info!("Loading model \"{}\"", path.to_string_lossy());

        let c_path = CString::new(path.to_string_lossy().into_owned().into_bytes())
            .map_err(|_| BackendError::LoadFailed(path.into()))?;

        let model = unsafe {
            // SAFETY: Stack constructor, always safe.
            let mut c_params = llama_model_default_params();
            c_params.n_gpu_layers = params.n_gpu_layers as i32;
            c_params.use_mmap = params.use_mmap;
            c_params.use_mlock = params.use_mlock;

            // SAFETY: llama.cpp gracefully fails and returns `nullptr` if loading fails.
            llama_load_model_from_file(c_path.as_ptr(), c_params)
        };

        if model.is_null() {
            return Err(BackendError::LoadFailed(path.into()));
        }

        let n_vocab = unsafe {
            // SAFETY: `model` is not null.
            llama_n_vocab(model)
        } as usize;

        let id = self.next();
        self.lock()
            .models
            .insert(id, ModelEntry { ptr: model, n_vocab });

        Ok(ModelHandle(id))
    }

    fn free_model(&self, model: ModelHandle) {
        match self.lock().models.remove(&model.0) {
            Some(entry) => unsafe {
                // SAFETY: The entry was just removed, so this is the only free.
                llama_free_model(entry.ptr)
            },
            None => error!(model = model.0, "Freeing unknown model"),
        }
    }

    fn vocabulary_size(&self, model: ModelHandle) -> usize {
        self.lock().models.get(&model.0).map_or(0, |m| m.n_vocab)
    }

    fn create_context(
        &self,
        model: ModelHandle,
        params: &ContextParams,
    ) -> Result<ContextHandle, BackendError> {
        let mut handles = self.lock();
        let entry = handles
            .models
            .get(&model.0)
            .ok_or(BackendError::UnknownHandle(model.0))?;

        if params.flash_attention {
            warn!("Flash attention is not exposed by this llama.cpp build, ignoring");
        }

        let ctx = unsafe {
            // SAFETY: Stack constructor, always safe.
            let mut c_params = llama_context_default_params();
            c_params.seed = params.seed;
            c_params.n_ctx = params.n_ctx;
            c_params.n_batch = params.n_batch;
            c_params.n_seq_max = params.n_seq_max;
            c_params.n_threads = params.n_threads;
            c_params.n_threads_batch = params.n_threads_batch;

            // SAFETY: `entry.ptr` stays valid until `free_model`, which needs this lock.
            llama_new_context_with_model(entry.ptr, c_params)
        };

        if ctx.is_null() {
            return Err(BackendError::ContextFailed(
                "llama_new_context_with_model returned null".into(),
            ));
        }

        let n_vocab = entry.n_vocab;
        let id = self.next();
        handles.contexts.insert(
            id,
            ContextEntry {
                ptr: ctx,
                n_vocab,
                batch: None,
            },
        );

        Ok(ContextHandle(id))
    }

    fn free_context(&self, ctx: ContextHandle) {
        match self.lock().contexts.remove(&ctx.0) {
            Some(entry) => {
                drop(entry.batch);
                unsafe {
                    // SAFETY: The entry was just removed, so this is the only free.
                    llama_free(entry.ptr)
                }
            }
            None => error!(ctx = ctx.0, "Freeing unknown context"),
        }
    }

    fn tokenize(
        &self,
        model: ModelHandle,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, BackendError> {
        let handles = self.lock();
        let entry = handles
            .models
            .get(&model.0)
            .ok_or(BackendError::UnknownHandle(model.0))?;

        let content = text.as_bytes();
        if content.len() > i32::MAX as usize {
            return Err(BackendError::TokenizationFailed(format!(
                "{} bytes is more than llama.cpp can handle",
                content.len()
            )));
        }

        // Leave room for the special tokens added around short inputs.
        let mut out_buf: Vec<Token> = Vec::with_capacity(content.len() + 2);

        let n_written_tokens = unsafe {
            // SAFETY: The pointer ranges specified here are always valid, and
            // `n_written_tokens` is always less than the capacity of `out_buf`.
            //
            // `Token` is `#[repr(transparent)]` over an `i32`.
            llama_tokenize(
                entry.ptr,
                content.as_ptr() as *const c_char,
                content.len() as i32,
                out_buf.as_mut_ptr() as *mut llama_token,
                out_buf.capacity() as i32,
                add_special,
                parse_special,
            )
        };

        if n_written_tokens < 0 {
            return Err(BackendError::TokenizationFailed(format!(
                "llama_tokenize returned {n_written_tokens}"
            )));
        }

        unsafe {
            // SAFETY: Tokenization succeeded and wrote this many tokens.
            out_buf.set_len(n_written_tokens as usize);
        }

        Ok(out_buf)
    }

    fn token_to_piece(&self, model: ModelHandle, token: Token) -> Vec<u8> {
        let handles = self.lock();
        let Some(entry) = handles.models.get(&model.0) else {
            return Vec::new();
        };

        let mut buffer = vec![0u8; 8];
        let size = unsafe {
            // SAFETY: `buffer` is valid for `buffer.len()` bytes.
            llama_token_to_piece(
                entry.ptr,
                token.0,
                buffer.as_mut_ptr() as *mut c_char,
                buffer.len() as i32,
                false,
            )
        };

        if size < 0 {
            buffer.resize(size.unsigned_abs() as usize, 0);
            let size = unsafe {
                // SAFETY: `buffer` was resized to what llama.cpp asked for.
                llama_token_to_piece(
                    entry.ptr,
                    token.0,
                    buffer.as_mut_ptr() as *mut c_char,
                    buffer.len() as i32,
                    false,
                )
            };
            buffer.truncate(size.max(0) as usize);
        } else {
            buffer.truncate(size as usize);
        }

        buffer
    }

    fn is_end_of_generation(&self, model: ModelHandle, token: Token) -> bool {
        let handles = self.lock();
        let Some(entry) = handles.models.get(&model.0) else {
            return true;
        };

        unsafe {
            // SAFETY: `entry.ptr` is a live model.
            token.0 == llama_token_eos(entry.ptr) || token.0 == llama_token_eot(entry.ptr)
        }
    }

    fn decode(&self, ctx: ContextHandle, batch: &Batch) -> i32 {
        let mut handles = self.lock();
        let Some(entry) = handles.contexts.get_mut(&ctx.0) else {
            error!(ctx = ctx.0, "Decoding against unknown context");
            return -1;
        };

        if !entry.batch.as_ref().is_some_and(|native| native.fits(batch)) {
            let max_sequences = batch
                .entries()
                .iter()
                .map(|e| e.sequence_ids.len())
                .max()
                .unwrap_or(1);
            entry.batch = Some(NativeBatch::new(batch.capacity(), max_sequences));
        }

        let Some(native) = entry.batch.as_mut() else {
            return -1;
        };
        native.fill(batch);

        unsafe {
            // SAFETY: `native` was just filled with a valid batch for this context.
            llama_decode(entry.ptr, native.handle())
        }
    }

    fn logits(&self, ctx: ContextHandle, index: usize) -> Option<Vec<f32>> {
        let handles = self.lock();
        let entry = handles.contexts.get(&ctx.0)?;

        let logits = unsafe {
            // SAFETY: `index` refers to an entry of the last decoded batch.
            llama_get_logits_ith(entry.ptr, index as i32)
        };
        if logits.is_null() {
            return None;
        }

        Some(unsafe {
            // SAFETY: llama.cpp keeps `n_vocab` logits per output row.
            std::slice::from_raw_parts(logits, entry.n_vocab)
        }
        .to_vec())
    }

    fn clear_kv_cache(&self, ctx: ContextHandle) {
        if let Some(entry) = self.lock().contexts.get(&ctx.0) {
            unsafe {
                // SAFETY: `entry.ptr` is a live context.
                llama_kv_cache_clear(entry.ptr)
            }
        }
    }

    fn kv_cache_tokens(&self, ctx: ContextHandle) -> usize {
        self.lock().contexts.get(&ctx.0).map_or(0, |entry| unsafe {
            // SAFETY: `entry.ptr` is a live context.
            llama_get_kv_cache_token_count(entry.ptr).max(0) as usize
        })
    }

    fn load_adapter(
        &self,
        _model: ModelHandle,
        path: &Path,
    ) -> Result<AdapterHandle, BackendError> {
        warn!("Cannot load adapter {}: not supported", path.display());
        Err(BackendError::Unsupported("hot-swappable LoRA adapters"))
    }

    fn attach_adapter(
        &self,
        _ctx: ContextHandle,
        _adapter: AdapterHandle,
        _scale: f32,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("hot-swappable LoRA adapters"))
    }

    fn clear_adapters(&self, _ctx: ContextHandle) {}

    fn free_adapter(&self, _adapter: AdapterHandle) {}
}

impl Drop for LlamaBackend {
    fn drop(&mut self) {
        let handles = self.handles.get_mut().unwrap_or_else(PoisonError::into_inner);

        for (_, entry) in handles.contexts.drain() {
            drop(entry.batch);
            unsafe { llama_free(entry.ptr) }
        }
        for (_, entry) in handles.models.drain() {
            unsafe { llama_free_model(entry.ptr) }
        }
    }
}
