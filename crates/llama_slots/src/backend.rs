//! The [`InferenceBackend`] capability interface, which every native inference engine
//! (llama.cpp or otherwise) implements for this crate.
//!
//! The runtime never performs tensor math itself. It asks a backend to load weights, build
//! contexts, tokenize, decode batches, and expose logits; everything else (reference counting,
//! sequence bookkeeping, sampling, streaming) happens on the Rust side.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::batch::Batch;
use crate::Token;

/// An opaque handle to weights loaded by an [`InferenceBackend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModelHandle(pub u64);

/// An opaque handle to an evaluation context created by an [`InferenceBackend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// An opaque handle to a LoRA adapter loaded by an [`InferenceBackend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AdapterHandle(pub u64);

/// An error raised on the other side of the backend boundary.
///
/// Backends typically log useful information before failing, which is forwarded to this
/// crate's [`tracing`] handler.
///
/// [tracing]: https://docs.rs/tracing/latest/tracing/
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The weights at the given path could not be loaded (corrupt file, unknown format, OOM).
    #[error("failed to load weights from {0}")]
    LoadFailed(PathBuf),

    /// A context could not be created from otherwise valid weights.
    #[error("failed to create context: {0}")]
    ContextFailed(String),

    /// The backend tokenizer rejected the input.
    #[error("tokenization failed: {0}")]
    TokenizationFailed(String),

    /// An adapter could not be loaded or attached.
    #[error("adapter operation failed for {path}: {reason}")]
    AdapterFailed {
        /// The adapter path involved.
        path: PathBuf,

        /// Backend-provided reason.
        reason: String,
    },

    /// The handle passed in is not known to this backend.
    #[error("unknown handle {0}")]
    UnknownHandle(u64),

    /// The backend does not implement this capability.
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
}

/// Parameters used when loading weights.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelParams {
    /// Number of layers to store in VRAM.
    ///
    /// If this number is bigger than the amount of model layers, all layers are loaded to VRAM.
    pub n_gpu_layers: u32,

    /// Use mmap if possible.
    pub use_mmap: bool,

    /// Force system to keep model in RAM.
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
        }
    }
}

/// Parameters used when creating an evaluation context.
#[derive(Clone, Debug, PartialEq)]
pub struct ContextParams {
    /// RNG seed forwarded to the backend.
    pub seed: u32,

    /// Text context window, in tokens.
    pub n_ctx: u32,

    /// Prompt processing maximum batch size.
    pub n_batch: u32,

    /// Max number of sequences; sequence ids must be below this value.
    pub n_seq_max: u32,

    /// Number of threads to use for generation.
    pub n_threads: u32,

    /// Number of threads to use for batch processing.
    pub n_threads_batch: u32,

    /// Whether to use flash attention.
    pub flash_attention: bool,
}

/// A native inference engine.
///
/// Implementations are expected to be internally synchronised: every method takes `&self`
/// and may be called from blocking worker threads. Calls may block for a long time (weights
/// loading, decoding), so the runtime always issues them off the async executor.
///
/// Handles are plain values; freeing a handle twice, or using one after it was freed, is a
/// bug in the caller. This crate guarantees it never does either.
pub trait InferenceBackend: Send + Sync {
    /// Loads weights from `path`.
    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<ModelHandle, BackendError>;

    /// Frees weights previously returned by [`InferenceBackend::load_model`].
    fn free_model(&self, model: ModelHandle);

    /// Returns the number of entries in the model's vocabulary.
    fn vocabulary_size(&self, model: ModelHandle) -> usize;

    /// Creates an evaluation context bound to `model`.
    fn create_context(
        &self,
        model: ModelHandle,
        params: &ContextParams,
    ) -> Result<ContextHandle, BackendError>;

    /// Frees a context previously returned by [`InferenceBackend::create_context`].
    fn free_context(&self, ctx: ContextHandle);

    /// Converts `text` into tokens.
    ///
    /// # Parameters
    ///
    /// * `add_special` - Prepend the beginning-of-sequence token (and any other special
    ///   prefix the model expects).
    /// * `parse_special` - Parse special tokens. If false, special tokens are parsed as if
    ///   they were plain text.
    fn tokenize(
        &self,
        model: ModelHandle,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, BackendError>;

    /// Returns the raw bytes `token` stands for. Multi-byte UTF-8 codepoints may be split
    /// across several tokens.
    fn token_to_piece(&self, model: ModelHandle, token: Token) -> Vec<u8>;

    /// Whether `token` ends generation (EOS, EOT, ...).
    fn is_end_of_generation(&self, model: ModelHandle, token: Token) -> bool;

    /// Decodes `batch` against `ctx`, returning the backend status (`0` on success).
    fn decode(&self, ctx: ContextHandle, batch: &Batch) -> i32;

    /// Returns the logits for the `index`th entry of the last decoded batch, if that entry
    /// requested logits.
    fn logits(&self, ctx: ContextHandle, index: usize) -> Option<Vec<f32>>;

    /// Forgets every token held in the context's KV cache.
    fn clear_kv_cache(&self, ctx: ContextHandle);

    /// Returns the number of tokens currently held in the context's KV cache.
    fn kv_cache_tokens(&self, ctx: ContextHandle) -> usize;

    /// Loads a LoRA adapter for `model` from `path`.
    fn load_adapter(&self, model: ModelHandle, path: &Path) -> Result<AdapterHandle, BackendError>;

    /// Applies `adapter` to `ctx` with the given `scale`.
    fn attach_adapter(
        &self,
        ctx: ContextHandle,
        adapter: AdapterHandle,
        scale: f32,
    ) -> Result<(), BackendError>;

    /// Removes every adapter applied to `ctx`.
    fn clear_adapters(&self, ctx: ContextHandle);

    /// Frees an adapter previously returned by [`InferenceBackend::load_adapter`].
    fn free_adapter(&self, adapter: AdapterHandle);
}
