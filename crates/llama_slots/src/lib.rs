//! A multi-slot inference runtime for Large Language Models (LLMs), built around
//! [llama.cpp][llama.cpp]-style backends.
//!
//! Several named _sessions_ (slots) share one copy of a model's weights, each with its own
//! evaluation context. Sessions stream text through pluggable [`TokenFilter`]s, roll their
//! context over before it overflows, hot-swap LoRA adapters, and are driven either directly
//! or through the dependency-aware [`ActionScheduler`].
//!
//! The runtime never performs tensor math itself: everything native goes through an
//! [`InferenceBackend`]. Enable the `llama` feature for [`llama::LlamaBackend`], which builds
//! llama.cpp from source.
//!
//! ```no_run
//! # #[cfg(feature = "llama")]
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//!
//! use llama_slots::llama::LlamaBackend;
//! use llama_slots::{ConversationMessage, PassthroughFilter, PromptFormatter, SlotRuntime};
//!
//! struct Plain;
//!
//! impl PromptFormatter for Plain {
//!     fn format(&self, messages: &[ConversationMessage], system: Option<&str>) -> String {
//!         let mut prompt = system.map(|s| format!("{s}\n")).unwrap_or_default();
//!         for message in messages {
//!             prompt.push_str(message.content());
//!             prompt.push('\n');
//!         }
//!         prompt
//!     }
//! }
//!
//! let runtime = SlotRuntime::new(
//!     Arc::new(LlamaBackend::new()),
//!     llama_slots::Config::load("slots.toml")?,
//!     Arc::new(Plain),
//! );
//!
//! // The first session created becomes the default one.
//! let chat = runtime.registry().load_session("chat", "path_to_model.gguf".as_ref()).await?;
//!
//! let mut response = runtime.generator().generate(
//!     &chat,
//!     &[],
//!     "You are a helpful assistant.",
//!     ConversationMessage::user("Tell me a story about a man named Stanley."),
//!     Box::new(PassthroughFilter),
//! );
//!
//! while let Some(text) = response.next_unit().await {
//!     print!("{text}");
//! }
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! Every component logs through [`tracing`][tracing]; the llama.cpp backend also re-routes
//! GGML and llama.cpp logs there under the `llama.cpp` target. If you're getting stuck,
//! setting up [`tracing`][tracing] for more debug information should be at the top of your
//! troubleshooting list!
//!
//! ## License
//!
//! MIT or Apache 2.0 (the "Rust" license), at your option.
//!
//! [tracing]: https://docs.rs/tracing/latest/tracing/
//! [llama.cpp]: https://github.com/ggerganov/llama.cpp/

#![warn(missing_docs)]

pub mod backend;
pub mod batch;
pub mod config;
pub mod generator;
#[cfg(feature = "llama")]
pub mod llama;
pub mod message;
pub mod registry;
mod runtime;
pub mod scheduler;
pub mod session;
pub mod standard_sampler;
pub mod weights;

pub use backend::{
    AdapterHandle, BackendError, ContextHandle, ContextParams, InferenceBackend, ModelHandle,
    ModelParams,
};
pub use config::{Config, ConfigError, SharedConfig};
pub use generator::{
    FullResponseFilter, PassthroughFilter, PromptFormatter, ResponseGenerator, ResponseStream,
    SentenceFilter, TokenFilter, TurnOutcome,
};
pub use message::{ConversationMessage, MessageCategory, Role};
pub use registry::{ContextLease, RegistryError, SessionRegistry};
pub use runtime::SlotRuntime;
pub use scheduler::{
    ActionNode, ActionOutput, ActionResult, ActionScheduler, PreparedAction, SchedulerError,
    SessionKind,
};
pub use session::{Session, SessionError, SessionHandle, SessionState, StopReason};
pub use weights::{WeightsHandle, WeightsLoadError, WeightsRegistry};

/// A single token produced or consumed by a model.
///
/// Token ids are only meaningful for the vocabulary they came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Token(pub i32);

/// Identifies the sequence a batch entry belongs to within a context.
pub type SequenceId = i32;

/// Picks the next token from a model's output.
pub trait Sampler: Send {
    /// Selects a token among `candidates`, given every token already in the context.
    ///
    /// Returns `None` if no candidate survives the sampler's filters.
    fn sample(
        &mut self,
        candidates: standard_sampler::Candidates,
        history: &[Token],
    ) -> Option<Token>;
}
