//! The native resources a session owns while its context is live.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{ContextHandle, InferenceBackend, ModelHandle};
use crate::batch::Batch;
use crate::standard_sampler::{StandardSampler, DRY_SEQUENCE_BREAKERS};
use crate::{Config, Sampler, Token};

/// A backend context together with the decode batch and sampler bound to it.
///
/// Everything in here is exclusively owned by one session. Dropping it clears the KV cache
/// and frees the backend context.
pub(crate) struct LiveContext {
    backend: Arc<dyn InferenceBackend>,
    pub(crate) handle: ContextHandle,

    /// The persistent decode batch, reset before every decode.
    pub(crate) batch: Batch,

    pub(crate) sampler: Box<dyn Sampler>,

    /// The configuration this context was built with.
    pub(crate) config: Config,
}

impl LiveContext {
    pub(crate) fn new(
        backend: Arc<dyn InferenceBackend>,
        handle: ContextHandle,
        model: ModelHandle,
        config: Config,
    ) -> Self {
        let batch = Batch::new(config.context_size as usize, 1);
        let sampler = build_sampler(backend.as_ref(), model, &config);

        Self {
            backend,
            handle,
            batch,
            sampler,
            config,
        }
    }

    /// Replaces the sampler with one built from `config`. The previous chain is dropped
    /// before the new one is built.
    pub(crate) fn rebuild_sampler(&mut self, model: ModelHandle, config: Config) {
        self.sampler = Box::new(StandardSampler::new_greedy());
        self.sampler = build_sampler(self.backend.as_ref(), model, &config);

        // The window is fixed for the lifetime of the backend context.
        self.config = Config {
            context_size: self.config.context_size,
            batch_size: self.config.batch_size,
            ..config
        };
    }

    /// The number of tokens the context window holds, including the batch reserve.
    pub(crate) fn window(&self) -> usize {
        (self.config.context_size + self.config.batch_size) as usize
    }
}

impl Drop for LiveContext {
    fn drop(&mut self) {
        debug!(ctx = self.handle.0, "Freeing context");
        self.backend.clear_kv_cache(self.handle);
        self.backend.free_context(self.handle);
    }
}

fn build_sampler(
    backend: &dyn InferenceBackend,
    model: ModelHandle,
    config: &Config,
) -> Box<dyn Sampler> {
    let breakers = sequence_breakers(backend, model);
    let sampler = StandardSampler::from_config(config, breakers);
    info!(
        temperature = config.temperature,
        seed = sampler.seed(),
        stages = sampler.stages().len(),
        "Built sampler"
    );

    Box::new(sampler)
}

/// Tokenizes the DRY sequence breakers with the model's vocabulary.
fn sequence_breakers(backend: &dyn InferenceBackend, model: ModelHandle) -> Option<Vec<Token>> {
    if backend.vocabulary_size(model) == 0 {
        return None;
    }

    let mut tokens = Vec::new();
    for breaker in DRY_SEQUENCE_BREAKERS {
        match backend.tokenize(model, breaker, false, false) {
            Ok(pieces) => tokens.extend(pieces),
            Err(err) => {
                warn!("Could not tokenize DRY sequence breaker {breaker:?}: {err}");
                return None;
            }
        }
    }

    Some(tokens)
}
