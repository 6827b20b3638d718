//! Derives backend [`ContextParams`] from a [`Config`] snapshot.

use crate::backend::{ContextParams, ModelParams};
use crate::{Config, SequenceId};

/// The number of threads a context decodes with: two cores are left to the host, and more
/// than eight rarely helps token generation.
pub fn default_thread_count() -> u32 {
    thread_count_for(num_cpus::get())
}

fn thread_count_for(cpus: usize) -> u32 {
    cpus.saturating_sub(2).clamp(1, 8) as u32
}

impl ContextParams {
    /// Builds the parameters for a context owned by the session holding `sequence_id`.
    ///
    /// The window reserves one batch on top of the configured context size, and the context
    /// accepts enough sequences for `sequence_id` to be valid inside it.
    pub fn for_session(config: &Config, sequence_id: SequenceId) -> Self {
        let threads = default_thread_count();

        Self {
            seed: config.seed.map_or(u32::MAX, |seed| seed as u32),
            n_ctx: config.context_size + config.batch_size,
            n_batch: config.batch_size,
            n_seq_max: sequence_id.max(0) as u32 + 1,
            n_threads: threads,
            n_threads_batch: threads,
            flash_attention: config.flash_attention,
        }
    }
}

impl ModelParams {
    /// Builds weight loading parameters from a [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self {
            n_gpu_layers: config.gpu_layers,
            ..Self::default()
        }
    }
}
