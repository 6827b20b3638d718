//! Implements [`Config`], the process-wide tunables read by sessions, the generator and the
//! scheduler.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A [`Config`] shared between every component of a runtime.
///
/// Sessions take a snapshot when they build a context or a sampler, so changes made here
/// only apply to contexts and samplers built afterwards.
pub type SharedConfig = Arc<RwLock<Config>>;

/// An error raised while loading or validating a [`Config`].
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML, or has fields of the wrong type.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration is well-formed but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Context window, in tokens. Contexts are built with room for one extra batch on top.
    pub context_size: u32,

    /// Prompt processing batch size.
    pub batch_size: u32,

    /// Sampling temperature; `0.0` selects greedy sampling.
    pub temperature: f32,

    /// 1.0 = disabled
    pub top_p: f32,

    /// 0.0 = disabled
    pub min_p: f32,

    /// DRY repetition penalty multiplier, 0.0 = disabled
    pub dry_multiplier: f32,

    /// DRY exponential base.
    pub dry_base: f32,

    /// Repetitions shorter than this are not penalised by DRY.
    pub dry_allowed_length: u32,

    /// How many tokens DRY looks back (-1 = context size, 0 = disabled).
    pub dry_penalty_last_n: i32,

    /// Sampling seed; `None` picks a random one each time a sampler is built.
    pub seed: Option<u64>,

    /// Maximum number of tokens generated per turn.
    pub max_tokens: u32,

    /// Number of past messages replayed when a fresh context is primed.
    pub history_length: usize,

    /// Scale applied to LoRA adapters.
    pub lora_scale: f32,

    /// Number of layers to offload to the GPU when loading weights.
    pub gpu_layers: u32,

    /// Whether contexts are created with flash attention.
    pub flash_attention: bool,

    /// Minimum length of a unit emitted by the sentence filter.
    pub sentence_min_length: usize,

    /// Session id used for chat actions.
    pub chat_session_id: String,

    /// Session id used for thinking actions.
    pub thinking_session_id: String,

    /// How long to let native resources settle after cancelling for an adapter switch.
    pub adapter_settle_ms: u64,

    /// Scheduler settle-loop tick.
    pub scheduler_tick_ms: u64,

    /// Wall-clock ceiling for a single streaming action.
    pub action_timeout_ms: u64,

    /// Wall-clock ceiling for a whole batch of scheduled actions.
    pub batch_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            context_size: 2048,
            batch_size: 512,
            temperature: 0.7,
            top_p: 0.9,
            min_p: 0.05,
            dry_multiplier: 0.8,
            dry_base: 1.75,
            dry_allowed_length: 2,
            dry_penalty_last_n: -1,
            seed: None,
            max_tokens: 512,
            history_length: 10,
            lora_scale: 1.0,
            gpu_layers: 99,
            flash_attention: false,
            sentence_min_length: 20,
            chat_session_id: "chat".to_string(),
            thinking_session_id: "thinking".to_string(),
            adapter_settle_ms: 300,
            scheduler_tick_ms: 50,
            action_timeout_ms: 120_000,
            batch_timeout_ms: 300_000,
        }
    }
}

impl Config {
    /// Parses a TOML document. Missing fields take their default value.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Checks the invariants the runtime relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context_size == 0 {
            return Err(ConfigError::Invalid("context_size must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be positive".into()));
        }
        if self.batch_size + self.max_tokens >= self.context_size {
            return Err(ConfigError::Invalid(format!(
                "batch_size ({}) + max_tokens ({}) leaves no room in a {} token context",
                self.batch_size, self.max_tokens, self.context_size
            )));
        }
        if self.temperature < 0.0 {
            return Err(ConfigError::Invalid("temperature cannot be negative".into()));
        }
        if !(0.0..=1.0).contains(&self.top_p) || !(0.0..=1.0).contains(&self.min_p) {
            return Err(ConfigError::Invalid("top_p and min_p must lie in [0, 1]".into()));
        }
        if self.chat_session_id == self.thinking_session_id {
            return Err(ConfigError::Invalid(
                "chat and thinking sessions need distinct ids".into(),
            ));
        }

        Ok(())
    }

    /// Wraps this configuration for sharing.
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    /// Returns the adapter settle delay.
    pub fn adapter_settle(&self) -> Duration {
        Duration::from_millis(self.adapter_settle_ms)
    }

    /// Returns the scheduler tick.
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(1))
    }

    /// Returns the per-action ceiling.
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    /// Returns the per-batch ceiling.
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

/// Takes a point-in-time copy of a [`SharedConfig`].
pub(crate) fn snapshot(config: &SharedConfig) -> Config {
    config.read().unwrap_or_else(PoisonError::into_inner).clone()
}
