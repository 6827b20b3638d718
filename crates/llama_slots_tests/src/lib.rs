//! Test harness for [`llama_slots`].
//!
//! Instead of real GGUF models, the tests drive the runtime with a [`ScriptedBackend`], whose
//! "weights" are any existing file and whose replies are scripted per turn.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use llama_slots::{Config, ConversationMessage, PromptFormatter, SlotRuntime};

pub mod mock;

pub use mock::{Counters, ScriptedBackend};

/// Formats messages as one `role: content` line each.
pub struct LineFormatter;

impl PromptFormatter for LineFormatter {
    fn format(&self, messages: &[ConversationMessage], system_prompt: Option<&str>) -> String {
        let mut prompt = String::new();

        if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
            prompt.push_str("system: ");
            prompt.push_str(system);
            prompt.push('\n');
        }

        for message in messages {
            prompt.push_str(&format!("{}: {}\n", message.role(), message.content()));
        }

        prompt
    }
}

/// A small, deterministic configuration: greedy sampling and near-instant settle delays.
pub fn test_config() -> Config {
    Config {
        context_size: 256,
        batch_size: 32,
        max_tokens: 64,
        temperature: 0.0,
        seed: Some(42),
        history_length: 4,
        sentence_min_length: 5,
        adapter_settle_ms: 1,
        scheduler_tick_ms: 5,
        action_timeout_ms: 5_000,
        batch_timeout_ms: 10_000,
        ..Config::default()
    }
}

/// A runtime over a [`ScriptedBackend`], with a scratch directory for weight files.
pub struct Harness {
    /// The scripted backend, for failure injection and counters.
    pub backend: Arc<ScriptedBackend>,

    /// The runtime under test.
    pub runtime: SlotRuntime,

    dir: TempDir,
}

impl Harness {
    /// A harness with [`test_config`].
    pub fn new(backend: ScriptedBackend) -> Self {
        Self::with_config(backend, test_config())
    }

    /// A harness with a custom configuration.
    pub fn with_config(backend: ScriptedBackend, config: Config) -> Self {
        let backend = Arc::new(backend);
        let runtime = SlotRuntime::new(backend.clone(), config, Arc::new(LineFormatter));
        let dir = tempfile::tempdir().unwrap();

        Self {
            backend,
            runtime,
            dir,
        }
    }

    /// Writes a weights file called `name` and returns its path.
    pub fn model(&self, name: &str) -> PathBuf {
        self.file(name, b"weights")
    }

    /// Writes a file called `name` with `contents` and returns its path.
    pub fn file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// A path inside the scratch directory that does not exist.
    pub fn missing(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

#[cfg(test)]
mod generation;
#[cfg(test)]
mod registry;
#[cfg(test)]
mod scheduling;
#[cfg(test)]
mod sessions;
