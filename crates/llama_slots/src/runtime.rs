//! Wires the registries, the generator and the scheduler together.

use std::sync::Arc;

use tracing::info;

use crate::backend::{InferenceBackend, ModelParams};
use crate::config::snapshot;
use crate::generator::{PromptFormatter, ResponseGenerator};
use crate::registry::SessionRegistry;
use crate::scheduler::ActionScheduler;
use crate::weights::WeightsRegistry;
use crate::{Config, SharedConfig};

/// Every component of a runtime, sharing one backend and one [`Config`].
#[derive(Clone)]
pub struct SlotRuntime {
    config: SharedConfig,
    weights: Arc<WeightsRegistry>,
    registry: SessionRegistry,
    generator: ResponseGenerator,
    scheduler: ActionScheduler,
}

impl SlotRuntime {
    /// Builds a runtime over `backend`.
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        config: Config,
        formatter: Arc<dyn PromptFormatter>,
    ) -> Self {
        Self::with_shared_config(backend, config.into_shared(), formatter)
    }

    /// Builds a runtime whose configuration can be changed at runtime through `config`.
    ///
    /// Changes apply to contexts and samplers built afterwards.
    pub fn with_shared_config(
        backend: Arc<dyn InferenceBackend>,
        config: SharedConfig,
        formatter: Arc<dyn PromptFormatter>,
    ) -> Self {
        let model_params = ModelParams::from_config(&snapshot(&config));
        let weights = Arc::new(WeightsRegistry::new(backend.clone(), model_params));
        let registry = SessionRegistry::new(backend, weights.clone(), config.clone());
        let generator = ResponseGenerator::new(formatter, config.clone());
        let scheduler = ActionScheduler::new(registry.clone(), generator.clone(), config.clone());

        Self {
            config,
            weights,
            registry,
            generator,
            scheduler,
        }
    }

    /// The shared configuration.
    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// The weights registry.
    pub fn weights(&self) -> &Arc<WeightsRegistry> {
        &self.weights
    }

    /// The session registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// The response generator.
    pub fn generator(&self) -> &ResponseGenerator {
        &self.generator
    }

    /// The action scheduler.
    pub fn scheduler(&self) -> &ActionScheduler {
        &self.scheduler
    }

    /// Cancels outstanding actions and unloads every session, releasing all weights.
    pub async fn shutdown(&self) {
        self.scheduler.cancel_all();
        self.registry.unload_all().await;

        info!(
            weights = self.weights.list_loaded().len(),
            "Runtime shut down"
        );
    }
}
