//! Explicitly threaded owner of the current agent factory.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::backend::{self, InferenceBackend};
use crate::cache::AgentInitializationCache;
use crate::factory::{AgentFactory, FactorySettings};
use crate::recorder::PerformanceRecorder;
use crate::settings::Settings;

/// Holds at most one live factory. Asking for a factory under a different
/// configuration fingerprint retires the old generation.
pub struct OrchestratorContext {
    backend_override: Option<Arc<dyn InferenceBackend>>,
    cache: Arc<AgentInitializationCache>,
    recorder: Arc<PerformanceRecorder>,
    current: Mutex<Option<Arc<AgentFactory>>>,
    generation: AtomicU64,
}

impl OrchestratorContext {
    pub fn new(cache: Arc<AgentInitializationCache>, recorder: Arc<PerformanceRecorder>) -> Self {
        Self {
            backend_override: None,
            cache,
            recorder,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            Arc::new(AgentInitializationCache::new(settings.cache.clone())),
            Arc::new(PerformanceRecorder::default()),
        )
    }

    /// Use `backend` for every factory instead of the configured transport.
    pub fn with_backend(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.backend_override = Some(backend);
        self
    }

    pub fn cache(&self) -> &Arc<AgentInitializationCache> {
        &self.cache
    }

    pub fn recorder(&self) -> &Arc<PerformanceRecorder> {
        &self.recorder
    }

    pub fn current(&self) -> Option<Arc<AgentFactory>> {
        self.current.lock().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// The factory for `settings`, reused while the fingerprint matches.
    pub fn factory_for(&self, settings: &Settings) -> Result<Arc<AgentFactory>> {
        let factory_settings = FactorySettings::from_settings(settings)?;
        let fingerprint = factory_settings.fingerprint();

        let mut current = self.current.lock();
        if let Some(factory) = current.as_ref() {
            if factory.fingerprint() == fingerprint {
                return Ok(factory.clone());
            }
            info!(
                old_generation = factory.generation(),
                "Configuration changed; retiring agent factory"
            );
            factory.abandon();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let backend = self
            .backend_override
            .clone()
            .unwrap_or_else(|| backend::from_config(&settings.inference));
        let factory = Arc::new(AgentFactory::new(
            factory_settings,
            backend,
            self.cache.clone(),
            self.recorder.clone(),
            generation,
        ));
        info!(generation, fingerprint = %&fingerprint[..12], "Agent factory created");
        *current = Some(factory.clone());
        Ok(factory)
    }

    /// Clear construction guard counters on the live factory.
    pub fn reset(&self) {
        if let Some(factory) = self.current() {
            factory.reset_guards();
        }
    }

    /// Retire the live factory and clear the initialization cache.
    pub fn reset_all(&self) {
        if let Some(factory) = self.current.lock().take() {
            factory.reset_guards();
            factory.abandon();
        }
        self.cache.clear();
        info!("Orchestrator context reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OfflineBackend;

    fn context() -> OrchestratorContext {
        OrchestratorContext::from_settings(&Settings::offline())
            .with_backend(Arc::new(OfflineBackend::new("offline://test")))
    }

    #[test]
    fn same_configuration_reuses_the_factory() {
        let context = context();
        let settings = Settings::offline();
        let a = context.factory_for(&settings).unwrap();
        let b = context.factory_for(&settings).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(context.generation(), 1);
    }

    #[test]
    fn changed_configuration_starts_a_new_generation() {
        let context = context();
        let mut settings = Settings::offline();
        let first = context.factory_for(&settings).unwrap();

        settings.inference.default_model = "mistral".to_string();
        let second = context.factory_for(&settings).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_abandoned());
        assert_eq!(second.generation(), 2);
    }

    #[tokio::test]
    async fn reset_all_drops_the_factory() {
        let context = context();
        let settings = Settings::offline();
        let factory = context.factory_for(&settings).unwrap();
        factory.build_agent(crate::agent::AgentRole::Critic).await;

        context.reset_all();
        assert!(context.current().is_none());
        assert!(factory.constructed_roles().is_empty());

        let next = context.factory_for(&settings).unwrap();
        assert_eq!(next.generation(), 2);
    }
}
