//! Core coordinator wiring the factory, preloader and pipeline together.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use crate::agent::{AgentHealth, AgentRole};
use crate::cache::CacheStats;
use crate::context::OrchestratorContext;
use crate::factory::{AgentFactory, BatchReport, FactoryStatus};
use crate::pipeline::{default_stages, PipelineExecutor, PipelineResult};
use crate::preloader::{AdaptivePreloader, PreloadReport, PreloadState, PreloadStrategy};
use crate::recorder::{LoadLevel, PerformanceSnapshot};
use crate::settings::Settings;

/// Everything an operator wants to see at once.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub factory: FactoryStatus,
    pub agents: Vec<AgentHealth>,
    pub cache: CacheStats,
    pub preload: PreloadState,
    pub preload_running: bool,
    pub performance: PerformanceSnapshot,
    pub recommendations: Vec<String>,
}

pub struct Orchestrator {
    settings: Settings,
    context: Arc<OrchestratorContext>,
    factory: Arc<AgentFactory>,
    executor: PipelineExecutor,
    preloader: Arc<AdaptivePreloader>,
}

impl Orchestrator {
    pub fn new(settings: Settings) -> Result<Self> {
        let context = Arc::new(OrchestratorContext::from_settings(&settings));
        Self::with_context(settings, context)
    }

    /// Build on an existing context, reusing its factory when the
    /// configuration fingerprint is unchanged.
    #[instrument(skip_all)]
    pub fn with_context(settings: Settings, context: Arc<OrchestratorContext>) -> Result<Self> {
        let factory = context.factory_for(&settings)?;
        let executor = PipelineExecutor::new(
            default_stages(&settings.pipeline),
            factory.clone(),
            context.recorder().clone(),
            &settings.pipeline,
        )
        .context("invalid pipeline definition")?;
        let preloader = Arc::new(AdaptivePreloader::new(factory.clone(), &settings)?);

        info!(
            generation = factory.generation(),
            endpoint = %settings.inference.endpoint,
            "Orchestrator ready"
        );
        Ok(Self {
            settings,
            context,
            factory,
            executor,
            preloader,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn context(&self) -> &Arc<OrchestratorContext> {
        &self.context
    }

    pub fn factory(&self) -> &Arc<AgentFactory> {
        &self.factory
    }

    pub fn preloader(&self) -> &Arc<AdaptivePreloader> {
        &self.preloader
    }

    pub fn executor(&self) -> &PipelineExecutor {
        &self.executor
    }

    /// Schedule the background warm-up if preloading is enabled.
    pub fn start_background(&self) -> bool {
        self.settings.preload.enabled && self.preloader.start()
    }

    pub async fn execute(&self, query: &str) -> PipelineResult {
        self.executor.execute(query).await
    }

    pub async fn initialize_all(&self) -> BatchReport {
        self.factory.initialize_all().await
    }

    /// Preload with an explicit strategy, or the current one.
    pub async fn preload(&self, strategy: Option<PreloadStrategy>) -> PreloadReport {
        let strategy = strategy.unwrap_or(self.preloader.state().strategy);
        let candidates = self.preloader.select_candidates(strategy);
        self.preloader.preload(&candidates).await
    }

    /// Retune the preloader, from `load` or from recorded performance.
    pub fn adapt(&self, load: Option<LoadLevel>) -> PreloadState {
        match load {
            Some(load) => self.preloader.adapt(load),
            None => self.preloader.adapt_from_recorder(self.context.recorder()),
        }
    }

    pub async fn load_agent(&self, role: AgentRole) -> AgentHealth {
        self.factory.get_agent(role).await.health()
    }

    pub fn unload_agent(&self, role: AgentRole) -> bool {
        self.factory.release(role)
    }

    pub fn release_idle(&self, max_idle: Duration) -> Vec<AgentRole> {
        self.factory.release_idle(max_idle)
    }

    pub fn status(&self) -> OrchestratorStatus {
        let recorder = self.context.recorder();
        OrchestratorStatus {
            factory: self.factory.status(),
            agents: self.factory.agent_health(),
            cache: self.context.cache().stats(),
            preload: self.preloader.state(),
            preload_running: self.preloader.is_running(),
            performance: recorder.snapshot(),
            recommendations: recorder.recommendations(),
        }
    }

    pub async fn shutdown(&self) {
        self.preloader.shutdown().await;
        info!("Orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OfflineBackend;

    fn orchestrator() -> Orchestrator {
        let settings = Settings::offline();
        let context = Arc::new(
            OrchestratorContext::from_settings(&settings)
                .with_backend(Arc::new(OfflineBackend::new("offline://test"))),
        );
        Orchestrator::with_context(settings, context).unwrap()
    }

    #[tokio::test]
    async fn full_pipeline_runs_offline() {
        let orchestrator = orchestrator();
        let result = orchestrator.execute("how do rust lifetimes work").await;

        assert!(!result.aborted, "failures: {:?}", result.failures);
        assert_eq!(result.completed_stages.len(), 10);
        assert!(result.answer.is_some());
        assert!(result.documents.is_some());
        assert!(result.confidence > 0.0 && result.confidence <= 1.0);
        assert_eq!(orchestrator.factory().constructed_roles().len(), 10);
    }

    #[tokio::test]
    async fn status_reports_without_building() {
        let orchestrator = orchestrator();
        let status = orchestrator.status();
        assert!(status.factory.constructed.is_empty());
        assert!(status.agents.is_empty());

        orchestrator.load_agent(AgentRole::Critic).await;
        let status = orchestrator.status();
        assert_eq!(status.agents.len(), 1);
        assert!(orchestrator.unload_agent(AgentRole::Critic));
    }
}
