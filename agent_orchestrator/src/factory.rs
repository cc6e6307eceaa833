//! Concurrency-controlled agent factory.
//!
//! Owns every constructed agent for one configuration generation. Concurrent
//! requests for the same role share a single in-flight build, construction
//! consults the initialization cache first, and a per-role attempt ceiling
//! stops a role that keeps failing from being rebuilt forever. Each build runs
//! on its own task, so a caller giving up never strands it.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{
    Agent, AgentDescriptor, AgentHealth, AgentRole, Availability, DisabledAgent, InferenceAgent,
};
use crate::backend::InferenceBackend;
use crate::cache::AgentInitializationCache;
use crate::error::BuildError;
use crate::recorder::{PerformanceRecorder, PerformanceSample, SampleKind};
use crate::settings::Settings;

type BuildFuture = Shared<BoxFuture<'static, Result<Arc<dyn Agent>, BuildError>>>;

/// The part of [`Settings`] the factory depends on, with roles parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorySettings {
    pub endpoint: String,
    pub default_model: String,
    pub role_models: BTreeMap<AgentRole, String>,
    pub tiers: Vec<Vec<AgentRole>>,
    pub max_parallel_builds: usize,
    pub max_construction_attempts: u32,
    pub build_timeout: Duration,
}

impl FactorySettings {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let role_models = settings
            .inference
            .role_models
            .iter()
            .map(|(role, model)| Ok((role.parse::<AgentRole>()?, model.clone())))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let tiers = settings
            .factory
            .tiers
            .iter()
            .map(|tier| tier.iter().map(|r| r.parse::<AgentRole>()).collect())
            .collect::<Result<Vec<Vec<_>>, _>>()?;

        Ok(Self {
            endpoint: settings.inference.endpoint.clone(),
            default_model: settings.inference.default_model.clone(),
            role_models,
            tiers: normalize_tiers(tiers),
            max_parallel_builds: settings.factory.max_parallel_builds.max(1),
            max_construction_attempts: settings.factory.max_construction_attempts,
            build_timeout: Duration::from_millis(settings.factory.build_timeout_ms),
        })
    }

    /// SHA-256 over endpoint, default model and the sorted override map.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.endpoint.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.default_model.as_bytes());
        for (role, model) in &self.role_models {
            hasher.update([0u8]);
            hasher.update(role.as_str().as_bytes());
            hasher.update(b"=");
            hasher.update(model.as_bytes());
        }
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect()
    }

    pub fn model_for(&self, role: AgentRole) -> Option<&str> {
        let model = self
            .role_models
            .get(&role)
            .map(String::as_str)
            .unwrap_or(&self.default_model);
        (!model.trim().is_empty()).then_some(model)
    }

    pub fn descriptor_for(&self, role: AgentRole) -> Option<AgentDescriptor> {
        self.model_for(role)
            .map(|model| AgentDescriptor::new(role, model, &self.endpoint))
    }

    pub fn tier_of(&self, role: AgentRole) -> usize {
        self.tiers
            .iter()
            .position(|tier| tier.contains(&role))
            .unwrap_or_else(|| self.tiers.len().saturating_sub(1))
    }
}

/// Drop duplicate roles and append unlisted roles to the last tier.
fn normalize_tiers(tiers: Vec<Vec<AgentRole>>) -> Vec<Vec<AgentRole>> {
    let mut seen = Vec::new();
    let mut normalized: Vec<Vec<AgentRole>> = tiers
        .into_iter()
        .map(|tier| {
            tier.into_iter()
                .filter(|role| {
                    if seen.contains(role) {
                        false
                    } else {
                        seen.push(*role);
                        true
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|tier| !tier.is_empty())
        .collect();

    let missing: Vec<AgentRole> = AgentRole::ALL
        .iter()
        .copied()
        .filter(|role| !seen.contains(role))
        .collect();
    match normalized.last_mut() {
        Some(last) => last.extend(missing),
        None => normalized.push(missing),
    }
    normalized
}

/// Emitted when a construction attempt actually starts.
#[derive(Debug, Clone, Serialize)]
pub struct BuildEvent {
    pub sequence: u64,
    pub role: AgentRole,
    pub tier: usize,
    pub attempt: u32,
    pub generation: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Ready,
    Degraded,
    Disabled,
}

impl From<Availability> for BuildStatus {
    fn from(availability: Availability) -> Self {
        match availability {
            Availability::Ready => BuildStatus::Ready,
            Availability::Disabled => BuildStatus::Disabled,
            Availability::Degraded | Availability::Uninitialized => BuildStatus::Degraded,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleOutcome {
    pub role: AgentRole,
    pub tier: usize,
    pub status: BuildStatus,
    pub duration_ms: u64,
}

/// Result of a tiered cold start.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub generation: u64,
    pub outcomes: Vec<RoleOutcome>,
    pub duration_ms: u64,
}

impl BatchReport {
    pub fn count(&self, status: BuildStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConstructedAgent {
    pub role: AgentRole,
    pub model: String,
    pub availability: Availability,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FactoryStatus {
    pub generation: u64,
    pub fingerprint: String,
    pub abandoned: bool,
    pub constructed: Vec<ConstructedAgent>,
    pub pending: Vec<AgentRole>,
    pub attempts: BTreeMap<String, u32>,
}

pub struct AgentFactory {
    settings: FactorySettings,
    fingerprint: String,
    generation: u64,
    backend: Arc<dyn InferenceBackend>,
    cache: Arc<AgentInitializationCache>,
    recorder: Arc<PerformanceRecorder>,
    agents: DashMap<AgentRole, Arc<dyn Agent>>,
    pending: Mutex<HashMap<AgentRole, BuildFuture>>,
    attempts: Mutex<HashMap<AgentRole, u32>>,
    last_used: DashMap<AgentRole, DateTime<Utc>>,
    events: Mutex<Vec<BuildEvent>>,
    build_permits: Semaphore,
    abandoned: AtomicBool,
}

impl AgentFactory {
    pub fn new(
        settings: FactorySettings,
        backend: Arc<dyn InferenceBackend>,
        cache: Arc<AgentInitializationCache>,
        recorder: Arc<PerformanceRecorder>,
        generation: u64,
    ) -> Self {
        let fingerprint = settings.fingerprint();
        let permits = settings.max_parallel_builds.max(1);
        Self {
            settings,
            fingerprint,
            generation,
            backend,
            cache,
            recorder,
            agents: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            last_used: DashMap::new(),
            events: Mutex::new(Vec::new()),
            build_permits: Semaphore::new(permits),
            abandoned: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &FactorySettings {
        &self.settings
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cache(&self) -> &Arc<AgentInitializationCache> {
        &self.cache
    }

    pub fn recorder(&self) -> &Arc<PerformanceRecorder> {
        &self.recorder
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    fn constructed(&self, role: AgentRole) -> Option<Arc<dyn Agent>> {
        self.agents.get(&role).map(|agent| agent.value().clone())
    }

    /// Constructed agent for `role`, building it on first use.
    pub async fn get_agent(self: &Arc<Self>, role: AgentRole) -> Arc<dyn Agent> {
        self.last_used.insert(role, Utc::now());
        match self.constructed(role) {
            Some(agent) => agent,
            None => self.build_agent(role).await,
        }
    }

    /// Build (or join the in-flight build of) `role`. Never fails: problems
    /// produce a disabled or degraded agent.
    #[instrument(skip(self), fields(generation = self.generation))]
    pub async fn build_agent(self: &Arc<Self>, role: AgentRole) -> Arc<dyn Agent> {
        let Some(descriptor) = self.settings.descriptor_for(role) else {
            debug!(%role, "role disabled by configuration");
            return Arc::new(DisabledAgent::disabled(role, "no model configured for this role"));
        };
        let model = descriptor.model.clone();

        match self.build_outcome(role, descriptor).await {
            Ok(agent) => agent,
            Err(e) => {
                warn!(%role, error = %e, "Agent construction failed; serving degraded agent");
                Arc::new(DisabledAgent::degraded(role, model, e.to_string()))
            }
        }
    }

    async fn build_outcome(
        self: &Arc<Self>,
        role: AgentRole,
        descriptor: AgentDescriptor,
    ) -> Result<Arc<dyn Agent>, BuildError> {
        let shared = {
            let mut pending = self.pending.lock();
            if let Some(agent) = self.constructed(role) {
                return Ok(agent);
            }
            match pending.get(&role) {
                Some(build) => {
                    debug!(%role, "joining in-flight build");
                    build.clone()
                }
                None => {
                    let attempt = {
                        let mut attempts = self.attempts.lock();
                        let count = attempts.entry(role).or_insert(0);
                        *count += 1;
                        *count
                    };
                    if attempt > self.settings.max_construction_attempts {
                        error!(
                            %role,
                            attempts = attempt - 1,
                            ceiling = self.settings.max_construction_attempts,
                            "Construction ceiling reached; installing degraded agent"
                        );
                        let agent: Arc<dyn Agent> = Arc::new(DisabledAgent::degraded(
                            role,
                            descriptor.model,
                            "construction attempt ceiling reached",
                        ));
                        self.agents.insert(role, agent.clone());
                        return Ok(agent);
                    }

                    // Spawned so the build settles even if every caller is dropped.
                    let factory = Arc::clone(self);
                    let task = tokio::spawn(factory.run_build(role, descriptor, attempt));
                    let build = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(BuildError::Initialization {
                                role,
                                message: format!("build task failed: {}", e),
                            })
                        })
                    }
                    .boxed()
                    .shared();
                    pending.insert(role, build.clone());
                    build
                }
            }
        };
        shared.await
    }

    async fn run_build(
        self: Arc<Self>,
        role: AgentRole,
        descriptor: AgentDescriptor,
        attempt: u32,
    ) -> Result<Arc<dyn Agent>, BuildError> {
        let Ok(_permit) = self.build_permits.acquire().await else {
            self.pending.lock().remove(&role);
            return Err(BuildError::Abandoned(role));
        };
        if self.is_abandoned() {
            self.pending.lock().remove(&role);
            return Err(BuildError::Abandoned(role));
        }
        self.record_event(role, attempt);

        let started = Instant::now();
        let (result, cache_hit) = self.construct(role, &descriptor).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let sample = PerformanceSample::finished(role.as_str(), SampleKind::Construction, duration_ms)
            .with_cache_hit(cache_hit);
        self.recorder.record(match &result {
            Ok(_) => sample,
            Err(e) => sample.failed(e.to_string()),
        });

        if let Ok(agent) = &result {
            if !self.is_abandoned() {
                self.agents.insert(role, agent.clone());
                self.last_used.insert(role, Utc::now());
            }
            // Only consecutive unsuccessful attempts count toward the ceiling.
            self.attempts.lock().remove(&role);
            info!(%role, duration_ms, cache_hit, attempt, "Agent ready");
        }
        self.pending.lock().remove(&role);
        result
    }

    fn instantiate(&self, descriptor: &AgentDescriptor) -> Arc<dyn Agent> {
        Arc::new(InferenceAgent::new(descriptor.clone(), self.backend.clone()))
    }

    /// Cached path first, full path on miss or failed warm-up. The flag tells
    /// whether the cache served the build.
    async fn construct(
        &self,
        role: AgentRole,
        descriptor: &AgentDescriptor,
    ) -> (Result<Arc<dyn Agent>, BuildError>, bool) {
        if let Some(entry) = self.cache.get(descriptor) {
            let agent = self.instantiate(descriptor);
            agent.mark_initialized_from_cache();
            match self.cache.apply_warmup(agent.as_ref(), &entry) {
                Ok(()) => {
                    debug!(%role, "restored from initialization cache");
                    return (Ok(agent), true);
                }
                Err(e) => {
                    warn!(%role, error = %e, "Warm-up failed; falling back to full construction");
                }
            }
        }

        let agent = self.instantiate(descriptor);
        let started = Instant::now();
        let timeout_ms = self.settings.build_timeout.as_millis() as u64;
        match tokio::time::timeout(self.settings.build_timeout, agent.initialize()).await {
            Ok(Ok(())) => {
                let build_ms = started.elapsed().as_millis() as u64;
                if self.cache.should_cache(role, build_ms) {
                    if let Err(e) = self.cache.set(descriptor, agent.as_ref(), build_ms) {
                        warn!(%role, error = %e, "Could not cache agent build");
                    }
                }
                (Ok(agent), false)
            }
            Ok(Err(e)) => (
                Err(BuildError::Initialization {
                    role,
                    message: e.to_string(),
                }),
                false,
            ),
            Err(_) => (Err(BuildError::Timeout { role, timeout_ms }), false),
        }
    }

    fn record_event(&self, role: AgentRole, attempt: u32) {
        let mut events = self.events.lock();
        let event = BuildEvent {
            sequence: events.len() as u64,
            role,
            tier: self.settings.tier_of(role),
            attempt,
            generation: self.generation,
            at: Utc::now(),
        };
        debug!(%role, sequence = event.sequence, tier = event.tier, "build started");
        events.push(event);
    }

    /// Cold start: build every role tier by tier. A tier starts only after
    /// the previous one settled.
    #[instrument(skip(self), fields(generation = self.generation))]
    pub async fn initialize_all(self: &Arc<Self>) -> BatchReport {
        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(AgentRole::ALL.len());

        for (tier, roles) in self.settings.tiers.iter().enumerate() {
            info!(tier, roles = ?roles, "Initializing agent tier");
            let tier_outcomes: Vec<RoleOutcome> = stream::iter(roles.iter().copied())
                .map(|role| {
                    let factory = Arc::clone(self);
                    async move {
                        let role_started = Instant::now();
                        let agent = factory.build_agent(role).await;
                        RoleOutcome {
                            role,
                            tier,
                            status: agent.availability().into(),
                            duration_ms: role_started.elapsed().as_millis() as u64,
                        }
                    }
                })
                .buffer_unordered(self.settings.max_parallel_builds)
                .collect()
                .await;
            outcomes.extend(tier_outcomes);
        }

        let report = BatchReport {
            generation: self.generation,
            outcomes,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            ready = report.count(BuildStatus::Ready),
            degraded = report.count(BuildStatus::Degraded),
            disabled = report.count(BuildStatus::Disabled),
            duration_ms = report.duration_ms,
            "Agent initialization complete"
        );
        report
    }

    pub fn build_events(&self) -> Vec<BuildEvent> {
        self.events.lock().clone()
    }

    pub fn constructed_roles(&self) -> Vec<AgentRole> {
        let mut roles: Vec<AgentRole> = self.agents.iter().map(|e| *e.key()).collect();
        roles.sort_by_key(|role| role.index());
        roles
    }

    pub fn status(&self) -> FactoryStatus {
        let constructed = self
            .constructed_roles()
            .into_iter()
            .filter_map(|role| {
                let agent = self.constructed(role)?;
                Some(ConstructedAgent {
                    role,
                    model: agent.model().to_string(),
                    availability: agent.availability(),
                    last_used: self.last_used.get(&role).map(|t| *t.value()),
                })
            })
            .collect();
        let mut pending: Vec<AgentRole> = self.pending.lock().keys().copied().collect();
        pending.sort_by_key(|role| role.index());
        let attempts = self
            .attempts
            .lock()
            .iter()
            .map(|(role, count)| (role.to_string(), *count))
            .collect();

        FactoryStatus {
            generation: self.generation,
            fingerprint: self.fingerprint.clone(),
            abandoned: self.is_abandoned(),
            constructed,
            pending,
            attempts,
        }
    }

    /// Health of every constructed agent. Never triggers a build.
    pub fn agent_health(&self) -> Vec<AgentHealth> {
        self.constructed_roles()
            .into_iter()
            .filter_map(|role| self.constructed(role))
            .map(|agent| agent.health())
            .collect()
    }

    /// Drop the constructed agent for `role`. The next use rebuilds it.
    pub fn release(&self, role: AgentRole) -> bool {
        let released = self.agents.remove(&role).is_some();
        if released {
            self.last_used.remove(&role);
            info!(%role, "Agent released");
        }
        released
    }

    /// Release every agent unused for longer than `max_idle`.
    pub fn release_idle(&self, max_idle: Duration) -> Vec<AgentRole> {
        let max_idle =
            chrono::Duration::from_std(max_idle).unwrap_or_else(|_| chrono::Duration::days(3_650));
        let cutoff = Utc::now() - max_idle;
        let idle: Vec<AgentRole> = self
            .constructed_roles()
            .into_iter()
            .filter(|role| {
                self.last_used
                    .get(role)
                    .map(|t| *t.value() < cutoff)
                    .unwrap_or(true)
            })
            .collect();
        idle.into_iter().filter(|role| self.release(*role)).collect()
    }

    pub fn reset_guards(&self) {
        self.attempts.lock().clear();
        info!(generation = self.generation, "Construction guards reset");
    }

    /// Retire this generation: forget pending builds and constructed agents.
    /// Builds already running finish but are not stored.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
        self.pending.lock().clear();
        self.agents.clear();
        self.last_used.clear();
        info!(generation = self.generation, "Factory generation abandoned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OfflineBackend;
    use crate::settings::CacheSettings;

    fn factory_settings() -> FactorySettings {
        FactorySettings::from_settings(&Settings::offline()).unwrap()
    }

    fn factory_with(settings: FactorySettings, backend: Arc<OfflineBackend>) -> Arc<AgentFactory> {
        let cache = Arc::new(AgentInitializationCache::new(CacheSettings {
            persist: false,
            ..CacheSettings::default()
        }));
        Arc::new(AgentFactory::new(
            settings,
            backend,
            cache,
            Arc::new(PerformanceRecorder::default()),
            1,
        ))
    }

    #[test]
    fn unlisted_roles_join_the_last_tier() {
        let tiers = normalize_tiers(vec![
            vec![AgentRole::Retriever, AgentRole::Retriever],
            vec![AgentRole::Critic],
        ]);
        assert_eq!(tiers[0], vec![AgentRole::Retriever]);
        assert_eq!(tiers[1][0], AgentRole::Critic);
        assert_eq!(tiers.iter().map(Vec::len).sum::<usize>(), 10);
    }

    #[test]
    fn fingerprint_tracks_overrides() {
        let base = factory_settings();
        let mut changed = base.clone();
        changed
            .role_models
            .insert(AgentRole::Critic, "other".to_string());
        assert_ne!(base.fingerprint(), changed.fingerprint());
        assert_eq!(base.fingerprint(), factory_settings().fingerprint());
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_build() {
        let backend = Arc::new(
            OfflineBackend::new("offline://test").with_probe_latency(Duration::from_millis(50)),
        );
        let factory = factory_with(factory_settings(), backend.clone());

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let factory = factory.clone();
                tokio::spawn(async move { factory.build_agent(AgentRole::Retriever).await })
            })
            .collect();
        let agents: Vec<Arc<dyn Agent>> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(backend.probe_calls(), 1);
        assert_eq!(factory.build_events().len(), 1);
        assert!(agents.iter().all(|a| Arc::ptr_eq(a, &agents[0])));
        assert!(factory.status().pending.is_empty());
    }

    #[tokio::test]
    async fn failed_builds_are_retried_until_the_ceiling() {
        let backend = Arc::new(OfflineBackend::new("offline://test").with_unavailable_model("llama3"));
        let mut settings = factory_settings();
        settings.max_construction_attempts = 3;
        let factory = factory_with(settings, backend.clone());

        for _ in 0..3 {
            let agent = factory.build_agent(AgentRole::Critic).await;
            assert_eq!(agent.availability(), Availability::Degraded);
            assert!(factory.constructed_roles().is_empty());
        }
        assert_eq!(backend.probe_calls(), 3);

        let guarded = factory.build_agent(AgentRole::Critic).await;
        assert!(guarded.is_initialized());
        assert_eq!(factory.constructed_roles(), vec![AgentRole::Critic]);
        assert_eq!(backend.probe_calls(), 3);

        factory.release(AgentRole::Critic);
        factory.reset_guards();
        factory.build_agent(AgentRole::Critic).await;
        assert_eq!(backend.probe_calls(), 4);
    }

    #[tokio::test]
    async fn disabled_roles_are_not_built() {
        let backend = Arc::new(OfflineBackend::new("offline://test"));
        let mut settings = factory_settings();
        settings.role_models.insert(AgentRole::Critic, String::new());
        let factory = factory_with(settings, backend.clone());

        let agent = factory.get_agent(AgentRole::Critic).await;
        assert!(!agent.is_initialized());
        assert_eq!(agent.availability(), Availability::Disabled);
        assert_eq!(backend.probe_calls(), 0);
        assert!(factory.build_events().is_empty());
    }

    #[tokio::test]
    async fn slow_initialization_times_out() {
        let backend = Arc::new(
            OfflineBackend::new("offline://test").with_probe_latency(Duration::from_millis(200)),
        );
        let mut settings = factory_settings();
        settings.build_timeout = Duration::from_millis(20);
        let factory = factory_with(settings, backend);

        let agent = factory.build_agent(AgentRole::Reranker).await;
        assert_eq!(agent.availability(), Availability::Degraded);
        let samples = factory.recorder().samples();
        assert_eq!(samples.len(), 1);
        assert!(!samples[0].success);
    }

    #[tokio::test]
    async fn slow_builds_are_restored_from_cache_next_generation() {
        let backend = Arc::new(
            OfflineBackend::new("offline://test").with_probe_latency(Duration::from_millis(30)),
        );
        let cache = Arc::new(AgentInitializationCache::new(CacheSettings {
            persist: false,
            min_build_ms: 10,
            ..CacheSettings::default()
        }));
        let recorder = Arc::new(PerformanceRecorder::default());
        let first = Arc::new(AgentFactory::new(
            factory_settings(),
            backend.clone(),
            cache.clone(),
            recorder.clone(),
            1,
        ));
        first.build_agent(AgentRole::Embedder).await;
        assert_eq!(cache.len(), 1);

        let second = Arc::new(AgentFactory::new(factory_settings(), backend.clone(), cache, recorder.clone(), 2));
        let agent = second.build_agent(AgentRole::Embedder).await;
        assert!(agent.is_initialized());
        assert_eq!(backend.probe_calls(), 1);
        assert!(recorder.samples().last().unwrap().cache_hit);
    }

    #[tokio::test]
    async fn idle_agents_are_released() {
        let factory = factory_with(factory_settings(), Arc::new(OfflineBackend::new("offline://test")));
        factory.get_agent(AgentRole::Critic).await;
        factory.get_agent(AgentRole::Reranker).await;

        assert!(factory.release_idle(Duration::from_secs(60)).is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        factory.get_agent(AgentRole::Critic).await;

        let released = factory.release_idle(Duration::from_millis(10));
        assert_eq!(released, vec![AgentRole::Reranker]);
        assert_eq!(factory.constructed_roles(), vec![AgentRole::Critic]);
    }

    #[tokio::test]
    async fn abandoned_factory_keeps_nothing() {
        let factory = factory_with(factory_settings(), Arc::new(OfflineBackend::new("offline://test")));
        factory.build_agent(AgentRole::Critic).await;
        factory.abandon();
        assert!(factory.constructed_roles().is_empty());
        assert!(factory.status().abandoned);

        let agent = factory.build_agent(AgentRole::Critic).await;
        assert_eq!(agent.availability(), Availability::Degraded);
        assert!(factory.constructed_roles().is_empty());
    }

    #[tokio::test]
    async fn dropped_caller_does_not_strand_its_build() {
        let backend = Arc::new(
            OfflineBackend::new("offline://test").with_probe_latency(Duration::from_millis(100)),
        );
        let mut settings = factory_settings();
        settings.max_parallel_builds = 1;
        let factory = factory_with(settings, backend.clone());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), factory.build_agent(AgentRole::Retriever))
                .await;
        assert!(abandoned.is_err());

        let critic = tokio::time::timeout(Duration::from_secs(2), factory.build_agent(AgentRole::Critic))
            .await
            .expect("critic build should not wait on a stranded permit");
        assert_eq!(critic.availability(), Availability::Ready);

        let status = factory.status();
        assert!(status.pending.is_empty());
        assert_eq!(
            factory.constructed_roles(),
            vec![AgentRole::Retriever, AgentRole::Critic]
        );
        assert_eq!(backend.probe_calls(), 2);
    }

    #[tokio::test]
    async fn release_and_rebuild_cycles_stay_ready() {
        let backend = Arc::new(OfflineBackend::new("offline://test"));
        let factory = factory_with(factory_settings(), backend.clone());

        for _ in 0..15 {
            let agent = factory.get_agent(AgentRole::Critic).await;
            assert_eq!(agent.availability(), Availability::Ready);
            assert!(factory.release(AgentRole::Critic));
        }
        assert_eq!(backend.probe_calls(), 15);
        assert!(factory.status().attempts.is_empty());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn ceiling_trip_is_logged_as_an_error() {
        let backend = Arc::new(OfflineBackend::new("offline://test").with_unavailable_model("llama3"));
        let mut settings = factory_settings();
        settings.max_construction_attempts = 1;
        let factory = factory_with(settings, backend);

        factory.build_agent(AgentRole::TaskPlanner).await;
        factory.build_agent(AgentRole::TaskPlanner).await;

        assert!(logs_contain("Construction ceiling reached"));
        assert_eq!(factory.status().attempts["task_planner"], 2);
    }
}
