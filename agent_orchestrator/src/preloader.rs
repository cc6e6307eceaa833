//! Background warm-up of the agents most likely to be needed.

use anyhow::{anyhow, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::agent::AgentRole;
use crate::factory::{AgentFactory, RoleOutcome};
use crate::recorder::{LoadLevel, PerformanceRecorder};
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PreloadStrategy {
    Aggressive,
    Balanced,
    Conservative,
}

impl PreloadStrategy {
    fn min_probability(self) -> f64 {
        match self {
            PreloadStrategy::Aggressive => 0.1,
            PreloadStrategy::Balanced => 0.6,
            PreloadStrategy::Conservative => 0.7,
        }
    }

    fn cap(self) -> usize {
        match self {
            PreloadStrategy::Aggressive => 8,
            PreloadStrategy::Balanced => 5,
            PreloadStrategy::Conservative => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PreloadStrategy::Aggressive => "aggressive",
            PreloadStrategy::Balanced => "balanced",
            PreloadStrategy::Conservative => "conservative",
        }
    }
}

impl fmt::Display for PreloadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreloadStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aggressive" => Ok(PreloadStrategy::Aggressive),
            "balanced" => Ok(PreloadStrategy::Balanced),
            "conservative" => Ok(PreloadStrategy::Conservative),
            other => Err(anyhow!("unknown preload strategy '{}'", other)),
        }
    }
}

/// Prior probability that a request needs `role`.
pub fn usage_probability(role: AgentRole) -> f64 {
    match role {
        AgentRole::Retriever => 0.95,
        AgentRole::ReasoningGenerator => 0.90,
        AgentRole::QueryRewriter => 0.85,
        AgentRole::Embedder => 0.80,
        AgentRole::Reranker => 0.70,
        AgentRole::Critic => 0.60,
        AgentRole::ChunkScorer => 0.50,
        AgentRole::TaskPlanner => 0.45,
        AgentRole::ToolSelector => 0.30,
        AgentRole::ActionCaller => 0.20,
    }
}

/// Source of the system memory usage fraction.
pub trait MemoryProbe: Send + Sync {
    /// Used fraction in [0, 1], or `None` when unknown.
    fn used_fraction(&self) -> Option<f64>;
}

/// Reads `MemTotal` and `MemAvailable` from `/proc/meminfo`.
pub struct ProcMeminfo;

impl MemoryProbe for ProcMeminfo {
    fn used_fraction(&self) -> Option<f64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let field = |name: &str| -> Option<f64> {
            meminfo
                .lines()
                .find(|line| line.starts_with(name))?
                .split_whitespace()
                .nth(1)?
                .parse()
                .ok()
        };
        let total = field("MemTotal:")?;
        let available = field("MemAvailable:")?;
        (total > 0.0).then(|| (1.0 - available / total).clamp(0.0, 1.0))
    }
}

/// Probe with a fixed answer.
pub struct StaticMemoryProbe(pub Option<f64>);

impl MemoryProbe for StaticMemoryProbe {
    fn used_fraction(&self) -> Option<f64> {
        self.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreloadReport {
    pub strategy: PreloadStrategy,
    pub requested: Vec<AgentRole>,
    pub loaded: Vec<RoleOutcome>,
    pub skipped: Vec<AgentRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_reason: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PreloadState {
    pub strategy: PreloadStrategy,
    pub concurrency: usize,
}

const LOW_LOAD_CONCURRENCY: usize = 4;

pub struct AdaptivePreloader {
    factory: Arc<AgentFactory>,
    probe: Arc<dyn MemoryProbe>,
    priority_roles: Vec<AgentRole>,
    memory_threshold: f64,
    startup_delay: Duration,
    configured_concurrency: usize,
    state: Mutex<PreloadState>,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AdaptivePreloader {
    pub fn new(factory: Arc<AgentFactory>, settings: &Settings) -> Result<Self> {
        let strategy = settings.preload.strategy.parse()?;
        let concurrency = settings.preload.concurrency.max(1);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            factory,
            probe: Arc::new(ProcMeminfo),
            priority_roles: settings.priority_roles(),
            memory_threshold: settings.preload.memory_threshold,
            startup_delay: Duration::from_millis(settings.preload.startup_delay_ms),
            configured_concurrency: concurrency,
            state: Mutex::new(PreloadState { strategy, concurrency }),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn state(&self) -> PreloadState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Roles worth warming under `strategy`, most likely first.
    pub fn select_candidates(&self, strategy: PreloadStrategy) -> Vec<AgentRole> {
        let threshold = strategy.min_probability();
        let mut candidates: Vec<AgentRole> = AgentRole::ALL
            .iter()
            .copied()
            .filter(|role| {
                let p = usage_probability(*role);
                let priority = self.priority_roles.contains(role);
                match strategy {
                    PreloadStrategy::Aggressive => p >= threshold,
                    PreloadStrategy::Balanced => priority || p >= threshold,
                    PreloadStrategy::Conservative => priority && p >= threshold,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            usage_probability(*b)
                .partial_cmp(&usage_probability(*a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.index().cmp(&b.index()))
        });
        candidates.truncate(strategy.cap());
        candidates
    }

    fn memory_pressure(&self) -> Option<f64> {
        self.probe
            .used_fraction()
            .filter(|used| *used >= self.memory_threshold)
    }

    /// Build `candidates` in batches of the current concurrency, stopping
    /// early on shutdown or memory pressure. A no-op while another preload,
    /// background or manual, is running.
    #[instrument(skip(self))]
    pub async fn preload(&self, candidates: &[AgentRole]) -> PreloadReport {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("preload already running");
            return PreloadReport {
                strategy: self.state().strategy,
                requested: candidates.to_vec(),
                loaded: Vec::new(),
                skipped: candidates.to_vec(),
                stopped_reason: Some("preload already running".to_string()),
                duration_ms: 0,
            };
        }
        let _running = RunningFlag(&self.running);
        self.run_preload(candidates).await
    }

    async fn run_preload(&self, candidates: &[AgentRole]) -> PreloadReport {
        let started = Instant::now();
        let state = self.state();
        let mut loaded = Vec::new();
        let mut skipped = Vec::new();
        let mut stopped_reason = None;

        for (index, batch) in candidates.chunks(state.concurrency.max(1)).enumerate() {
            if stopped_reason.is_none() {
                if *self.shutdown_tx.borrow() {
                    stopped_reason = Some("shutdown requested".to_string());
                } else if let Some(used) = self.memory_pressure() {
                    warn!(
                        used_fraction = used,
                        threshold = self.memory_threshold,
                        "Memory threshold reached; stopping preload"
                    );
                    stopped_reason = Some(format!(
                        "memory usage {:.2} at or above threshold {:.2}",
                        used, self.memory_threshold
                    ));
                }
            }
            if stopped_reason.is_some() {
                skipped.extend_from_slice(batch);
                continue;
            }

            debug!(batch = index, roles = ?batch, "preloading batch");
            let outcomes = join_all(batch.iter().map(|role| {
                let factory = self.factory.clone();
                let role = *role;
                async move {
                    let role_started = Instant::now();
                    let agent = factory.get_agent(role).await;
                    RoleOutcome {
                        role,
                        tier: factory.settings().tier_of(role),
                        status: agent.availability().into(),
                        duration_ms: role_started.elapsed().as_millis() as u64,
                    }
                }
            }))
            .await;
            loaded.extend(outcomes);
        }

        let report = PreloadReport {
            strategy: state.strategy,
            requested: candidates.to_vec(),
            loaded,
            skipped,
            stopped_reason,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            strategy = %report.strategy,
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            duration_ms = report.duration_ms,
            "Preload finished"
        );
        report
    }

    /// Preload with the current strategy.
    pub async fn preload_current(&self) -> PreloadReport {
        let candidates = self.select_candidates(self.state().strategy);
        self.preload(&candidates).await
    }

    /// Retune strategy and concurrency for the observed load.
    pub fn adapt(&self, load: LoadLevel) -> PreloadState {
        let next = match load {
            LoadLevel::Low => PreloadState {
                strategy: PreloadStrategy::Aggressive,
                concurrency: LOW_LOAD_CONCURRENCY,
            },
            LoadLevel::Medium => PreloadState {
                strategy: PreloadStrategy::Balanced,
                concurrency: self.configured_concurrency,
            },
            LoadLevel::High => PreloadState {
                strategy: PreloadStrategy::Conservative,
                concurrency: 1,
            },
        };
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            info!(
                ?load,
                strategy = %next.strategy,
                concurrency = next.concurrency,
                "Preload strategy adapted"
            );
        }
        next
    }

    /// Adapt to the load suggested by recorded stage executions.
    pub fn adapt_from_recorder(&self, recorder: &PerformanceRecorder) -> PreloadState {
        self.adapt(recorder.suggested_load())
    }

    /// Spawn the background warm-up. Returns false if one is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("preload already running");
            return false;
        }
        self.shutdown_tx.send_replace(false);

        let preloader = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(preloader.startup_delay) => false,
                _ = shutdown_rx.wait_for(|stop| *stop) => true,
            };
            if !cancelled {
                let candidates = preloader.select_candidates(preloader.state().strategy);
                preloader.run_preload(&candidates).await;
            }
            preloader.running.store(false, Ordering::SeqCst);
        });
        *self.task.lock() = Some(handle);
        info!(delay_ms = self.startup_delay.as_millis() as u64, "Background preload scheduled");
        true
    }

    /// Signal the background warm-up to stop and wait for it.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Preload task ended abnormally");
            }
            self.running.store(false, Ordering::SeqCst);
        }
        self.shutdown_tx.send_replace(false);
    }
}

/// Clears the running flag when a manual preload ends or is dropped.
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
