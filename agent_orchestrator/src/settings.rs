//! Layered configuration: embedded defaults, optional local file, environment.

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::agent::AgentRole;
use crate::preloader::PreloadStrategy;

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_target: bool,
    pub enable_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            enable_target: false,
            enable_thread_ids: false,
        }
    }
}

/// Where agents send generation and embedding requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: String, // "http" or "offline"
    pub endpoint: String,
    pub default_model: String,
    /// Per-role model overrides. An empty string disables the role.
    pub role_models: BTreeMap<String, String>,
    pub request_timeout_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: "http".to_string(),
            endpoint: "http://127.0.0.1:11434".to_string(),
            default_model: "llama3".to_string(),
            role_models: BTreeMap::new(),
            request_timeout_ms: 30_000,
        }
    }
}

impl InferenceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Model serving `role`, or `None` when the role is disabled.
    pub fn model_for(&self, role: AgentRole) -> Option<&str> {
        let model = self
            .role_models
            .get(role.as_str())
            .map(String::as_str)
            .unwrap_or(&self.default_model);
        (!model.trim().is_empty()).then_some(model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_age_secs: u64,
    pub persist: bool,
    pub directory: PathBuf,
    pub warmup: bool,
    pub validate: bool,
    /// Builds faster than this are not worth caching.
    pub min_build_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_secs: 3_600,
            persist: true,
            directory: PathBuf::from(".agent_cache"),
            warmup: true,
            validate: true,
            min_build_ms: 1_000,
        }
    }
}

impl CacheSettings {
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_age_secs.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    pub max_parallel_builds: usize,
    pub tiers: Vec<Vec<String>>,
    pub max_construction_attempts: u32,
    pub build_timeout_ms: u64,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_parallel_builds: 5,
            tiers: vec![
                vec!["retriever".into(), "tool_selector".into(), "embedder".into()],
                vec!["task_planner".into(), "reasoning_generator".into(), "action_caller".into()],
                vec![
                    "reranker".into(),
                    "critic".into(),
                    "query_rewriter".into(),
                    "chunk_scorer".into(),
                ],
            ],
            max_construction_attempts: 10,
            build_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
    pub enabled: bool,
    pub strategy: String,
    pub priority_roles: Vec<String>,
    /// Fraction of system memory above which preloading stops.
    pub memory_threshold: f64,
    pub startup_delay_ms: u64,
    pub concurrency: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: "balanced".to_string(),
            priority_roles: vec![
                "retriever".into(),
                "reasoning_generator".into(),
                "query_rewriter".into(),
            ],
            memory_threshold: 0.85,
            startup_delay_ms: 2_000,
            concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOverride {
    pub timeout_ms: Option<u64>,
    pub critical: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stage_timeout_ms: u64,
    pub overall_timeout_ms: u64,
    /// Keyed by stage name.
    pub stages: BTreeMap<String, StageOverride>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: 30_000,
            overall_timeout_ms: 120_000,
            stages: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    pub fn timeout_for(&self, stage: &str, default_ms: u64) -> u64 {
        self.stages
            .get(stage)
            .and_then(|o| o.timeout_ms)
            .unwrap_or(default_ms)
    }

    pub fn critical_for(&self, stage: &str, default: bool) -> bool {
        self.stages
            .get(stage)
            .and_then(|o| o.critical)
            .unwrap_or(default)
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub inference: InferenceConfig,
    pub cache: CacheSettings,
    pub factory: FactoryConfig,
    pub preload: PreloadConfig,
    pub pipeline: PipelineConfig,
}

const DEFAULTS: &str = include_str!("../config.toml");

impl Settings {
    /// Load settings from the embedded defaults, `orchestrator.toml` in the
    /// working directory (if any) and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Like [`Settings::load`], reading `path` instead of `orchestrator.toml`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let local = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("orchestrator").required(false),
        };

        let config = Config::builder()
            .add_source(File::from_str(DEFAULTS, FileFormat::Toml))
            .add_source(local)
            .add_source(
                Environment::with_prefix("AGO")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to assemble configuration")?;

        let mut settings: Settings = config
            .try_deserialize()
            .context("failed to parse configuration")?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("AGO_ENDPOINT") {
            self.inference.endpoint = endpoint;
        }
        if let Ok(model) = std::env::var("AGO_DEFAULT_MODEL") {
            self.inference.default_model = model;
        }
        if let Ok(dir) = std::env::var("AGO_CACHE_DIR") {
            self.cache.directory = PathBuf::from(dir);
        }
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }
        match self.inference.backend.as_str() {
            "http" | "offline" => {}
            other => return Err(anyhow!("Unknown inference backend '{}'", other)),
        }
        if self.inference.request_timeout_ms == 0 {
            return Err(anyhow!("inference.request_timeout_ms cannot be 0"));
        }
        for role in self.inference.role_models.keys() {
            role.parse::<AgentRole>()?;
        }
        if self.inference.default_model.trim().is_empty() {
            warn!("No default model configured; roles without an override are disabled");
        }

        if self.factory.max_parallel_builds == 0 {
            return Err(anyhow!("factory.max_parallel_builds cannot be 0"));
        }
        if self.factory.build_timeout_ms == 0 {
            return Err(anyhow!("factory.build_timeout_ms cannot be 0"));
        }
        if self.factory.max_construction_attempts == 0 {
            return Err(anyhow!("factory.max_construction_attempts cannot be 0"));
        }
        for role in self.factory.tiers.iter().flatten() {
            role.parse::<AgentRole>()?;
        }

        if self.preload.concurrency == 0 {
            return Err(anyhow!("preload.concurrency cannot be 0"));
        }
        if !(self.preload.memory_threshold > 0.0 && self.preload.memory_threshold <= 1.0) {
            return Err(anyhow!(
                "preload.memory_threshold must be in (0, 1], got {}",
                self.preload.memory_threshold
            ));
        }
        self.preload.strategy.parse::<PreloadStrategy>()?;
        for role in &self.preload.priority_roles {
            role.parse::<AgentRole>()?;
        }

        if self.pipeline.stage_timeout_ms == 0 || self.pipeline.overall_timeout_ms == 0 {
            return Err(anyhow!("pipeline timeouts cannot be 0"));
        }
        if let Some((stage, _)) = self
            .pipeline
            .stages
            .iter()
            .find(|(_, o)| o.timeout_ms == Some(0))
        {
            return Err(anyhow!("stage '{}' timeout cannot be 0", stage));
        }

        if self.cache.persist && self.cache.enabled && self.cache.directory.as_os_str().is_empty() {
            return Err(anyhow!("cache.directory is required when persistence is on"));
        }
        Ok(())
    }

    /// Parsed priority roles for the preloader.
    pub fn priority_roles(&self) -> Vec<AgentRole> {
        self.preload
            .priority_roles
            .iter()
            .filter_map(|r| r.parse().ok())
            .collect()
    }

    /// Settings that run entirely offline, for tests and dry runs.
    pub fn offline() -> Self {
        let mut settings = Settings::default();
        settings.inference.backend = "offline".to_string();
        settings.inference.endpoint = "offline://local".to_string();
        settings.cache.persist = false;
        settings.preload.startup_delay_ms = 0;
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_parse_and_validate() {
        let settings: Settings = toml::from_str(DEFAULTS).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.factory.max_construction_attempts, 10);
        assert_eq!(settings.factory.tiers.len(), 3);
        assert_eq!(settings.cache.min_build_ms, 1_000);
    }

    #[test]
    fn empty_override_disables_role() {
        let mut settings = Settings::offline();
        settings
            .inference
            .role_models
            .insert("critic".to_string(), String::new());
        settings
            .inference
            .role_models
            .insert("embedder".to_string(), "nomic-embed".to_string());

        assert_eq!(settings.inference.model_for(AgentRole::Critic), None);
        assert_eq!(settings.inference.model_for(AgentRole::Embedder), Some("nomic-embed"));
        assert_eq!(settings.inference.model_for(AgentRole::Retriever), Some("llama3"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut settings = Settings::offline();
        settings.factory.max_parallel_builds = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::offline();
        settings.preload.memory_threshold = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::offline();
        settings.preload.priority_roles.push("librarian".to_string());
        assert!(settings.validate().is_err());

        let mut settings = Settings::offline();
        settings.pipeline.stages.insert(
            "embed".to_string(),
            StageOverride { timeout_ms: Some(0), critical: None },
        );
        assert!(settings.validate().is_err());
    }

    #[test]
    fn local_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.toml");
        std::fs::write(
            &path,
            "[inference]\nbackend = \"offline\"\ndefault_model = \"mistral\"\n\n[pipeline.stages.embed]\ntimeout_ms = 250\n",
        )
        .unwrap();

        let settings = Settings::load_from(Some(&path)).unwrap();
        assert_eq!(settings.inference.default_model, "mistral");
        assert_eq!(settings.pipeline.timeout_for("embed", 1), 250);
        assert_eq!(settings.pipeline.timeout_for("rerank", 7), 7);
    }
}
