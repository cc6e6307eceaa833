//! Batch execution of queries listed in a TOML job file.
//!
//! Every query runs through the full pipeline of a single [`Orchestrator`],
//! so agents built for the first query are reused by the rest. Concurrency is
//! bounded by the job's `max_concurrent_queries`.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::orchestrator::Orchestrator;
use crate::pipeline::PipelineResult;
use crate::settings::Settings;

/// Batch job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub job: JobMetadata,

    pub queries: Vec<QueryConfig>,

    #[serde(default)]
    pub settings: BatchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub name: String,
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Unique query identifier
    pub id: String,

    pub query: String,

    /// Wall-clock limit for this query on top of the pipeline budget
    pub timeout_seconds: Option<u64>,

    /// Count an answer below this confidence as a failure
    pub min_confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_queries: usize,

    /// Build every agent tier before the first query
    #[serde(default)]
    pub warm_start: bool,

    pub output_file: Option<PathBuf>,

    /// Stop scheduling new queries after the first failure
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_queries: default_max_concurrent(),
            warm_start: false,
            output_file: None,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: String,
    pub status: QueryStatus,
    pub answer: Option<Value>,
    pub confidence: f64,
    pub completed_stages: usize,
    pub failed_stages: Vec<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Success,
    Failed,
    Skipped,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub job_name: String,
    pub status: BatchStatus,
    pub total_queries: usize,
    pub successful_queries: usize,
    pub failed_queries: usize,
    pub skipped_queries: usize,
    pub average_confidence: f64,
    pub total_duration_ms: u64,
    pub query_results: Vec<QueryResult>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    PartialSuccess,
    Failed,
}

/// Execute a batch job from a configuration file.
#[instrument(skip(settings))]
pub async fn run(config_path: PathBuf, settings: Settings) -> Result<()> {
    info!("Starting batch execution from config: {:?}", config_path);

    let config =
        load_batch_config(&config_path).context("Failed to load batch configuration")?;
    info!(
        "Loaded batch job: {} (version: {})",
        config.job.name, config.job.version
    );
    let output_file = config.settings.output_file.clone();

    let orchestrator =
        Arc::new(Orchestrator::new(settings).context("Failed to initialize orchestrator")?);
    let result = execute_batch(orchestrator.clone(), config).await;
    orchestrator.shutdown().await;

    print_batch_summary(&result);
    if let Some(path) = output_file {
        save_batch_results(&result, &path).context("Failed to save batch results")?;
    }

    match result.status {
        BatchStatus::Success => Ok(()),
        BatchStatus::PartialSuccess => {
            warn!("Batch completed with some failures");
            Ok(())
        }
        BatchStatus::Failed => {
            error!("Batch execution failed");
            Err(anyhow!(
                "Batch execution failed: {} of {} queries failed",
                result.failed_queries,
                result.total_queries
            ))
        }
    }
}

/// Load and validate a batch job from a TOML file.
pub fn load_batch_config(config_path: &Path) -> Result<BatchConfig> {
    let contents = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
    let config: BatchConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config: {:?}", config_path))?;
    validate_batch_config(&config)?;
    Ok(config)
}

fn validate_batch_config(config: &BatchConfig) -> Result<()> {
    if config.queries.is_empty() {
        return Err(anyhow!("Batch configuration must contain at least one query"));
    }
    if config.settings.max_concurrent_queries == 0 {
        return Err(anyhow!("max_concurrent_queries must be at least 1"));
    }

    let mut ids = HashSet::new();
    for query in &config.queries {
        if !ids.insert(&query.id) {
            return Err(anyhow!("Duplicate query ID: {}", query.id));
        }
        if query.query.trim().is_empty() {
            return Err(anyhow!("Query {} has empty text", query.id));
        }
        if let Some(min) = query.min_confidence {
            if !(0.0..=1.0).contains(&min) {
                return Err(anyhow!(
                    "Query {} has min_confidence {} outside [0, 1]",
                    query.id,
                    min
                ));
            }
        }
    }
    Ok(())
}

/// Run every query of `config`. Executed queries keep declaration order and
/// skipped ones follow.
pub async fn execute_batch(orchestrator: Arc<Orchestrator>, config: BatchConfig) -> BatchResult {
    let started = Instant::now();
    let total_queries = config.queries.len();

    if config.settings.warm_start {
        let report = orchestrator.initialize_all().await;
        info!(
            agents = report.outcomes.len(),
            duration_ms = report.duration_ms,
            "Warm start complete"
        );
    }

    let semaphore = Arc::new(Semaphore::new(config.settings.max_concurrent_queries));
    let mut handles = Vec::with_capacity(total_queries);
    let mut skipped = Vec::new();

    for query in config.queries {
        // closed by a fail-fast query
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                skipped.push(skipped_result(&query));
                continue;
            }
        };
        let orchestrator = orchestrator.clone();
        let gate = semaphore.clone();
        let fail_fast = config.settings.fail_fast;
        let id = query.id.clone();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            let result = execute_single_query(orchestrator.as_ref(), query).await;
            if fail_fast && result.status != QueryStatus::Success {
                error!(query_id = %result.query_id, "Failing fast due to query failure");
                gate.close();
            }
            result
        });
        handles.push((id, handle));
    }

    let mut query_results = Vec::with_capacity(total_queries);
    for (id, handle) in handles {
        match handle.await {
            Ok(result) => query_results.push(result),
            Err(e) => {
                error!(query_id = %id, error = %e, "Query task panicked");
                query_results.push(QueryResult {
                    query_id: id,
                    status: QueryStatus::Failed,
                    answer: None,
                    confidence: 0.0,
                    completed_stages: 0,
                    failed_stages: Vec::new(),
                    error: Some(e.to_string()),
                    duration_ms: 0,
                });
            }
        }
    }
    query_results.extend(skipped);

    summarize(config.job.name, total_queries, query_results, started)
}

fn summarize(
    job_name: String,
    total_queries: usize,
    query_results: Vec<QueryResult>,
    started: Instant,
) -> BatchResult {
    let count = |status: QueryStatus| query_results.iter().filter(|r| r.status == status).count();
    let successful_queries = count(QueryStatus::Success);
    let skipped_queries = count(QueryStatus::Skipped);
    let failed_queries = total_queries - successful_queries - skipped_queries;

    let answered: Vec<f64> = query_results
        .iter()
        .filter(|r| r.status == QueryStatus::Success)
        .map(|r| r.confidence)
        .collect();
    let average_confidence = if answered.is_empty() {
        0.0
    } else {
        answered.iter().sum::<f64>() / answered.len() as f64
    };

    let status = if failed_queries == 0 && skipped_queries == 0 {
        BatchStatus::Success
    } else if successful_queries > 0 {
        BatchStatus::PartialSuccess
    } else {
        BatchStatus::Failed
    };

    BatchResult {
        job_name,
        status,
        total_queries,
        successful_queries,
        failed_queries,
        skipped_queries,
        average_confidence,
        total_duration_ms: started.elapsed().as_millis() as u64,
        query_results,
    }
}

fn skipped_result(query: &QueryConfig) -> QueryResult {
    QueryResult {
        query_id: query.id.clone(),
        status: QueryStatus::Skipped,
        answer: None,
        confidence: 0.0,
        completed_stages: 0,
        failed_stages: Vec::new(),
        error: Some("skipped after an earlier failure".to_string()),
        duration_ms: 0,
    }
}

async fn execute_single_query(orchestrator: &Orchestrator, query: QueryConfig) -> QueryResult {
    let started = Instant::now();
    info!(query_id = %query.id, "Executing query");

    let outcome = match query.timeout_seconds {
        Some(secs) => {
            tokio::time::timeout(Duration::from_secs(secs), orchestrator.execute(&query.query))
                .await
                .ok()
        }
        None => Some(orchestrator.execute(&query.query).await),
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Some(result) => from_pipeline(&query, result, duration_ms),
        None => {
            warn!(query_id = %query.id, "Query timed out");
            QueryResult {
                query_id: query.id,
                status: QueryStatus::Timeout,
                answer: None,
                confidence: 0.0,
                completed_stages: 0,
                failed_stages: Vec::new(),
                error: Some("query execution timed out".to_string()),
                duration_ms,
            }
        }
    }
}

fn from_pipeline(query: &QueryConfig, result: PipelineResult, duration_ms: u64) -> QueryResult {
    let failed_stages: Vec<String> = result.failures.iter().map(|f| f.stage.clone()).collect();
    let below_threshold = query
        .min_confidence
        .is_some_and(|min| result.confidence < min);

    let (status, error) = if !result.succeeded() {
        let reason = result
            .failures
            .first()
            .map(|f| f.message.clone())
            .unwrap_or_else(|| "pipeline produced no answer".to_string());
        (QueryStatus::Failed, Some(reason))
    } else if below_threshold {
        (
            QueryStatus::Failed,
            Some(format!(
                "confidence {:.2} below required {:.2}",
                result.confidence,
                query.min_confidence.unwrap_or_default()
            )),
        )
    } else {
        (QueryStatus::Success, None)
    };

    QueryResult {
        query_id: query.id.clone(),
        status,
        answer: result.answer,
        confidence: result.confidence,
        completed_stages: result.completed_stages.len(),
        failed_stages,
        error,
        duration_ms,
    }
}

/// Print batch execution summary
pub fn print_batch_summary(result: &BatchResult) {
    println!("\n=== Batch Execution Summary ===");
    println!("Job: {}", result.job_name);
    println!("Status: {:?}", result.status);
    println!("Total Queries: {}", result.total_queries);
    println!("Successful: {}", result.successful_queries);
    println!("Failed: {}", result.failed_queries);
    println!("Skipped: {}", result.skipped_queries);
    println!("Average Confidence: {:.2}", result.average_confidence);
    println!("Duration: {}ms", result.total_duration_ms);

    if result.failed_queries > 0 {
        println!("\nFailed Queries:");
        for query in &result.query_results {
            if matches!(query.status, QueryStatus::Failed | QueryStatus::Timeout) {
                println!(
                    "  - {}: {}",
                    query.query_id,
                    query.error.as_deref().unwrap_or("Unknown error")
                );
            }
        }
    }
    println!("===============================\n");
}

fn save_batch_results(result: &BatchResult, output_file: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize batch results")?;
    std::fs::write(output_file, json)
        .with_context(|| format!("Failed to write results to: {:?}", output_file))?;
    info!("Batch results saved to: {:?}", output_file);
    Ok(())
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OfflineBackend;
    use crate::context::OrchestratorContext;
    use std::fs;
    use tempfile::tempdir;

    fn query(id: &str, text: &str) -> QueryConfig {
        QueryConfig {
            id: id.to_string(),
            query: text.to_string(),
            timeout_seconds: None,
            min_confidence: None,
        }
    }

    fn config(queries: Vec<QueryConfig>) -> BatchConfig {
        BatchConfig {
            job: JobMetadata {
                name: "test_job".to_string(),
                description: None,
                version: "1.0".to_string(),
                tags: vec![],
            },
            queries,
            settings: BatchSettings::default(),
        }
    }

    fn orchestrator(backend: OfflineBackend) -> Arc<Orchestrator> {
        let settings = Settings::offline();
        let context =
            Arc::new(OrchestratorContext::from_settings(&settings).with_backend(Arc::new(backend)));
        Arc::new(Orchestrator::with_context(settings, context).unwrap())
    }

    #[test]
    fn test_batch_config_validation() {
        let valid = config(vec![query("q1", "what is a borrow checker")]);
        assert!(validate_batch_config(&valid).is_ok());

        let mut duplicate = valid.clone();
        duplicate.queries.push(query("q1", "another"));
        assert!(validate_batch_config(&duplicate).is_err());

        let mut blank = valid.clone();
        blank.queries[0].query = "   ".to_string();
        assert!(validate_batch_config(&blank).is_err());

        assert!(validate_batch_config(&config(vec![])).is_err());
    }

    #[test]
    fn test_batch_config_loading() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("queries.toml");
        let config_content = r#"
[job]
name = "nightly"
description = "Regression queries"

[settings]
max_concurrent_queries = 2
warm_start = true

[[queries]]
id = "lifetimes"
query = "how do rust lifetimes work"

[[queries]]
id = "traits"
query = "what is a trait object"
timeout_seconds = 30
min_confidence = 0.2
"#;
        fs::write(&config_path, config_content).unwrap();

        let config = load_batch_config(&config_path).unwrap();
        assert_eq!(config.job.name, "nightly");
        assert_eq!(config.job.version, "1.0");
        assert_eq!(config.queries.len(), 2);
        assert_eq!(config.queries[1].timeout_seconds, Some(30));
        assert_eq!(config.settings.max_concurrent_queries, 2);
        assert!(config.settings.warm_start);
    }

    #[tokio::test]
    async fn test_batch_runs_all_queries_offline() {
        let orchestrator = orchestrator(OfflineBackend::new("offline://test"));
        let mut job = config(vec![
            query("a", "how do rust lifetimes work"),
            query("b", "what is a trait object"),
            query("c", "explain async executors"),
        ]);
        job.settings.max_concurrent_queries = 2;

        let result = execute_batch(orchestrator.clone(), job).await;
        assert_eq!(result.status, BatchStatus::Success);
        assert_eq!(result.successful_queries, 3);
        let ids: Vec<&str> = result.query_results.iter().map(|r| r.query_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(result.average_confidence > 0.0);
        // agents are shared across queries
        assert_eq!(orchestrator.factory().build_events().len(), 10);
    }

    #[tokio::test]
    async fn test_unreachable_threshold_fails_query() {
        let orchestrator = orchestrator(OfflineBackend::new("offline://test"));
        let mut strict = query("strict", "how do rust lifetimes work");
        strict.min_confidence = Some(1.0);
        let job = config(vec![query("ok", "what is a trait object"), strict]);

        let result = execute_batch(orchestrator, job).await;
        assert_eq!(result.status, BatchStatus::PartialSuccess);
        assert_eq!(result.failed_queries, 1);
        assert!(result.query_results[1]
            .error
            .as_deref()
            .unwrap()
            .contains("below required"));
    }

    #[test]
    fn test_results_are_written_as_json() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("out.json");
        let result = summarize(
            "job".to_string(),
            1,
            vec![skipped_result(&query("x", "y"))],
            Instant::now(),
        );

        save_batch_results(&result, &path).unwrap();
        let saved: BatchResult = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.status, BatchStatus::Failed);
        assert_eq!(saved.skipped_queries, 1);
    }
}
