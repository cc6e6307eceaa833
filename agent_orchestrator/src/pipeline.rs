//! Dependency-graph pipeline executor.
//!
//! Stages form a DAG over the agent roles. The execution order is computed
//! once, with Kahn's algorithm, when the executor is built; every request then
//! walks that order, enforcing per-stage timeouts, criticality and an overall
//! budget, while accumulating a running confidence and an insight trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{AgentRequest, AgentRole, StageInput};
use crate::error::{PipelineError, StageFailure};
use crate::factory::AgentFactory;
use crate::recorder::{PerformanceRecorder, PerformanceSample, SampleKind};
use crate::settings::PipelineConfig;

pub const CONFIDENCE_FLOOR: f64 = 0.1;
pub const CONFIDENCE_CEILING: f64 = 0.95;
const INITIAL_CONFIDENCE: f64 = 0.5;
const DEFAULT_STAGE_CONFIDENCE: f64 = 0.5;
const SUMMARY_LEN: usize = 120;

/// One node of the stage graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub role: AgentRole,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub critical: bool,
    pub timeout_ms: u64,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, role: AgentRole, timeout_ms: u64) -> Self {
        Self {
            name: name.into(),
            role,
            dependencies: Vec::new(),
            critical: false,
            timeout_ms,
        }
    }

    pub fn depends_on(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }
}

/// The ten-stage graph over the ten roles, with per-stage overrides applied.
pub fn default_stages(config: &PipelineConfig) -> Vec<StageSpec> {
    let stage = |name: &str, role: AgentRole, deps: &[&str], critical: bool| {
        StageSpec::new(name, role, config.timeout_for(name, config.stage_timeout_ms))
            .depends_on(deps)
            .critical(config.critical_for(name, critical))
    };

    vec![
        stage("query_rewrite", AgentRole::QueryRewriter, &[], false),
        stage("embed", AgentRole::Embedder, &["query_rewrite"], false),
        stage("retrieve", AgentRole::Retriever, &["query_rewrite", "embed"], true),
        stage("chunk_score", AgentRole::ChunkScorer, &["retrieve"], false),
        stage("rerank", AgentRole::Reranker, &["retrieve", "chunk_score"], false),
        stage("plan", AgentRole::TaskPlanner, &["query_rewrite"], false),
        stage("tool_select", AgentRole::ToolSelector, &["plan"], false),
        stage("action", AgentRole::ActionCaller, &["tool_select"], false),
        stage("reason", AgentRole::ReasoningGenerator, &["rerank", "plan", "action"], true),
        stage("critique", AgentRole::Critic, &["reason"], false),
    ]
}

/// Kahn's algorithm; among ready stages the earliest declared runs first.
fn topological_order(stages: &[StageSpec]) -> Result<Vec<usize>, PipelineError> {
    if stages.is_empty() {
        return Err(PipelineError::Empty);
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, stage) in stages.iter().enumerate() {
        if index.insert(stage.name.as_str(), i).is_some() {
            return Err(PipelineError::DuplicateStage(stage.name.clone()));
        }
    }

    let mut in_degree = vec![0usize; stages.len()];
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (i, stage) in stages.iter().enumerate() {
        let mut seen = BTreeSet::new();
        for dep in &stage.dependencies {
            let &d = index
                .get(dep.as_str())
                .ok_or_else(|| PipelineError::UnknownDependency {
                    stage: stage.name.clone(),
                    dependency: dep.clone(),
                })?;
            if seen.insert(d) {
                in_degree[i] += 1;
                downstream[d].push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(stages.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &downstream[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < stages.len() {
        let stuck = (0..stages.len())
            .filter(|i| in_degree[*i] > 0)
            .map(|i| stages[i].name.clone())
            .collect();
        return Err(PipelineError::Cycle { stages: stuck });
    }
    Ok(order)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct Insight {
    pub stage: String,
    pub role: AgentRole,
    pub summary: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageFailureRecord {
    pub stage: String,
    pub message: String,
    pub timeout: bool,
}

impl From<&StageFailure> for StageFailureRecord {
    fn from(failure: &StageFailure) -> Self {
        Self {
            stage: failure.stage().to_string(),
            message: failure.to_string(),
            timeout: failure.is_timeout(),
        }
    }
}

/// Per-request mutable state.
#[derive(Debug)]
pub struct PipelineRun {
    pub query: String,
    pub results: BTreeMap<String, Value>,
    pub running_confidence: f64,
    pub stage_confidences: Vec<f64>,
    pub insights: Vec<Insight>,
    pub completed: Vec<String>,
    pub failures: Vec<StageFailureRecord>,
    pub states: BTreeMap<String, StageState>,
    pub aborted: bool,
}

impl PipelineRun {
    fn new(query: &str, stages: &[StageSpec]) -> Self {
        Self {
            query: query.to_string(),
            results: BTreeMap::new(),
            running_confidence: INITIAL_CONFIDENCE,
            stage_confidences: Vec::new(),
            insights: Vec::new(),
            completed: Vec::new(),
            failures: Vec::new(),
            states: stages
                .iter()
                .map(|s| (s.name.clone(), StageState::Pending))
                .collect(),
            aborted: false,
        }
    }

    /// Fold a stage confidence into the running score.
    pub fn absorb_confidence(&mut self, stage_confidence: f64) {
        self.stage_confidences.push(stage_confidence);
        self.running_confidence = blend_confidence(self.running_confidence, stage_confidence);
    }

    fn fail(&mut self, failure: &StageFailure) {
        self.states
            .insert(failure.stage().to_string(), StageState::Failed);
        self.failures.push(failure.into());
    }

    fn abort(&mut self, stage: &str, message: String) {
        self.aborted = true;
        self.failures.push(StageFailureRecord {
            stage: stage.to_string(),
            message,
            timeout: true,
        });
    }
}

/// `clamp(0.7·current + 0.3·stage, 0.1, 0.95)`
pub fn blend_confidence(current: f64, stage_confidence: f64) -> f64 {
    (0.7 * current + 0.3 * stage_confidence).clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING)
}

/// Fixed-shape outcome of one request.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub query: String,
    pub rewritten_query: Option<Value>,
    pub embedding: Option<Value>,
    pub documents: Option<Value>,
    pub chunk_scores: Option<Value>,
    pub ranked_documents: Option<Value>,
    pub plan: Option<Value>,
    pub tools: Option<Value>,
    pub actions: Option<Value>,
    pub answer: Option<Value>,
    pub critique: Option<Value>,
    pub confidence: f64,
    pub running_confidence: f64,
    pub insights: Vec<Insight>,
    pub completed_stages: Vec<String>,
    pub failures: Vec<StageFailureRecord>,
    pub stage_states: BTreeMap<String, StageState>,
    pub duration_ms: u64,
    pub aborted: bool,
}

impl PipelineResult {
    pub fn succeeded(&self) -> bool {
        !self.aborted && self.answer.is_some()
    }
}

pub struct PipelineExecutor {
    stages: Vec<StageSpec>,
    order: Vec<usize>,
    factory: Arc<AgentFactory>,
    recorder: Arc<PerformanceRecorder>,
    overall_timeout: Duration,
}

impl PipelineExecutor {
    /// Validate the graph and fix the execution order.
    pub fn new(
        stages: Vec<StageSpec>,
        factory: Arc<AgentFactory>,
        recorder: Arc<PerformanceRecorder>,
        config: &PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let order = topological_order(&stages)?;
        let executor = Self {
            stages,
            order,
            factory,
            recorder,
            overall_timeout: Duration::from_millis(config.overall_timeout_ms),
        };
        info!(order = ?executor.order(), "Pipeline order resolved");
        Ok(executor)
    }

    pub fn order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&i| self.stages[i].name.as_str())
            .collect()
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn factory(&self) -> &Arc<AgentFactory> {
        &self.factory
    }

    fn stage_input(&self, stage: &StageSpec, query: &str, run: &PipelineRun) -> StageInput {
        match stage.dependencies.as_slice() {
            [] => StageInput::Request(json!({ "query": query })),
            [single] => StageInput::Single(run.results.get(single).cloned()),
            deps => StageInput::Bundle(
                deps.iter()
                    .map(|dep| (dep.clone(), run.results.get(dep).cloned()))
                    .collect(),
            ),
        }
    }

    /// Run one request. Never fails; problems are reported in the result.
    #[instrument(skip(self), fields(run_id = tracing::field::Empty))]
    pub async fn execute(&self, query: &str) -> PipelineResult {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        let started = Instant::now();
        let deadline = started + self.overall_timeout;
        let mut run = PipelineRun::new(query, &self.stages);

        for &index in &self.order {
            let stage = &self.stages[index];
            if run.aborted {
                run.states.insert(stage.name.clone(), StageState::Skipped);
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let failure = StageFailure::DeadlineExhausted { stage: stage.name.clone() };
                warn!(stage = %stage.name, "Pipeline budget exhausted");
                run.abort(
                    "pipeline",
                    format!(
                        "overall timeout of {}ms exhausted: {}",
                        self.overall_timeout.as_millis(),
                        failure
                    ),
                );
                run.states.insert(stage.name.clone(), StageState::Skipped);
                continue;
            }

            run.states.insert(stage.name.clone(), StageState::Running);
            let stage_started = Instant::now();
            let outcome = self.run_stage(stage, &run, remaining).await;
            let duration_ms = stage_started.elapsed().as_millis() as u64;

            let sample = PerformanceSample::finished(stage.name.as_str(), SampleKind::Stage, duration_ms);
            match outcome {
                Ok(value) => {
                    self.recorder.record(sample);
                    let stage_confidence = extract_confidence(&value);
                    run.absorb_confidence(stage_confidence);
                    run.insights.push(Insight {
                        stage: stage.name.clone(),
                        role: stage.role,
                        summary: summarize(&value),
                        confidence: stage_confidence,
                        timestamp: Utc::now(),
                    });
                    run.completed.push(stage.name.clone());
                    run.states.insert(stage.name.clone(), StageState::Completed);
                    run.results.insert(stage.name.clone(), value);
                    debug!(stage = %stage.name, duration_ms, stage_confidence, "stage completed");
                }
                Err(StageOutcome::BudgetExhausted) => {
                    self.recorder.record(sample.failed("pipeline timeout"));
                    warn!(stage = %stage.name, "Pipeline timed out during stage");
                    run.states.insert(stage.name.clone(), StageState::Failed);
                    run.abort(
                        "pipeline",
                        format!(
                            "overall timeout of {}ms exceeded during stage '{}'",
                            self.overall_timeout.as_millis(),
                            stage.name
                        ),
                    );
                }
                Err(StageOutcome::Failed(failure)) => {
                    self.recorder.record(sample.failed(failure.to_string()));
                    run.fail(&failure);
                    if stage.critical {
                        warn!(stage = %stage.name, error = %failure, "Critical stage failed; aborting run");
                        run.aborted = true;
                    } else {
                        warn!(stage = %stage.name, error = %failure, "Stage failed; continuing without it");
                    }
                }
            }
        }

        let result = self.assemble(run_id, run, started.elapsed().as_millis() as u64);
        info!(
            completed = result.completed_stages.len(),
            failures = result.failures.len(),
            confidence = result.confidence,
            duration_ms = result.duration_ms,
            aborted = result.aborted,
            "Pipeline run finished"
        );
        result
    }

    async fn run_stage(
        &self,
        stage: &StageSpec,
        run: &PipelineRun,
        remaining: Duration,
    ) -> Result<Value, StageOutcome> {
        let stage_timeout = Duration::from_millis(stage.timeout_ms);
        let budget = stage_timeout.min(remaining);
        let deadline = Instant::now() + budget;

        // Acquiring the agent may build it, so it shares the stage budget.
        let attempt = async {
            let agent = self.factory.get_agent(stage.role).await;
            if !agent.is_initialized() {
                return Err(StageOutcome::Failed(StageFailure::Unavailable {
                    stage: stage.name.clone(),
                    role: stage.role,
                }));
            }
            let request = AgentRequest::new(run.query.clone(), self.stage_input(stage, &run.query, run))
                .with_deadline(deadline);
            agent.invoke(request).await.map_err(|e| {
                StageOutcome::Failed(StageFailure::Agent {
                    stage: stage.name.clone(),
                    message: e.to_string(),
                })
            })
        };

        match tokio::time::timeout(budget, attempt).await {
            Ok(outcome) => outcome,
            Err(_) if budget < stage_timeout => Err(StageOutcome::BudgetExhausted),
            Err(_) => Err(StageOutcome::Failed(StageFailure::Timeout {
                stage: stage.name.clone(),
                timeout_ms: stage.timeout_ms,
            })),
        }
    }

    fn assemble(&self, run_id: Uuid, run: PipelineRun, duration_ms: u64) -> PipelineResult {
        let field = |role: AgentRole, key: &str| -> Option<Value> {
            self.stages
                .iter()
                .filter(|s| s.role == role)
                .find_map(|s| run.results.get(&s.name))
                .and_then(|value| value.get(key).cloned())
        };
        let whole = |role: AgentRole| -> Option<Value> {
            self.stages
                .iter()
                .filter(|s| s.role == role)
                .find_map(|s| run.results.get(&s.name).cloned())
        };

        let confidence = if run.stage_confidences.is_empty() {
            DEFAULT_STAGE_CONFIDENCE
        } else {
            run.stage_confidences.iter().sum::<f64>() / run.stage_confidences.len() as f64
        };

        PipelineResult {
            run_id,
            rewritten_query: field(AgentRole::QueryRewriter, "query"),
            embedding: field(AgentRole::Embedder, "embedding"),
            documents: field(AgentRole::Retriever, "documents"),
            chunk_scores: field(AgentRole::ChunkScorer, "scores"),
            ranked_documents: field(AgentRole::Reranker, "ranked"),
            plan: field(AgentRole::TaskPlanner, "steps"),
            tools: field(AgentRole::ToolSelector, "tools"),
            actions: field(AgentRole::ActionCaller, "actions"),
            answer: field(AgentRole::ReasoningGenerator, "answer"),
            critique: whole(AgentRole::Critic),
            confidence,
            running_confidence: run.running_confidence,
            query: run.query,
            insights: run.insights,
            completed_stages: run.completed,
            failures: run.failures,
            stage_states: run.states,
            duration_ms,
            aborted: run.aborted,
        }
    }
}

enum StageOutcome {
    Failed(StageFailure),
    /// The overall budget, not the stage's own timeout, ran out.
    BudgetExhausted,
}

/// Numeric `confidence` field of a stage result, clamped to [0, 1].
fn extract_confidence(value: &Value) -> f64 {
    value
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(DEFAULT_STAGE_CONFIDENCE)
}

fn summarize(value: &Value) -> String {
    let text = match value {
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| k.as_str() != "confidence")
            .map(|(k, v)| match v {
                Value::String(s) => format!("{}: {}", k, s),
                Value::Array(items) => format!("{}: {} item(s)", k, items.len()),
                other => format!("{}: {}", k, other),
            })
            .collect::<Vec<_>>()
            .join("; "),
        other => other.to_string(),
    };
    match text.char_indices().nth(SUMMARY_LEN) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OfflineBackend;
    use crate::cache::AgentInitializationCache;
    use crate::factory::FactorySettings;
    use crate::settings::Settings;
    use proptest::prelude::*;

    fn executor(stages: Vec<StageSpec>, backend: OfflineBackend, settings: &Settings) -> Result<PipelineExecutor, PipelineError> {
        let recorder = Arc::new(PerformanceRecorder::default());
        let factory = Arc::new(AgentFactory::new(
            FactorySettings::from_settings(settings).unwrap(),
            Arc::new(backend),
            Arc::new(AgentInitializationCache::disabled()),
            recorder.clone(),
            1,
        ));
        PipelineExecutor::new(stages, factory, recorder, &settings.pipeline)
    }

    fn offline() -> OfflineBackend {
        OfflineBackend::new("offline://test")
    }

    #[test]
    fn order_breaks_ties_by_declaration() {
        let stages = default_stages(&PipelineConfig::default());
        let order = topological_order(&stages).unwrap();
        let names: Vec<&str> = order.iter().map(|&i| stages[i].name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "query_rewrite", "embed", "retrieve", "chunk_score", "rerank",
                "plan", "tool_select", "action", "reason", "critique"
            ]
        );
    }

    #[test]
    fn invalid_graphs_are_rejected_at_construction() {
        let settings = Settings::offline();
        let cycle = vec![
            StageSpec::new("a", AgentRole::QueryRewriter, 100).depends_on(&["c"]),
            StageSpec::new("b", AgentRole::TaskPlanner, 100).depends_on(&["a"]),
            StageSpec::new("c", AgentRole::Critic, 100).depends_on(&["b"]),
        ];
        assert!(matches!(
            executor(cycle, offline(), &settings),
            Err(PipelineError::Cycle { stages }) if stages == vec!["a", "b", "c"]
        ));

        let unknown = vec![StageSpec::new("a", AgentRole::Critic, 100).depends_on(&["ghost"])];
        assert!(matches!(
            executor(unknown, offline(), &settings),
            Err(PipelineError::UnknownDependency { .. })
        ));

        let duplicate = vec![
            StageSpec::new("a", AgentRole::Critic, 100),
            StageSpec::new("a", AgentRole::Reranker, 100),
        ];
        assert!(matches!(
            executor(duplicate, offline(), &settings),
            Err(PipelineError::DuplicateStage(name)) if name == "a"
        ));
        assert!(matches!(executor(Vec::new(), offline(), &settings), Err(PipelineError::Empty)));
    }

    fn chain(critical_first: bool) -> Vec<StageSpec> {
        vec![
            StageSpec::new("a", AgentRole::QueryRewriter, 1_000).critical(critical_first),
            StageSpec::new("b", AgentRole::TaskPlanner, 1_000).depends_on(&["a"]),
            StageSpec::new("c", AgentRole::Critic, 1_000).depends_on(&["b"]),
        ]
    }

    fn settings_with_broken_rewriter() -> Settings {
        let mut settings = Settings::offline();
        settings
            .inference
            .role_models
            .insert("query_rewriter".to_string(), "broken".to_string());
        settings
    }

    #[tokio::test]
    async fn critical_failure_aborts_the_run() {
        let settings = settings_with_broken_rewriter();
        let executor = executor(chain(true), offline().with_failing_model("broken"), &settings).unwrap();

        let result = executor.execute("what is rust").await;
        assert!(result.aborted);
        assert!(result.completed_stages.is_empty());
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].stage, "a");
        assert_eq!(result.stage_states["b"], StageState::Skipped);
        assert_eq!(result.stage_states["c"], StageState::Skipped);
        assert_eq!(result.confidence, 0.5);
    }

    #[tokio::test]
    async fn non_critical_failure_leaves_an_absent_slot() {
        let settings = settings_with_broken_rewriter();
        let executor = executor(chain(false), offline().with_failing_model("broken"), &settings).unwrap();

        let result = executor.execute("what is rust").await;
        assert!(!result.aborted);
        assert_eq!(result.completed_stages, vec!["b", "c"]);
        assert_eq!(result.stage_states["a"], StageState::Failed);
        assert!(result.rewritten_query.is_none());
        assert!(result.plan.is_some());
    }

    #[tokio::test]
    async fn stage_timeout_is_distinct_from_agent_failure() {
        let mut settings = Settings::offline();
        settings
            .inference
            .role_models
            .insert("task_planner".to_string(), "slow".to_string());
        let backend = offline().with_generate_latency("slow", Duration::from_millis(500));
        let stages = vec![
            StageSpec::new("a", AgentRole::QueryRewriter, 1_000),
            StageSpec::new("b", AgentRole::TaskPlanner, 50).depends_on(&["a"]),
        ];
        let executor = executor(stages, backend, &settings).unwrap();

        let result = executor.execute("q").await;
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].stage, "b");
        assert!(result.failures[0].timeout);
        assert_eq!(result.completed_stages, vec!["a"]);
    }

    #[tokio::test]
    async fn overall_budget_produces_a_pipeline_failure() {
        let mut settings = Settings::offline();
        settings.pipeline.overall_timeout_ms = 60;
        settings
            .inference
            .role_models
            .insert("task_planner".to_string(), "slow".to_string());
        let backend = offline().with_generate_latency("slow", Duration::from_millis(500));
        let executor = executor(chain(false), backend, &settings).unwrap();

        let result = executor.execute("q").await;
        assert!(result.aborted);
        assert_eq!(result.failures.last().unwrap().stage, "pipeline");
        assert_eq!(result.stage_states["c"], StageState::Skipped);
    }

    #[tokio::test]
    async fn slow_construction_counts_against_the_stage_budget() {
        let mut settings = Settings::offline();
        settings.pipeline.overall_timeout_ms = 100;
        let backend = offline().with_probe_latency(Duration::from_millis(300));
        let stages = vec![
            StageSpec::new("a", AgentRole::QueryRewriter, 50),
            StageSpec::new("b", AgentRole::TaskPlanner, 1_000).depends_on(&["a"]),
        ];
        let executor = executor(stages, backend, &settings).unwrap();

        let result = executor.execute("q").await;
        assert!(result.duration_ms < 250, "run took {}ms", result.duration_ms);
        assert!(result.completed_stages.is_empty());
        assert_eq!(result.failures[0].stage, "a");
        assert!(result.failures[0].timeout);
        assert!(result.aborted);
        assert_eq!(result.failures.last().unwrap().stage, "pipeline");
    }

    #[tokio::test]
    async fn disabled_role_fails_its_stage_without_panicking() {
        let mut settings = Settings::offline();
        settings
            .inference
            .role_models
            .insert("critic".to_string(), String::new());
        let executor = executor(chain(false), offline(), &settings).unwrap();

        let result = executor.execute("q").await;
        assert_eq!(result.stage_states["c"], StageState::Failed);
        assert!(result.failures[0].message.contains("critic"));
        assert!(result.critique.is_none());
    }

    #[test]
    fn confidence_is_bounded() {
        let mut c = 0.5;
        for _ in 0..50 {
            c = blend_confidence(c, 0.9);
            assert!(c <= CONFIDENCE_CEILING);
        }
        assert!(c > 0.85);
        for _ in 0..50 {
            c = blend_confidence(c, 0.05);
            assert!(c >= CONFIDENCE_FLOOR);
        }
    }

    proptest! {
        #[test]
        fn running_confidence_stays_in_bounds(stages in proptest::collection::vec(-1.0f64..2.0, 0..40)) {
            let mut run = PipelineRun::new("q", &[]);
            for c in stages {
                run.absorb_confidence(c);
                prop_assert!(run.running_confidence >= CONFIDENCE_FLOOR);
                prop_assert!(run.running_confidence <= CONFIDENCE_CEILING);
            }
        }
    }

    #[test]
    fn summaries_are_short() {
        let long = json!({ "answer": "x".repeat(500), "confidence": 0.9 });
        let summary = summarize(&long);
        assert!(summary.chars().count() <= SUMMARY_LEN + 1);
        assert!(!summary.contains("confidence"));
    }
}
