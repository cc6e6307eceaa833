//! Agent contract and the built-in agents for the ten pipeline roles.
//!
//! Every role is served by [`InferenceAgent`], parameterized by its
//! [`AgentRole`]; roles without a usable model get a [`DisabledAgent`]. The set
//! of roles is closed: the factory selects the behavior by matching on the
//! enum, never by name lookup.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::backend::InferenceBackend;
use crate::error::{AgentError, UnknownRole};

/// The ten fixed agent roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Retriever,
    Reranker,
    ToolSelector,
    Critic,
    TaskPlanner,
    QueryRewriter,
    ReasoningGenerator,
    ChunkScorer,
    ActionCaller,
    Embedder,
}

impl AgentRole {
    pub const ALL: [AgentRole; 10] = [
        AgentRole::Retriever,
        AgentRole::Reranker,
        AgentRole::ToolSelector,
        AgentRole::Critic,
        AgentRole::TaskPlanner,
        AgentRole::QueryRewriter,
        AgentRole::ReasoningGenerator,
        AgentRole::ChunkScorer,
        AgentRole::ActionCaller,
        AgentRole::Embedder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Retriever => "retriever",
            AgentRole::Reranker => "reranker",
            AgentRole::ToolSelector => "tool_selector",
            AgentRole::Critic => "critic",
            AgentRole::TaskPlanner => "task_planner",
            AgentRole::QueryRewriter => "query_rewriter",
            AgentRole::ReasoningGenerator => "reasoning_generator",
            AgentRole::ChunkScorer => "chunk_scorer",
            AgentRole::ActionCaller => "action_caller",
            AgentRole::Embedder => "embedder",
        }
    }

    /// Position in [`AgentRole::ALL`]; used as a stable tie-breaker.
    pub fn index(self) -> usize {
        AgentRole::ALL
            .iter()
            .position(|role| *role == self)
            .unwrap_or(AgentRole::ALL.len())
    }

    pub fn capabilities(self) -> Vec<String> {
        let caps: &[&str] = match self {
            AgentRole::Retriever => &["document_retrieval", "passage_search"],
            AgentRole::Reranker => &["relevance_ranking"],
            AgentRole::ToolSelector => &["tool_selection", "tool_catalog"],
            AgentRole::Critic => &["answer_review", "self_critique"],
            AgentRole::TaskPlanner => &["task_decomposition", "planning"],
            AgentRole::QueryRewriter => &["query_rewriting", "query_expansion"],
            AgentRole::ReasoningGenerator => &["text_generation", "reasoning"],
            AgentRole::ChunkScorer => &["chunk_scoring"],
            AgentRole::ActionCaller => &["tool_invocation"],
            AgentRole::Embedder => &["text_embedding"],
        };
        caps.iter().map(|c| c.to_string()).collect()
    }

    /// Roles whose answers depend only on their input text and can be
    /// replayed from the warm-up memo.
    fn memoizes(self) -> bool {
        matches!(
            self,
            AgentRole::Retriever | AgentRole::Embedder | AgentRole::QueryRewriter
        )
    }

    /// Inputs evaluated during full initialization to warm the memo.
    fn seed_inputs(self) -> &'static [&'static str] {
        match self {
            AgentRole::Embedder => &["search", "document", "question", "answer"],
            AgentRole::Retriever => &["overview", "getting started"],
            _ => &[],
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        AgentRole::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == normalized)
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}

/// What to build: role, model and transport address plus free-form options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub role: AgentRole,
    pub model: String,
    pub endpoint: String,
    #[serde(default)]
    pub configuration: BTreeMap<String, Value>,
}

const SECRET_MARKERS: [&str; 6] = ["token", "secret", "password", "credential", "api_key", "apikey"];

/// True for configuration keys that carry credentials.
pub fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|marker| key.contains(marker))
}

fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !is_secret_key(k))
                .map(|(k, v)| (k.clone(), sanitize_value(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        other => other.clone(),
    }
}

impl AgentDescriptor {
    pub fn new(role: AgentRole, model: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            role,
            model: model.into(),
            endpoint: endpoint.into(),
            configuration: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.configuration.insert(key.into(), value);
        self
    }

    /// Configuration with credential-bearing keys removed at every depth.
    pub fn sanitized_configuration(&self) -> BTreeMap<String, Value> {
        self.configuration
            .iter()
            .filter(|(k, _)| !is_secret_key(k))
            .map(|(k, v)| (k.clone(), sanitize_value(v)))
            .collect()
    }
}

/// Input handed to a stage's agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StageInput {
    /// The original request payload, for stages without dependencies.
    Request(Value),
    /// The single upstream result, absent when that stage failed.
    Single(Option<Value>),
    /// Upstream results keyed by stage name.
    Bundle(BTreeMap<String, Option<Value>>),
}

impl StageInput {
    /// Present upstream values, in stage-name order for bundles.
    pub fn values(&self) -> Vec<&Value> {
        match self {
            StageInput::Request(value) => vec![value],
            StageInput::Single(value) => value.iter().collect(),
            StageInput::Bundle(slots) => slots.values().flatten().collect(),
        }
    }

    pub fn slot(&self, stage: &str) -> Option<&Value> {
        match self {
            StageInput::Bundle(slots) => slots.get(stage).and_then(Option::as_ref),
            _ => None,
        }
    }

    /// First top-level field named `field` across the present values.
    pub fn find_field(&self, field: &str) -> Option<&Value> {
        self.values().into_iter().find_map(|value| value.get(field))
    }

    fn find_str(&self, field: &str) -> Option<&str> {
        self.find_field(field).and_then(Value::as_str)
    }

    fn find_array(&self, field: &str) -> &[Value] {
        self.find_field(field)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// One call into an agent's primary operation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub query: String,
    pub input: StageInput,
    /// Point after which the caller stops waiting.
    pub deadline: Option<Instant>,
}

impl AgentRequest {
    pub fn new(query: impl Into<String>, input: StageInput) -> Self {
        Self {
            query: query.into(),
            input,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Rewritten query from upstream if present, otherwise the raw query.
    fn subject(&self) -> String {
        self.input
            .find_str("query")
            .filter(|q| !q.trim().is_empty())
            .unwrap_or(&self.query)
            .to_string()
    }
}

/// Agent health information
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    pub role: AgentRole,
    pub status: Availability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub error_count: u64,
    pub average_response_time_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Ready,
    Uninitialized,
    /// Reports itself initialized but cannot serve requests.
    Degraded,
    Disabled,
}

/// Uniform capability interface every agent satisfies.
#[async_trait]
pub trait Agent: Send + Sync {
    fn role(&self) -> AgentRole;
    fn model(&self) -> &str;
    fn capabilities(&self) -> Vec<String>;
    fn is_initialized(&self) -> bool;
    fn availability(&self) -> Availability;

    /// Full, expensive startup path.
    async fn initialize(&self) -> Result<(), AgentError>;

    /// Skip startup because a cache entry vouches for this configuration.
    fn mark_initialized_from_cache(&self);

    /// The role's primary operation.
    async fn invoke(&self, request: AgentRequest) -> Result<Value, AgentError>;

    /// Cheap-to-restore internal state for the initialization cache.
    fn export_warmup(&self) -> Result<Value, AgentError>;

    fn import_warmup(&self, payload: &Value) -> Result<(), AgentError>;

    fn health(&self) -> AgentHealth;
}

// --- Built-in Agents ---

const MEMO_CAPACITY: usize = 64;
const MAX_DOCUMENTS: usize = 8;

/// Maximum number of memo entries carried in a warm-up payload.
pub const WARMUP_LIMIT: usize = 32;

const TOOL_CATALOG: [(&str, &[&str]); 4] = [
    ("search", &["find", "search", "look", "lookup", "related"]),
    ("calculator", &["calculate", "compute", "sum", "total", "number"]),
    ("code_runner", &["code", "run", "execute", "script"]),
    ("http_fetch", &["fetch", "download", "url", "http", "background"]),
];

/// Model-backed agent serving one role.
pub struct InferenceAgent {
    descriptor: AgentDescriptor,
    backend: Arc<dyn InferenceBackend>,
    initialized: AtomicBool,
    restored_from_cache: AtomicBool,
    memo: Mutex<LruCache<String, Value>>,
    request_count: AtomicU64,
    error_count: AtomicU64,
    total_latency_ms: AtomicU64,
    start_time: Instant,
}

impl InferenceAgent {
    pub fn new(descriptor: AgentDescriptor, backend: Arc<dyn InferenceBackend>) -> Self {
        let capacity = NonZeroUsize::new(MEMO_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            descriptor,
            backend,
            initialized: AtomicBool::new(false),
            restored_from_cache: AtomicBool::new(false),
            memo: Mutex::new(LruCache::new(capacity)),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub fn restored_from_cache(&self) -> bool {
        self.restored_from_cache.load(Ordering::SeqCst)
    }

    /// Number of memoized answers currently held.
    pub fn memo_len(&self) -> usize {
        self.memo.lock().len()
    }

    fn memo_key(&self, request: &AgentRequest) -> Option<String> {
        if !self.role().memoizes() {
            return None;
        }
        let text = match self.role() {
            AgentRole::QueryRewriter => request.query.clone(),
            _ => request.subject(),
        };
        Some(text.trim().to_lowercase())
    }

    async fn generate(&self, prompt: &str, request: &AgentRequest) -> Result<String, AgentError> {
        Ok(self
            .backend
            .generate(&self.descriptor.model, prompt, request.deadline)
            .await?)
    }

    /// Role-specific operation, without memo or bookkeeping.
    async fn perform(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        match self.role() {
            AgentRole::QueryRewriter => {
                let prompt = format!(
                    "Rewrite the search query so it is specific and self-contained. \
                     Reply with the rewritten query on the first line.\n{}",
                    request.query
                );
                let text = self.generate(&prompt, request).await?;
                let (body, confidence) = split_confidence(&text, 0.7);
                let rewritten = first_line(&body).unwrap_or(&request.query).to_string();
                Ok(json!({
                    "query": rewritten,
                    "original": request.query,
                    "confidence": confidence,
                }))
            }
            AgentRole::Embedder => {
                let text = request.subject();
                let embedding = self
                    .backend
                    .embed(&self.descriptor.model, &text, request.deadline)
                    .await?;
                Ok(json!({
                    "embedding": embedding,
                    "dimensions": embedding.len(),
                    "text": text,
                    "confidence": 0.9,
                }))
            }
            AgentRole::Retriever => {
                let query = request.subject();
                let prompt = format!("List passages relevant to the query, one per line.\n{}", query);
                let text = self.generate(&prompt, request).await?;
                let (body, confidence) = split_confidence(&text, 0.6);
                let documents: Vec<Value> = non_empty_lines(&body)
                    .take(MAX_DOCUMENTS)
                    .enumerate()
                    .map(|(i, line)| json!({ "id": format!("doc-{}", i), "text": line }))
                    .collect();
                let confidence = if documents.is_empty() { 0.2 } else { confidence };
                Ok(json!({
                    "documents": documents,
                    "query": query,
                    "used_embedding": request.input.find_field("embedding").is_some(),
                    "confidence": confidence,
                }))
            }
            AgentRole::ChunkScorer => {
                let query = request.subject();
                let scores: Vec<Value> = request
                    .input
                    .find_array("documents")
                    .iter()
                    .map(|doc| {
                        json!({
                            "id": doc.get("id").cloned().unwrap_or(Value::Null),
                            "score": overlap_score(&query, doc_text(doc)),
                        })
                    })
                    .collect();
                let confidence = mean(scores.iter().filter_map(|s| s["score"].as_f64()))
                    .map(|m| m.clamp(0.1, 1.0))
                    .unwrap_or(0.2);
                Ok(json!({ "scores": scores, "confidence": confidence }))
            }
            AgentRole::Reranker => {
                let query = request.subject();
                let known: HashMap<String, f64> = request
                    .input
                    .find_array("scores")
                    .iter()
                    .filter_map(|s| Some((s.get("id")?.as_str()?.to_string(), s.get("score")?.as_f64()?)))
                    .collect();
                let mut ranked: Vec<Value> = request
                    .input
                    .find_array("documents")
                    .iter()
                    .map(|doc| {
                        let id = doc.get("id").and_then(Value::as_str).unwrap_or_default();
                        let score = known
                            .get(id)
                            .copied()
                            .unwrap_or_else(|| overlap_score(&query, doc_text(doc)));
                        json!({ "id": id, "text": doc_text(doc), "score": score })
                    })
                    .collect();
                ranked.sort_by(|a, b| {
                    let (a, b) = (a["score"].as_f64().unwrap_or(0.0), b["score"].as_f64().unwrap_or(0.0));
                    b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal)
                });
                let confidence = ranked
                    .first()
                    .and_then(|top| top["score"].as_f64())
                    .map(|s| s.clamp(0.2, 1.0))
                    .unwrap_or(0.2);
                Ok(json!({ "ranked": ranked, "confidence": confidence }))
            }
            AgentRole::TaskPlanner => {
                let prompt = format!(
                    "Break the task into short steps, one per line.\n{}",
                    request.subject()
                );
                let text = self.generate(&prompt, request).await?;
                let (body, confidence) = split_confidence(&text, 0.6);
                let steps: Vec<String> = non_empty_lines(&body)
                    .map(|line| line.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')').trim().to_string())
                    .filter(|line| !line.is_empty())
                    .collect();
                Ok(json!({ "steps": steps, "confidence": confidence }))
            }
            AgentRole::ToolSelector => {
                let mut texts: Vec<String> = request
                    .input
                    .find_array("steps")
                    .iter()
                    .filter_map(|s| s.as_str().map(str::to_lowercase))
                    .collect();
                if texts.is_empty() {
                    texts.push(request.subject().to_lowercase());
                }
                let tools: Vec<Value> = TOOL_CATALOG
                    .iter()
                    .filter_map(|(name, keywords)| {
                        let hit = texts
                            .iter()
                            .find_map(|text| keywords.iter().find(|kw| text.contains(*kw)))?;
                        Some(json!({ "name": name, "reason": format!("matched '{}'", hit) }))
                    })
                    .collect();
                if tools.is_empty() {
                    Ok(json!({
                        "tools": [{ "name": "search", "reason": "default" }],
                        "confidence": 0.4,
                    }))
                } else {
                    Ok(json!({ "tools": tools, "confidence": 0.7 }))
                }
            }
            AgentRole::ActionCaller => {
                let query = request.subject();
                let mut actions = Vec::new();
                let mut completed = 0usize;
                for tool in request.input.find_array("tools") {
                    let Some(name) = tool.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let prompt = format!("Invoke tool '{}' for the request.\n{}", name, query);
                    match self.generate(&prompt, request).await {
                        Ok(text) => {
                            completed += 1;
                            let (body, _) = split_confidence(&text, 0.5);
                            actions.push(json!({
                                "tool": name,
                                "status": "completed",
                                "output": first_line(&body).unwrap_or_default(),
                            }));
                        }
                        Err(e) => {
                            warn!(tool = name, error = %e, "tool invocation failed");
                            actions.push(json!({ "tool": name, "status": "failed", "error": e.to_string() }));
                        }
                    }
                }
                let confidence = if actions.is_empty() {
                    0.5
                } else {
                    (completed as f64 / actions.len() as f64).clamp(0.1, 0.9)
                };
                Ok(json!({ "actions": actions, "confidence": confidence }))
            }
            AgentRole::ReasoningGenerator => {
                let context: Vec<&str> = {
                    let ranked = request.input.find_array("ranked");
                    let docs = if ranked.is_empty() {
                        request.input.find_array("documents")
                    } else {
                        ranked
                    };
                    docs.iter().map(doc_text).filter(|t| !t.is_empty()).collect()
                };
                let steps: Vec<&str> = request
                    .input
                    .find_array("steps")
                    .iter()
                    .filter_map(Value::as_str)
                    .collect();
                let actions: Vec<&str> = request
                    .input
                    .find_array("actions")
                    .iter()
                    .filter_map(|a| a.get("output").and_then(Value::as_str))
                    .collect();

                let mut prompt = String::from("Answer the question using the material below.\n");
                for (title, items) in [("Context", &context), ("Plan", &steps), ("Tool results", &actions)] {
                    if !items.is_empty() {
                        prompt.push_str(title);
                        prompt.push_str(":\n");
                        for item in items.iter() {
                            prompt.push_str("- ");
                            prompt.push_str(item);
                            prompt.push('\n');
                        }
                    }
                }
                prompt.push_str("Question: ");
                prompt.push_str(&request.query);

                let text = self.generate(&prompt, request).await?;
                let (body, confidence) = split_confidence(&text, 0.6);
                let confidence = if context.is_empty() { confidence.min(0.4) } else { confidence };
                Ok(json!({
                    "answer": body.trim(),
                    "context_used": context.len(),
                    "confidence": confidence,
                }))
            }
            AgentRole::Critic => {
                let Some(answer) = request.input.find_str("answer") else {
                    return Ok(json!({
                        "critique": "no answer to review",
                        "approved": false,
                        "confidence": 0.2,
                    }));
                };
                let prompt = format!(
                    "Review the answer for accuracy and completeness.\nQuestion: {}\nAnswer: {}",
                    request.query, answer
                );
                let text = self.generate(&prompt, request).await?;
                let (body, confidence) = split_confidence(&text, 0.6);
                let lowered = body.to_lowercase();
                let approved = !(lowered.contains("incorrect") || lowered.contains("unsupported"));
                Ok(json!({
                    "critique": body.trim(),
                    "approved": approved,
                    "confidence": confidence,
                }))
            }
        }
    }
}

#[async_trait]
impl Agent for InferenceAgent {
    fn role(&self) -> AgentRole {
        self.descriptor.role
    }

    fn model(&self) -> &str {
        &self.descriptor.model
    }

    fn capabilities(&self) -> Vec<String> {
        self.role().capabilities()
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn availability(&self) -> Availability {
        if self.is_initialized() {
            Availability::Ready
        } else {
            Availability::Uninitialized
        }
    }

    #[instrument(skip(self), fields(role = %self.descriptor.role, model = %self.descriptor.model))]
    async fn initialize(&self) -> Result<(), AgentError> {
        self.backend.probe(&self.descriptor.model).await?;

        for seed in self.role().seed_inputs() {
            let request = AgentRequest::new(*seed, StageInput::Request(json!({ "query": seed })));
            let value = self.perform(&request).await?;
            if let Some(key) = self.memo_key(&request) {
                self.memo.lock().put(key, value);
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!("Agent initialized");
        Ok(())
    }

    fn mark_initialized_from_cache(&self) {
        self.restored_from_cache.store(true, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
    }

    async fn invoke(&self, request: AgentRequest) -> Result<Value, AgentError> {
        if !self.is_initialized() {
            return Err(AgentError::NotInitialized(self.role()));
        }
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let key = self.memo_key(&request);
        if let Some(key) = &key {
            if let Some(value) = self.memo.lock().get(key).cloned() {
                debug!(role = %self.role(), "memo hit");
                return Ok(value);
            }
        }

        let started = Instant::now();
        let result = self.perform(&request).await;
        self.total_latency_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);

        match &result {
            Ok(value) => {
                if let Some(key) = key {
                    self.memo.lock().put(key, value.clone());
                }
            }
            Err(_) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn export_warmup(&self) -> Result<Value, AgentError> {
        if !self.is_initialized() {
            return Err(AgentError::NotInitialized(self.role()));
        }
        let memo = self.memo.lock();
        let entries: Vec<Value> = memo
            .iter()
            .take(WARMUP_LIMIT)
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        Ok(json!({
            "role": self.role(),
            "model": self.descriptor.model,
            "entries": entries,
        }))
    }

    fn import_warmup(&self, payload: &Value) -> Result<(), AgentError> {
        let role = payload.get("role").and_then(Value::as_str);
        if role != Some(self.role().as_str()) {
            return Err(AgentError::Warmup(format!(
                "payload for {:?} offered to '{}'",
                role,
                self.role()
            )));
        }
        let entries = payload
            .get("entries")
            .and_then(Value::as_array)
            .ok_or_else(|| AgentError::Warmup("missing entries".to_string()))?;

        let mut memo = self.memo.lock();
        // Exported most-recent first; replay oldest first to keep recency.
        for entry in entries.iter().rev() {
            if let (Some(key), Some(value)) = (entry.get("key").and_then(Value::as_str), entry.get("value")) {
                memo.put(key.to_string(), value.clone());
            }
        }
        Ok(())
    }

    fn health(&self) -> AgentHealth {
        let requests = self.request_count.load(Ordering::Relaxed);
        let errors = self.error_count.load(Ordering::Relaxed);
        let latency = self.total_latency_ms.load(Ordering::Relaxed);
        AgentHealth {
            role: self.role(),
            status: self.availability(),
            details: self
                .restored_from_cache()
                .then(|| "restored from initialization cache".to_string()),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            total_requests: requests,
            error_count: errors,
            average_response_time_ms: latency as f64 / requests.max(1) as f64,
        }
    }
}

/// Stand-in for a role that cannot be served.
///
/// A disabled agent has no model configured and reports itself uninitialized.
/// A degraded agent is produced by the construction guard and reports itself
/// initialized. Neither serves requests.
pub struct DisabledAgent {
    role: AgentRole,
    model: String,
    reason: String,
    degraded: bool,
    start_time: Instant,
}

impl DisabledAgent {
    pub fn disabled(role: AgentRole, reason: impl Into<String>) -> Self {
        Self {
            role,
            model: String::new(),
            reason: reason.into(),
            degraded: false,
            start_time: Instant::now(),
        }
    }

    pub fn degraded(role: AgentRole, model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            role,
            model: model.into(),
            reason: reason.into(),
            degraded: true,
            start_time: Instant::now(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    fn error(&self) -> AgentError {
        AgentError::Disabled {
            role: self.role,
            reason: self.reason.clone(),
        }
    }
}

#[async_trait]
impl Agent for DisabledAgent {
    fn role(&self) -> AgentRole {
        self.role
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_initialized(&self) -> bool {
        self.degraded
    }

    fn availability(&self) -> Availability {
        if self.degraded {
            Availability::Degraded
        } else {
            Availability::Disabled
        }
    }

    async fn initialize(&self) -> Result<(), AgentError> {
        if self.degraded {
            Ok(())
        } else {
            Err(self.error())
        }
    }

    fn mark_initialized_from_cache(&self) {}

    async fn invoke(&self, _request: AgentRequest) -> Result<Value, AgentError> {
        Err(self.error())
    }

    fn export_warmup(&self) -> Result<Value, AgentError> {
        Err(self.error())
    }

    fn import_warmup(&self, _payload: &Value) -> Result<(), AgentError> {
        Err(self.error())
    }

    fn health(&self) -> AgentHealth {
        AgentHealth {
            role: self.role,
            status: self.availability(),
            details: Some(self.reason.clone()),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            total_requests: 0,
            error_count: 0,
            average_response_time_ms: 0.0,
        }
    }
}

// --- response helpers ---

/// Strip a trailing `confidence: <x>` line and return it, clamped to [0, 1].
fn split_confidence(text: &str, default: f64) -> (String, f64) {
    let mut confidence = default;
    let mut body = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        let parsed = trimmed
            .get(..11)
            .filter(|prefix| prefix.eq_ignore_ascii_case("confidence:"))
            .and_then(|_| trimmed[11..].trim().parse::<f64>().ok());
        match parsed {
            Some(value) if value.is_finite() => confidence = value.clamp(0.0, 1.0),
            _ => body.push(line),
        }
    }
    (body.join("\n"), confidence)
}

fn non_empty_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|line| !line.is_empty())
}

fn first_line(text: &str) -> Option<&str> {
    non_empty_lines(text).next()
}

fn doc_text(doc: &Value) -> &str {
    doc.get("text")
        .and_then(Value::as_str)
        .or_else(|| doc.as_str())
        .unwrap_or_default()
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Share of query terms that occur in `text`.
fn overlap_score(query: &str, text: &str) -> f64 {
    let wanted = terms(query);
    if wanted.is_empty() {
        return 0.0;
    }
    let present = terms(text);
    wanted.intersection(&present).count() as f64 / wanted.len() as f64
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OfflineBackend;

    fn agent(role: AgentRole) -> InferenceAgent {
        let backend = Arc::new(OfflineBackend::new("offline://test"));
        InferenceAgent::new(AgentDescriptor::new(role, "test-model", "offline://test"), backend)
    }

    #[test]
    fn roles_round_trip_through_their_names() {
        for role in AgentRole::ALL {
            assert_eq!(role.as_str().parse::<AgentRole>().unwrap(), role);
        }
        assert_eq!("Tool-Selector".parse::<AgentRole>().unwrap(), AgentRole::ToolSelector);
        assert!("librarian".parse::<AgentRole>().is_err());
    }

    #[test]
    fn secrets_are_removed_at_every_depth() {
        let descriptor = AgentDescriptor::new(AgentRole::Retriever, "m", "http://x")
            .with_option("api_key", json!("sk-123"))
            .with_option("top_k", json!(5))
            .with_option("auth", json!({ "bearer_token": "t", "scheme": "bearer" }));
        let clean = descriptor.sanitized_configuration();
        assert!(!clean.contains_key("api_key"));
        assert_eq!(clean["top_k"], json!(5));
        assert_eq!(clean["auth"], json!({ "scheme": "bearer" }));
    }

    #[test]
    fn confidence_lines_are_extracted() {
        let (body, c) = split_confidence("answer\nConfidence: 0.93", 0.5);
        assert_eq!(body, "answer");
        assert!((c - 0.93).abs() < 1e-9);

        let (_, c) = split_confidence("no marker", 0.5);
        assert_eq!(c, 0.5);

        let (_, c) = split_confidence("confidence: 7", 0.5);
        assert_eq!(c, 1.0);
    }

    #[tokio::test]
    async fn uninitialized_agent_refuses_requests() {
        let agent = agent(AgentRole::Critic);
        let err = agent
            .invoke(AgentRequest::new("q", StageInput::Single(None)))
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::NotInitialized(AgentRole::Critic));
    }

    #[tokio::test]
    async fn warmup_payload_restores_memo() {
        let source = agent(AgentRole::Embedder);
        source.initialize().await.unwrap();
        assert!(source.memo_len() >= 4);
        let payload = source.export_warmup().unwrap();

        let restored = agent(AgentRole::Embedder);
        restored.mark_initialized_from_cache();
        restored.import_warmup(&payload).unwrap();
        assert_eq!(restored.memo_len(), source.memo_len());
        assert!(restored.restored_from_cache());

        let wrong_role = agent(AgentRole::Retriever);
        assert!(wrong_role.import_warmup(&payload).is_err());
    }

    #[tokio::test]
    async fn reranker_orders_by_upstream_scores() {
        let agent = agent(AgentRole::Reranker);
        agent.mark_initialized_from_cache();
        let mut slots = BTreeMap::new();
        slots.insert(
            "retrieve".to_string(),
            Some(json!({ "documents": [
                { "id": "doc-0", "text": "alpha" },
                { "id": "doc-1", "text": "beta" },
            ]})),
        );
        slots.insert(
            "chunk_score".to_string(),
            Some(json!({ "scores": [
                { "id": "doc-0", "score": 0.1 },
                { "id": "doc-1", "score": 0.9 },
            ]})),
        );
        let out = agent
            .invoke(AgentRequest::new("q", StageInput::Bundle(slots)))
            .await
            .unwrap();
        assert_eq!(out["ranked"][0]["id"], "doc-1");
    }

    #[tokio::test]
    async fn missing_upstream_degrades_instead_of_failing() {
        for role in [AgentRole::Reranker, AgentRole::ToolSelector, AgentRole::Critic, AgentRole::ReasoningGenerator] {
            let agent = agent(role);
            agent.mark_initialized_from_cache();
            let out = agent
                .invoke(AgentRequest::new("what is rust", StageInput::Single(None)))
                .await
                .unwrap();
            assert!(out["confidence"].as_f64().is_some(), "{role} returned {out}");
        }
    }

    #[tokio::test]
    async fn disabled_agent_fails_every_operation() {
        let agent = DisabledAgent::disabled(AgentRole::Critic, "no model configured");
        assert!(!agent.is_initialized());
        assert_eq!(agent.availability(), Availability::Disabled);
        assert!(agent.initialize().await.is_err());
        assert!(agent
            .invoke(AgentRequest::new("q", StageInput::Single(None)))
            .await
            .is_err());
        assert!(agent.capabilities().is_empty());

        let degraded = DisabledAgent::degraded(AgentRole::Critic, "m", "guard tripped");
        assert!(degraded.is_initialized());
        assert_eq!(degraded.availability(), Availability::Degraded);
    }
}
