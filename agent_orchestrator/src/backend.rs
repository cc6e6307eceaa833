//! Inference transport used by agents.
//!
//! The orchestration core never talks to a model server directly; agents hold
//! an `Arc<dyn InferenceBackend>` and pass the endpoint and model identifier
//! from their descriptor through unchanged.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use crate::error::BackendError;
use crate::settings::InferenceConfig;

/// Text generation and embedding transport.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Address the backend talks to.
    fn endpoint(&self) -> &str;

    /// Ask the server to load `model` and confirm it answers.
    async fn probe(&self, model: &str) -> Result<(), BackendError>;

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        deadline: Option<Instant>,
    ) -> Result<String, BackendError>;

    async fn embed(
        &self,
        model: &str,
        text: &str,
        deadline: Option<Instant>,
    ) -> Result<Vec<f32>, BackendError>;
}

/// Build the backend named in the inference configuration.
pub fn from_config(config: &InferenceConfig) -> Arc<dyn InferenceBackend> {
    match config.backend.as_str() {
        "offline" => Arc::new(OfflineBackend::new(&config.endpoint)),
        _ => Arc::new(HttpBackend::new(&config.endpoint, config.request_timeout())),
    }
}

fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>, BackendError> {
    match deadline {
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                Err(BackendError::DeadlineExceeded)
            } else {
                Ok(Some(left))
            }
        }
        None => Ok(None),
    }
}

// --- HTTP transport ---

/// Client for model servers exposing the Ollama-style JSON API
/// (`/api/generate`, `/api/embeddings`, `/api/models/load/{model}`).
pub struct HttpBackend {
    endpoint: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl HttpBackend {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            request_timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn transport_error(&self, err: impl std::fmt::Display) -> BackendError {
        BackendError::Transport {
            endpoint: self.endpoint.clone(),
            message: err.to_string(),
        }
    }

    fn timeout_for(&self, deadline: Option<Instant>) -> Result<Duration, BackendError> {
        Ok(remaining(deadline)?
            .map(|left| left.min(self.request_timeout))
            .unwrap_or(self.request_timeout))
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[instrument(skip(self))]
    async fn probe(&self, model: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url(&format!("/api/models/load/{}", model)))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::ModelUnavailable(model.to_string()))
        }
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        deadline: Option<Instant>,
    ) -> Result<String, BackendError> {
        let timeout = self.timeout_for(deadline)?;
        let response = self
            .client
            .post(self.url("/api/generate"))
            .timeout(timeout)
            .json(&json!({ "model": model, "prompt": prompt, "stream": false }))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?
            .error_for_status()
            .map_err(|e| self.transport_error(e))?;

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        Ok(body.response)
    }

    async fn embed(
        &self,
        model: &str,
        text: &str,
        deadline: Option<Instant>,
    ) -> Result<Vec<f32>, BackendError> {
        let timeout = self.timeout_for(deadline)?;
        let response = self
            .client
            .post(self.url("/api/embeddings"))
            .timeout(timeout)
            .json(&json!({ "model": model, "prompt": text }))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?
            .error_for_status()
            .map_err(|e| self.transport_error(e))?;

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        if body.embedding.is_empty() {
            return Err(BackendError::Malformed("empty embedding".to_string()));
        }
        Ok(body.embedding)
    }
}

// --- Offline transport ---

/// Deterministic, network-free backend for dry runs and tests.
///
/// Generation echoes the last non-empty prompt line in a few variants and
/// embeddings are derived from a SHA-256 digest of the text. Latency and
/// failures can be injected per model.
pub struct OfflineBackend {
    endpoint: String,
    probe_latency: Duration,
    generate_latency: HashMap<String, Duration>,
    failing_models: HashSet<String>,
    unavailable_models: HashSet<String>,
    probe_calls: AtomicU64,
    generate_calls: AtomicU64,
    embed_calls: AtomicU64,
}

/// Width of the vectors produced by [`OfflineBackend::embed`].
pub const OFFLINE_EMBEDDING_DIM: usize = 16;

impl OfflineBackend {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            probe_latency: Duration::ZERO,
            generate_latency: HashMap::new(),
            failing_models: HashSet::new(),
            unavailable_models: HashSet::new(),
            probe_calls: AtomicU64::new(0),
            generate_calls: AtomicU64::new(0),
            embed_calls: AtomicU64::new(0),
        }
    }

    /// Simulated model load time, paid on every `probe`.
    pub fn with_probe_latency(mut self, latency: Duration) -> Self {
        self.probe_latency = latency;
        self
    }

    pub fn with_generate_latency(mut self, model: &str, latency: Duration) -> Self {
        self.generate_latency.insert(model.to_string(), latency);
        self
    }

    /// Generation and embedding calls for `model` fail.
    pub fn with_failing_model(mut self, model: &str) -> Self {
        self.failing_models.insert(model.to_string());
        self
    }

    /// Probing `model` fails, so agents using it never initialize.
    pub fn with_unavailable_model(mut self, model: &str) -> Self {
        self.unavailable_models.insert(model.to_string());
        self
    }

    pub fn probe_calls(&self) -> u64 {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> u64 {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn embed_calls(&self) -> u64 {
        self.embed_calls.load(Ordering::SeqCst)
    }

    fn check_model(&self, model: &str) -> Result<(), BackendError> {
        if self.failing_models.contains(model) {
            return Err(BackendError::Transport {
                endpoint: self.endpoint.clone(),
                message: format!("model '{}' returned an error", model),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl InferenceBackend for OfflineBackend {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn probe(&self, model: &str) -> Result<(), BackendError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if !self.probe_latency.is_zero() {
            tokio::time::sleep(self.probe_latency).await;
        }
        if self.unavailable_models.contains(model) {
            return Err(BackendError::ModelUnavailable(model.to_string()));
        }
        Ok(())
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        deadline: Option<Instant>,
    ) -> Result<String, BackendError> {
        remaining(deadline)?;
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.generate_latency.get(model) {
            tokio::time::sleep(*latency).await;
        }
        self.check_model(model)?;

        let subject = prompt
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("");
        debug!(model, "offline generation");
        Ok(format!(
            "{subject}\nrelated: {subject}\nbackground: {subject}\nconfidence: 0.80"
        ))
    }

    async fn embed(
        &self,
        model: &str,
        text: &str,
        deadline: Option<Instant>,
    ) -> Result<Vec<f32>, BackendError> {
        remaining(deadline)?;
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.check_model(model)?;

        let digest = Sha256::digest(text.as_bytes());
        Ok(digest
            .iter()
            .take(OFFLINE_EMBEDDING_DIM)
            .map(|byte| (*byte as f32 / 127.5) - 1.0)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_generation_is_deterministic() {
        let backend = OfflineBackend::new("offline://test");
        let a = backend.generate("m", "prompt\nwhat is rust", None).await.unwrap();
        let b = backend.generate("m", "prompt\nwhat is rust", None).await.unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("what is rust"));
        assert_eq!(backend.generate_calls(), 2);
    }

    #[tokio::test]
    async fn offline_embeddings_have_fixed_width() {
        let backend = OfflineBackend::new("offline://test");
        let v = backend.embed("m", "hello", None).await.unwrap();
        assert_eq!(v.len(), OFFLINE_EMBEDDING_DIM);
        assert!(v.iter().all(|x| (-1.0..=1.0).contains(x)));
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let backend = OfflineBackend::new("offline://test")
            .with_failing_model("broken")
            .with_unavailable_model("missing");
        tokio_test::assert_err!(backend.generate("broken", "x", None).await);
        assert_eq!(
            backend.probe("missing").await,
            Err(BackendError::ModelUnavailable("missing".to_string()))
        );
        tokio_test::assert_ok!(backend.probe("broken").await);
    }

    #[tokio::test]
    async fn expired_deadline_is_rejected_before_sending() {
        let backend = OfflineBackend::new("offline://test");
        let past = Instant::now() - Duration::from_millis(5);
        assert_eq!(
            backend.generate("m", "x", Some(past)).await,
            Err(BackendError::DeadlineExceeded)
        );
        assert_eq!(backend.generate_calls(), 0);
    }
}
