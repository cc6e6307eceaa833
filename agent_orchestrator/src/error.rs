//! Error types shared by the orchestration core.
//!
//! Application boundaries (CLI, settings, HTTP server) use `anyhow`; the
//! components below return these typed errors so callers can tell a stage
//! timeout from an agent failure.

use thiserror::Error;

use crate::agent::AgentRole;

/// Errors raised by an inference transport.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("deadline exceeded before the request could be sent")]
    DeadlineExceeded,

    #[error("malformed response from backend: {0}")]
    Malformed(String),

    #[error("model '{0}' is not available")]
    ModelUnavailable(String),
}

/// Errors raised by an agent's own operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    #[error("agent '{role}' is disabled: {reason}")]
    Disabled { role: AgentRole, reason: String },

    #[error("agent '{0}' has not been initialized")]
    NotInitialized(AgentRole),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("warm-up payload rejected: {0}")]
    Warmup(String),
}

/// Errors raised by the initialization cache. None of these escape the
/// factory; they only decide whether a build goes through the cached path.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("could not export warm-up state: {0}")]
    Warmup(#[source] AgentError),

    #[error("cache entry for '{role}' does not match the agent: {reason}")]
    Mismatch { role: AgentRole, reason: String },
}

/// Outcome of a failed construction attempt. Cloneable because concurrent
/// callers share one in-flight build.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BuildError {
    #[error("agent '{role}' failed to initialize: {message}")]
    Initialization { role: AgentRole, message: String },

    #[error("agent '{role}' did not initialize within {timeout_ms}ms")]
    Timeout { role: AgentRole, timeout_ms: u64 },

    #[error("build of '{0}' abandoned by a factory reset")]
    Abandoned(AgentRole),
}

/// Failure of a single pipeline stage.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageFailure {
    #[error("stage '{stage}' timed out after {timeout_ms}ms")]
    Timeout { stage: String, timeout_ms: u64 },

    #[error("stage '{stage}' failed: {message}")]
    Agent { stage: String, message: String },

    #[error("stage '{stage}' has no usable '{role}' agent")]
    Unavailable { stage: String, role: AgentRole },

    #[error("pipeline deadline exhausted before stage '{stage}'")]
    DeadlineExhausted { stage: String },
}

impl StageFailure {
    pub fn stage(&self) -> &str {
        match self {
            StageFailure::Timeout { stage, .. }
            | StageFailure::Agent { stage, .. }
            | StageFailure::Unavailable { stage, .. }
            | StageFailure::DeadlineExhausted { stage } => stage,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StageFailure::Timeout { .. })
    }
}

/// Invalid stage graph. Raised once, when the executor is constructed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    Empty,

    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    #[error("dependency cycle between stages: {}", stages.join(", "))]
    Cycle { stages: Vec<String> },
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("unknown agent role '{0}'")]
pub struct UnknownRole(pub String);
