//! Agent Orchestrator - Core Library
//!
//! Builds role-specialized retrieval agents on demand, caches their
//! initialization state, preloads the likely ones and runs each request
//! through a dependency-ordered stage pipeline.

pub mod agent;
pub mod backend;
pub mod batch;
pub mod cache;
pub mod cli;
pub mod context;
pub mod error;
pub mod factory;
pub mod orchestrator;
pub mod pipeline;
pub mod preloader;
pub mod recorder;
pub mod server;
pub mod settings;
pub mod telemetry;

pub use agent::{Agent, AgentRole};
pub use context::OrchestratorContext;
pub use factory::AgentFactory;
pub use orchestrator::Orchestrator;
pub use pipeline::{PipelineExecutor, PipelineResult};
pub use settings::Settings;
