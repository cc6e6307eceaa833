//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::agent::AgentRole;
use crate::preloader::PreloadStrategy;
use crate::recorder::LoadLevel;

/// Agent orchestrator CLI
#[derive(Debug, Parser)]
#[command(name = "orchestrator-cli")]
#[command(about = "Builds, caches and preloads retrieval agents and runs queries through them")]
#[command(version)]
pub struct Cli {
    /// Local configuration file layered over the built-in defaults
    #[arg(short, long, global = true, env = "AGO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Use the deterministic offline backend instead of the configured endpoint
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind to, overriding `server.host` and `server.port`
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Run one query through the pipeline
    Run {
        #[arg(short, long)]
        query: String,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,

        /// Build every agent tier before running
        #[arg(long)]
        warm: bool,
    },
    /// Run the queries listed in a batch file
    Batch {
        /// Path to the batch configuration file
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Preload agents once and report what was built
    Preload {
        #[arg(short, long, value_enum)]
        strategy: Option<PreloadStrategy>,

        /// Retune the preloader for this load level first
        #[arg(long, value_enum)]
        load: Option<LoadLevel>,
    },
    /// Build a single agent and print its health
    Load {
        role: AgentRole,
    },
    /// Inspect or maintain the initialization cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Print orchestrator status as JSON
    Status,
}

#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Entry counts, hit rate and storage location
    Stats,
    /// Remove expired entries from memory and disk
    Cleanup,
    /// Remove every entry
    Clear,
}
