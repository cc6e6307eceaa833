//! Main entry point for the agent orchestrator CLI.

use agent_orchestrator::{
    batch,
    cache::AgentInitializationCache,
    cli::{self, CacheAction, Commands},
    orchestrator::Orchestrator,
    pipeline::PipelineResult,
    server,
    settings::Settings,
    telemetry,
};
use anyhow::{Context, Result};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let mut settings = Settings::load_from(args.config.as_deref())?;
    if args.offline {
        settings.inference.backend = "offline".to_string();
    }

    telemetry::init(&settings.logging)?;

    match args.command {
        Commands::Serve { addr } => server::serve(settings, addr).await,
        Commands::Batch { file } => batch::run(file, settings).await,
        Commands::Run { query, json, warm } => {
            let orchestrator = Orchestrator::new(settings)?;
            if warm {
                orchestrator.initialize_all().await;
            }
            let result = tokio::select! {
                result = orchestrator.execute(&query) => result,
                _ = tokio::signal::ctrl_c() => {
                    orchestrator.shutdown().await;
                    anyhow::bail!("interrupted");
                }
            };
            orchestrator.shutdown().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            Ok(())
        }
        Commands::Preload { strategy, load } => {
            let orchestrator = Orchestrator::new(settings)?;
            if let Some(load) = load {
                orchestrator.adapt(Some(load));
            }
            let report = orchestrator.preload(strategy).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Load { role } => {
            let orchestrator = Orchestrator::new(settings)?;
            let health = orchestrator.load_agent(role).await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
        Commands::Cache { action } => {
            let cache = AgentInitializationCache::new(settings.cache.clone());
            match action {
                CacheAction::Stats => {}
                CacheAction::Cleanup => println!("Removed {} expired entries", cache.cleanup()),
                CacheAction::Clear => {
                    cache.clear();
                    println!("Cache cleared");
                }
            }
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
            Ok(())
        }
        Commands::Status => {
            let orchestrator = Orchestrator::new(settings)?;
            let status = serde_json::to_string_pretty(&orchestrator.status())
                .context("Failed to serialize status")?;
            println!("{}", status);
            Ok(())
        }
    }
}

fn print_result(result: &PipelineResult) {
    println!("\n=== Query ===");
    println!("{}", result.query);
    if let Some(answer) = &result.answer {
        println!("\n=== Answer ===");
        match answer.as_str() {
            Some(text) => println!("{}", text),
            None => println!("{}", answer),
        }
    }
    println!(
        "\nConfidence: {:.2}  Stages: {}/{}  Duration: {}ms",
        result.confidence,
        result.completed_stages.len(),
        result.stage_states.len(),
        result.duration_ms
    );
    for failure in &result.failures {
        println!("  ! {}: {}", failure.stage, failure.message);
    }
}
