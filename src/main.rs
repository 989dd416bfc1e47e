//! Command-line entry point for the simrunner load simulator.
//!
//! ```bash
//! # Run a simulation against MongoDB
//! simrunner workload.yaml
//!
//! # Dry run against the in-memory store, verbose logging
//! RUST_LOG=simrunner=debug simrunner --connection-string memory://local workload.yaml
//! ```

use anyhow::Context;
use clap::Parser;
use simrunner::config::{substitute_env_vars, RunConfig};
use simrunner::registry::RunnerRegistry;
use simrunner::runner::SimRunner;
use simrunner_generator::GeneratorRegistry;

#[derive(Parser)]
#[command(name = "simrunner", about = "Synthetic load simulator for document stores")]
struct Cli {
    /// Path to the YAML simulation config
    config: std::path::PathBuf,

    /// Override the config's connection string
    #[arg(long, env = "SIMRUNNER_CONNECTION_STRING")]
    connection_string: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("cannot read config file {}", cli.config.display()))?;
    let mut config = RunConfig::parse(&substitute_env_vars(&raw))
        .with_context(|| format!("cannot parse config file {}", cli.config.display()))?;
    if let Some(uri) = cli.connection_string {
        config.connection_string = uri;
    }

    let runner = SimRunner::new(
        config,
        GeneratorRegistry::default(),
        RunnerRegistry::default(),
    )
    .await?;
    runner.start().await
}
