//! foundry-bots: run a coordinator, a role worker or the supervisor against a
//! foundry broker.
//!
//!   foundry-bots plan                  plan the project structure once
//!   foundry-bots coordinator           dispatch and track subtasks
//!   foundry-bots worker --role tester  serve one role's queue
//!   foundry-bots supervisor [--plan]   monitor the pipeline
//!
//! Provider API keys are read from the environment variables named in the
//! config file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use foundry_sdk::client::{BrokerApi, BrokerClient};
use foundry_sdk::protocol::Role;
use tracing_subscriber::EnvFilter;

use foundry_bots::config::FoundryConfig;
use foundry_bots::coordinator::Coordinator;
use foundry_bots::llm::FallbackChain;
use foundry_bots::supervisor::{self, Supervisor};
use foundry_bots::ticker::TokioTicker;
use foundry_bots::worker::Worker;

#[derive(Parser)]
#[command(name = "foundry-bots", about = "Coordinator, workers and supervisor for a foundry broker")]
struct Cli {
    /// Config file (missing file = defaults)
    #[arg(long, env = "FOUNDRY_CONFIG", default_value = "foundry.toml")]
    config: PathBuf,

    /// Broker base URL (overrides the config file)
    #[arg(long, env = "FOUNDRY_BROKER_URL")]
    broker_url: Option<String>,

    /// Project goal (overrides the config file)
    #[arg(long, env = "FOUNDRY_TARGET")]
    target: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for a structure, then dispatch subtasks until every file is done
    Coordinator,
    /// Serve one role's queue
    Worker {
        #[arg(long)]
        role: Role,
    },
    /// Monitor workers, failures and logs
    Supervisor {
        /// Plan and submit the structure before monitoring
        #[arg(long)]
        plan: bool,
    },
    /// Plan the structure, submit it and exit
    Plan,
}

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("FOUNDRY_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("foundry_bots=info".parse()?)
        .add_directive("foundry_sdk=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    let mut config = FoundryConfig::load(&cli.config)?;
    if let Some(url) = cli.broker_url {
        config.broker_url = url;
    }
    if let Some(target) = cli.target {
        config.target = target;
    }

    let client = BrokerClient::new(&config.broker_url)
        .with_timeout(Duration::from_secs(config.coordinator.request_timeout_secs));
    tracing::info!("Using broker at {}", client.base_url());

    tokio::select! {
        result = run(cli.command, config, client) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}

async fn run(command: Command, config: FoundryConfig, client: BrokerClient) -> Result<()> {
    match command {
        Command::Coordinator => {
            if config.target.is_empty() {
                bail!("No target set: pass --target or set `target` in the config file");
            }
            let broker: Arc<dyn BrokerApi> = Arc::new(client);
            let mut coordinator =
                Coordinator::new(broker, config.coordinator.clone(), config.target.clone());
            coordinator.run(&mut TokioTicker).await?;
            tracing::info!("All subtasks finished");
        }
        Command::Worker { role } => {
            let generator = generator(&config, Some(role))?;
            let broker: Arc<dyn BrokerApi> = Arc::new(client);
            let worker = Worker::new(
                role,
                broker,
                Arc::new(generator),
                config.worker.clone(),
                config.generation.clone(),
            );
            worker.run(&mut TokioTicker).await;
        }
        Command::Supervisor { plan } => {
            if plan {
                plan_structure(&config, &client).await?;
            }
            let mut supervisor = Supervisor::new(client, config.supervisor.clone())?;
            supervisor.run(&mut TokioTicker).await;
        }
        Command::Plan => {
            plan_structure(&config, &client).await?;
        }
    }
    Ok(())
}

async fn plan_structure(config: &FoundryConfig, client: &BrokerClient) -> Result<()> {
    if config.target.is_empty() {
        bail!("No target set: pass --target or set `target` in the config file");
    }
    let generator = generator(config, None)?;
    let structure =
        supervisor::plan(client, &generator, &config.generation, &config.target).await?;
    for file in structure.files() {
        tracing::info!("  {file}");
    }
    Ok(())
}

fn generator(config: &FoundryConfig, role: Option<Role>) -> Result<FallbackChain> {
    let chain = config
        .generator_for(role)
        .context("Failed to build generator chain")?;
    if chain.is_empty() {
        bail!("No usable generation providers: add [[providers]] to the config and set their API keys");
    }
    tracing::info!("Generators: {}", chain.names().join(" -> "));
    Ok(chain)
}
