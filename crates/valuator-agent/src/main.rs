//! Valuator
//!
//! Real-world-asset valuation agent. Collects market data for a property,
//! asks an LLM inference service for updated figures, validates the reply and
//! writes the result to the property's token contract.
//!
//! # Commands
//!
//! - `valuate`: property valuation with on-chain settlement (`--dry-run` skips the chain)
//! - `rebalance`: index rebalancing signals from the index feed
//!
//! Logs go to stderr; the JSON run report is printed to stdout.

mod chain;
mod config;
mod error;
mod inference;
mod pipeline;
mod sources;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use clap::{Parser, Subcommand};
use tokio::runtime::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::chain::EvmChain;
use crate::config::AppConfig;
use crate::error::{mask, AgentError};
use crate::inference::AsiOneClient;
use crate::pipeline::{PipelineOrchestrator, Settlement};
use crate::sources::{DataSource, IndexFeedClient, RentcastClient, ZillowClient};

#[derive(Debug, Parser)]
#[command(name = "valuator", version, about = "RWA valuation agent")]
struct Cli {
    /// Extra configuration file, layered over config/default and config/local
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Value the configured property and write the result on-chain
    Valuate {
        /// Evaluate only; never touch the chain
        #[arg(long)]
        dry_run: bool,
    },
    /// Produce rebalancing signals for the index basket
    Rebalance,
}

fn main() -> anyhow::Result<()> {
    // Logs on stderr, stdout is reserved for the report
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("valuator_agent=info,valuator_core=info")
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting valuator");

    let rt = Runtime::new()?;
    match rt.block_on(run(&cli)) {
        Ok(report) => {
            println!("{report}");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, fatal = e.is_fatal(), "Run aborted");
            Err(e.into())
        }
    }
}

async fn run(cli: &Cli) -> error::Result<String> {
    let config = AppConfig::load(cli.config.as_deref())?;
    log_credentials(&config);

    let timeout = Duration::from_secs(config.sources.timeout_seconds);
    let inference = Arc::new(AsiOneClient::new(&config.inference)?);

    let report = match cli.command {
        Command::Valuate { dry_run } => {
            let sources: Vec<Arc<dyn DataSource>> = vec![
                Arc::new(ZillowClient::new(&config.sources.zillow, timeout)?),
                Arc::new(RentcastClient::new(&config.sources.rentcast, timeout)?),
            ];
            let mut orchestrator =
                PipelineOrchestrator::new(sources, inference, config.policy.required_sources);

            if dry_run || !config.policy.settle {
                tracing::info!(dry_run = dry_run, settle = config.policy.settle, "On-chain settlement off");
            } else {
                orchestrator = orchestrator.with_settlement(settlement(&config)?);
            }

            orchestrator.run_valuation(&config.subject).await?
        }
        Command::Rebalance => {
            let sources: Vec<Arc<dyn DataSource>> = vec![Arc::new(IndexFeedClient::new(
                &config.sources.index_feed,
                timeout,
            )?)];
            PipelineOrchestrator::new(sources, inference, config.policy.required_sources)
                .run_rebalance()
                .await?
        }
    };

    tracing::info!(run_id = %report.run_id, stage = %report.stage, "Run finished");
    Ok(serde_json::to_string_pretty(&report)?)
}

/// Chain credentials are checked here, before any data is collected.
fn settlement(config: &AppConfig) -> error::Result<Settlement> {
    let contract: Address = config.chain.contract_address.parse().map_err(|e| {
        AgentError::Config(format!(
            "Invalid contract address {}: {e}",
            config.chain.contract_address
        ))
    })?;

    Ok(Settlement {
        chain: Arc::new(EvmChain::connect(&config.chain)?),
        contract,
        gas_limit: config.chain.gas_limit,
    })
}

fn log_credentials(config: &AppConfig) {
    tracing::info!(
        zillow = %mask(config.sources.zillow.api_key.as_deref()),
        rentcast = %mask(config.sources.rentcast.api_key.as_deref()),
        inference = %mask(config.inference.api_key.as_deref()),
        rpc = %mask(config.chain.rpc_key.as_deref()),
        wallet = %mask(config.chain.private_key.as_deref()),
        "Credential check"
    );
    tracing::info!(
        property_id = %config.subject.id,
        address = %config.subject.address,
        required_sources = ?config.policy.required_sources,
        contract = %config.chain.contract_address,
        "Configuration loaded"
    );
}
