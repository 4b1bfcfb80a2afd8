//! Configuration management for the valuation agent

use std::path::Path;

use config::{Config, Environment, File};
use serde::Deserialize;
use valuator_core::Subject;

use crate::error::{credential, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub subject: Subject,
    pub sources: SourcesConfig,
    pub inference: InferenceConfig,
    pub chain: ChainConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    pub timeout_seconds: u64,
    pub zillow: ZillowConfig,
    pub rentcast: RentcastConfig,
    pub index_feed: IndexFeedConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ZillowConfig {
    pub base_url: String,
    pub host: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RentcastConfig {
    pub base_url: String,
    pub property_type: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexFeedConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    pub url: String,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    /// RPC endpoint; `{key}` is replaced with `rpc_key`
    pub rpc_url: String,
    #[serde(default)]
    pub rpc_key: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    pub contract_address: String,
    pub gas_limit: u64,
    pub receipt_timeout_seconds: u64,
}

impl ChainConfig {
    pub fn endpoint(&self) -> Result<String> {
        if self.rpc_url.contains("{key}") {
            let key = credential(&self.rpc_key, "chain.rpc_key")?;
            Ok(self.rpc_url.replace("{key}", key))
        } else {
            Ok(self.rpc_url.clone())
        }
    }
}

/// Which data sources must be present before inference is attempted.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequiredSources {
    /// Every configured source must return data
    #[default]
    All,
    /// At least one source must return data
    Any,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    pub required_sources: RequiredSources,
    /// Write results on-chain after a successful valuation
    pub settle: bool,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            // Start with default values
            .set_default("subject.property_id", "PROP001")?
            .set_default("subject.address", "7849 S Drexel Ave, Chicago, IL 60619")?
            .set_default("subject.valuation_usd", 290_000)?
            .set_default("subject.size_sqm", 135.0)?
            .set_default("subject.default_risk_score", 75)?
            .set_default("subject.location_score", 80)?
            .set_default("sources.timeout_seconds", 30)?
            .set_default("sources.zillow.base_url", "https://zillow-working-api.p.rapidapi.com")?
            .set_default("sources.zillow.host", "zillow-working-api.p.rapidapi.com")?
            .set_default("sources.rentcast.base_url", "https://api.rentcast.io")?
            .set_default("sources.rentcast.property_type", "Single Family")?
            .set_default("sources.index_feed.url", "http://localhost:3000/api/fetch-data")?
            .set_default("inference.url", "https://api.asi1.ai/v1/chat/completions")?
            .set_default("inference.timeout_seconds", 120)?
            .set_default("chain.rpc_url", "https://base-sepolia.infura.io/v3/{key}")?
            .set_default("chain.contract_address", "0x4Fea3A6A4CBaCBc848065D18F04B9524d635e1e4")?
            .set_default("chain.gas_limit", 1_000_000)?
            .set_default("chain.receipt_timeout_seconds", 180)?
            .set_default("policy.required_sources", "all")?
            .set_default("policy.settle", true)?
            // Load from config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (VALUATOR__INFERENCE__API_KEY, etc.)
        let config = builder
            .add_source(
                Environment::with_prefix("VALUATOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
