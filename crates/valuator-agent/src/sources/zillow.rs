//! Zillow (via RapidAPI) - market comparables and price history

use std::time::Duration;

use reqwest::Client;
use valuator_core::{DatasetOutcome, ExternalDataset, SourceKind};

use super::{get_json, http_client, settle_outcome, DataSource};
use crate::config::ZillowConfig;
use crate::error::{credential, mask, Result};

pub struct ZillowClient {
    client: Client,
    config: ZillowConfig,
}

impl ZillowClient {
    pub fn new(config: &ZillowConfig, timeout: Duration) -> Result<Self> {
        tracing::debug!(
            api_key = %mask(config.api_key.as_deref()),
            "Creating Zillow client"
        );
        Ok(Self {
            client: http_client(timeout)?,
            config: config.clone(),
        })
    }

    fn url(&self) -> String {
        format!("{}/pro/byaddress", self.config.base_url.trim_end_matches('/'))
    }

    /// The raw property payload is kept as-is; its shape varies by listing.
    async fn fetch_property(&self, address: &str) -> Result<ExternalDataset> {
        let api_key = credential(&self.config.api_key, "sources.zillow.api_key")?;
        tracing::info!(address = %address, "Fetching Zillow comparables");

        let body = get_json(
            &self.client,
            &self.url(),
            &[("propertyaddress", address)],
            &[
                ("X-RapidAPI-Key", api_key),
                ("X-RapidAPI-Host", self.config.host.as_str()),
            ],
        )
        .await?;

        Ok(ExternalDataset::from_value(SourceKind::Comparables, body))
    }
}

#[async_trait::async_trait]
impl DataSource for ZillowClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Comparables
    }

    async fn fetch(&self, subject_key: &str) -> DatasetOutcome {
        settle_outcome(self.kind(), self.fetch_property(subject_key).await)
    }
}
