//! Index feed - token universe and market conditions for the index basket

use std::time::Duration;

use reqwest::Client;
use valuator_core::{DatasetOutcome, ExternalDataset, SourceKind};

use super::{get_json, http_client, settle_outcome, DataSource};
use crate::config::IndexFeedConfig;
use crate::error::Result;

pub struct IndexFeedClient {
    client: Client,
    url: String,
}

impl IndexFeedClient {
    pub fn new(config: &IndexFeedConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: config.url.clone(),
        })
    }

    async fn fetch_index(&self, index: &str) -> Result<ExternalDataset> {
        tracing::info!(url = %self.url, index = %index, "Fetching index feed");
        let mut query = Vec::new();
        if !index.is_empty() {
            query.push(("index", index));
        }
        let body = get_json(&self.client, &self.url, &query, &[]).await?;
        Ok(ExternalDataset::from_value(SourceKind::MarketIndex, body))
    }
}

#[async_trait::async_trait]
impl DataSource for IndexFeedClient {
    fn kind(&self) -> SourceKind {
        SourceKind::MarketIndex
    }

    async fn fetch(&self, subject_key: &str) -> DatasetOutcome {
        settle_outcome(self.kind(), self.fetch_index(subject_key).await)
    }
}
