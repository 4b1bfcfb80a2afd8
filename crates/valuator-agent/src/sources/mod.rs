//! External market data sources
//!
//! Each source makes a single GET per run. Every failure mode (missing key,
//! transport error, non-2xx status, undecodable body) ends up as
//! `DatasetOutcome::Absent`; nothing propagates past `fetch`.

pub mod index_feed;
pub mod rentcast;
pub mod zillow;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use reqwest::Client;
use serde_json::Value;
use valuator_core::{DatasetOutcome, SourceKind};

use crate::error::{AgentError, Result};

pub use index_feed::IndexFeedClient;
pub use rentcast::RentcastClient;
pub use zillow::ZillowClient;

#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Fetch this source's dataset for `subject_key`. Never fails: problems
    /// are logged and reported as `Absent`.
    async fn fetch(&self, subject_key: &str) -> DatasetOutcome;
}

/// Fetch every source concurrently and wait for all of them.
pub async fn collect_all(sources: &[Arc<dyn DataSource>], subject_key: &str) -> Vec<DatasetOutcome> {
    let outcomes = join_all(sources.iter().map(|source| source.fetch(subject_key))).await;

    for outcome in &outcomes {
        match outcome {
            DatasetOutcome::Present(dataset) => tracing::info!(
                source = %dataset.source,
                fields = dataset.fields.len(),
                "Data source collected"
            ),
            DatasetOutcome::Absent { source, reason } => tracing::warn!(
                source = %source,
                reason = %reason,
                "Data source absent"
            ),
        }
    }

    outcomes
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("valuator/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AgentError::Config(format!("Failed to create HTTP client: {e}")))
}

/// One GET returning a JSON body. Non-2xx responses keep status and body.
pub(crate) async fn get_json(
    client: &Client,
    url: &str,
    query: &[(&str, &str)],
    headers: &[(&str, &str)],
) -> Result<Value> {
    let start = Instant::now();
    let mut request = client.get(url).query(query);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }

    tracing::debug!(url = %url, query = ?query, "Sending data source request");

    let response = request
        .send()
        .await
        .map_err(|e| AgentError::transport(url, &e))?;

    let status = response.status();
    tracing::info!(
        url = %url,
        status = %status.as_u16(),
        duration_ms = %start.elapsed().as_millis(),
        "Data source responded"
    );

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AgentError::Http {
            endpoint: url.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| AgentError::InvalidResponse {
            endpoint: url.to_string(),
            message: e.to_string(),
        })
}

/// Turn a fetch result into an outcome, logging the failure.
pub(crate) fn settle_outcome(
    source: SourceKind,
    result: Result<valuator_core::ExternalDataset>,
) -> DatasetOutcome {
    match result {
        Ok(dataset) => DatasetOutcome::Present(dataset),
        Err(e) => {
            match &e {
                AgentError::Http { status, body, .. } => tracing::error!(
                    source = %source,
                    status = %status,
                    body = %body,
                    "Data source request failed"
                ),
                AgentError::MissingCredential(name) => tracing::error!(
                    source = %source,
                    credential = %name,
                    "Data source credential not configured"
                ),
                other => tracing::error!(source = %source, error = %other, "Data source request failed"),
            }
            DatasetOutcome::absent(source, e.to_string())
        }
    }
}
