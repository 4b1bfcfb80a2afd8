//! Rentcast - long-term rent estimates and rental comps

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use valuator_core::{DatasetOutcome, ExternalDataset, SourceKind};

use super::{get_json, http_client, settle_outcome, DataSource};
use crate::config::RentcastConfig;
use crate::error::{credential, mask, Result};

pub struct RentcastClient {
    client: Client,
    config: RentcastConfig,
}

impl RentcastClient {
    pub fn new(config: &RentcastConfig, timeout: Duration) -> Result<Self> {
        tracing::debug!(
            api_key = %mask(config.api_key.as_deref()),
            "Creating Rentcast client"
        );
        Ok(Self {
            client: http_client(timeout)?,
            config: config.clone(),
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/avm/rent/long-term",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn fetch_rent(&self, address: &str) -> Result<ExternalDataset> {
        let api_key = credential(&self.config.api_key, "sources.rentcast.api_key")?;
        tracing::info!(address = %address, "Fetching Rentcast rental data");

        let body = get_json(
            &self.client,
            &self.url(),
            &[
                ("address", address),
                ("propertyType", self.config.property_type.as_str()),
            ],
            &[("X-Api-Key", api_key), ("Content-Type", "application/json")],
        )
        .await?;

        let normalized = normalize(&body);
        tracing::info!(
            rent_estimate = %normalized["rent_estimate"],
            comparables = normalized["rental_comps"].as_array().map_or(0, Vec::len),
            "Rentcast data normalized"
        );

        Ok(ExternalDataset::from_value(SourceKind::Rental, normalized))
    }
}

/// Reshape a Rentcast AVM response into the fields the prompt uses.
/// Missing numbers default to 0 and missing labels to "unknown".
pub fn normalize(body: &Value) -> Value {
    let number = |field: &str| body.get(field).cloned().unwrap_or(json!(0));

    json!({
        "rent_estimate": number("rent"),
        "rent_range": {
            "low": number("rentRangeLow"),
            "high": number("rentRangeHigh"),
        },
        "rental_comps": body.get("comparables").cloned().unwrap_or(json!([])),
        "market_metrics": {
            "vacancy_rate": number("vacancyRate"),
            "avg_days_on_market": number("avgDaysOnMarket"),
            "tenant_demand": body.get("tenantDemand").cloned().unwrap_or(json!("unknown")),
        },
        "rental_yield": number("rentalYield"),
        "property_details": {
            "bedrooms": number("bedrooms"),
            "bathrooms": number("bathrooms"),
            "sqft": number("sqft"),
        },
    })
}

#[async_trait::async_trait]
impl DataSource for RentcastClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Rental
    }

    async fn fetch(&self, subject_key: &str) -> DatasetOutcome {
        settle_outcome(self.kind(), self.fetch_rent(subject_key).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_full_response() {
        let body = json!({
            "rent": 1850,
            "rentRangeLow": 1600,
            "rentRangeHigh": 2100,
            "comparables": [{"id": "a"}, {"id": "b"}],
            "vacancyRate": 0.06,
            "tenantDemand": "high",
            "bedrooms": 3
        });
        let n = normalize(&body);
        assert_eq!(n["rent_estimate"], 1850);
        assert_eq!(n["rent_range"]["low"], 1600);
        assert_eq!(n["rent_range"]["high"], 2100);
        assert_eq!(n["rental_comps"].as_array().unwrap().len(), 2);
        assert_eq!(n["market_metrics"]["vacancy_rate"], 0.06);
        assert_eq!(n["market_metrics"]["tenant_demand"], "high");
        assert_eq!(n["property_details"]["bedrooms"], 3);
    }

    #[test]
    fn test_normalize_defaults() {
        let n = normalize(&json!({}));
        assert_eq!(n["rent_estimate"], 0);
        assert_eq!(n["rental_comps"], json!([]));
        assert_eq!(n["market_metrics"]["tenant_demand"], "unknown");
        assert_eq!(n["market_metrics"]["avg_days_on_market"], 0);
    }

    #[tokio::test]
    async fn test_blank_key_is_absent() {
        let config = RentcastConfig {
            base_url: "https://api.rentcast.io".to_string(),
            property_type: "Single Family".to_string(),
            api_key: Some(String::new()),
        };
        let client = RentcastClient::new(&config, Duration::from_secs(5)).unwrap();
        assert_eq!(client.url(), "https://api.rentcast.io/v1/avm/rent/long-term");
        assert!(!client.fetch("X").await.is_present());
    }
}
