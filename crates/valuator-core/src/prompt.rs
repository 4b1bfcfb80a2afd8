//! Prompt assembly for the inference service
//!
//! Templates and model settings are immutable values handed to the builders,
//! so a build is a pure function of (template, subject, datasets).

use serde_json::Value;

use crate::models::{
    ChatMessage, DatasetOutcome, ExternalDataset, InferenceRequest, ModelConfig, SourceKind,
    Subject,
};

const VALUATION_SYSTEM: &str = "You are a seasoned real estate investment expert with 25+ years \
of experience. Return only valid JSON as requested.";

const VALUATION_BODY: &str = r#"You are a seasoned real estate investment expert with 25+ years of experience in property valuation, market analysis and risk assessment.

You will be provided with:
1. **Property Information** - identifier, address, current valuation and size
2. **Comparables Data** - market comparables, price history, neighborhood insights and automated estimates
3. **Rental Data** - rental market analysis, rental comps, yield potential and tenant demand

Your task:
Analyze the provided data and produce an updated property valuation, default risk score and location score.

Instructions:
- Return a **JSON object only** containing the updated property information.
- `valuation_usd`: your valuation based on all available data (integer).
- `default_risk_score`: 0 (lowest risk) to 100 (highest risk). Integer only.
- `location_score`: 0 (worst) to 100 (best). Integer only.
- Keep `property_id`, `address` and `size_sqm` from the property information.
- **Do not include explanations, reasoning, or any text outside of the JSON object.**

---

**Property Information:**
{property_info}

**Comparables Data:**
{comparables_data}

**Rental Data:**
{rental_data}

---
Final output: a single valid JSON object shaped like this:

```json
{
  "property_id": "PROP001",
  "address": "1124 Pacific Ave, San Francisco, CA 94133",
  "valuation_usd": 1950000,
  "size_sqm": 190,
  "default_risk_score": 34,
  "location_score": 88
}
```
"#;

const REBALANCE_SYSTEM: &str =
    "You are a professional crypto asset strategist. Return only valid JSON as requested.";

const REBALANCE_BODY: &str = r#"You are a professional crypto asset strategist managing an index, a basket of selected crypto tokens.

You will be provided with:
1. **Market Conditions** - macro or crypto-specific market insights
2. **Token Universe** - the tokens in the index with market cap, liquidity, 7-day price change, volatility and fundamentals
3. **Current Index Composition** - the current weight distribution of the index

Your task:
Provide a rebalancing signal for each token reflecting your conviction to buy, hold or sell it.

Instructions:
- Return a **JSON object only** with each token symbol as a key and a number from **-1 to 1** as the value.
    - `-1` = strong sell
    - `0` = hold
    - `1` = strong buy
- The values represent strategic rebalancing intent over a 3-year horizon.
- Only tokens already in the index may appear.
- **Do not include explanations, reasoning, or any text outside of the JSON object.**

---

**Market Conditions:**
{market_conditions}
**Token Universe:**
{token_universe}
**Current Index Composition:**
{current_index_composition}

---
Final output: a single valid JSON object shaped like this:

```json
{
  "AAVE": 0.3,
  "UNI": -0.2,
  "MKR": 0.0
}
```
"#;

const DEFAULT_MARKET_CONDITIONS: &str = "Current market conditions data";
const DEFAULT_COMPOSITION: &str = "Equal weight distribution";

/// Fixed instruction text for one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    pub system: &'static str,
    pub body: &'static str,
}

impl PromptTemplate {
    pub const VALUATION: PromptTemplate = PromptTemplate {
        system: VALUATION_SYSTEM,
        body: VALUATION_BODY,
    };

    pub const REBALANCE: PromptTemplate = PromptTemplate {
        system: REBALANCE_SYSTEM,
        body: REBALANCE_BODY,
    };

    /// Fill `{name}` slots in one pass over the body. Inserted values are
    /// never scanned again, so slot tokens inside data stay literal.
    fn render(&self, slots: &[(&str, String)]) -> String {
        let mut out = String::with_capacity(self.body.len());
        let mut rest = self.body;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open..];
            let slot = slots.iter().find(|(name, _)| {
                tail[1..]
                    .strip_prefix(*name)
                    .is_some_and(|after| after.starts_with('}'))
            });
            match slot {
                Some((name, value)) => {
                    out.push_str(value);
                    rest = &tail[name.len() + 2..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Marker used in place of a dataset that was not collected.
pub fn missing_marker(source: SourceKind) -> String {
    let label = match source {
        SourceKind::Comparables => "comparables",
        SourceKind::Rental => "rental",
        SourceKind::MarketIndex => "market index",
    };
    format!("No {label} data available")
}

fn pretty(value: &Value) -> String {
    format!("{value:#}")
}

fn find(datasets: &[DatasetOutcome], source: SourceKind) -> Option<&ExternalDataset> {
    datasets
        .iter()
        .filter_map(DatasetOutcome::dataset)
        .find(|d| d.source == source)
}

fn dataset_slot(datasets: &[DatasetOutcome], source: SourceKind) -> String {
    find(datasets, source)
        .map(|d| pretty(&d.to_value()))
        .unwrap_or_else(|| missing_marker(source))
}

fn text_or_pretty(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => pretty(other),
    }
}

/// Builds the valuation prompt from a subject and whatever datasets were collected.
#[derive(Debug, Clone)]
pub struct ValuationRequestBuilder {
    template: PromptTemplate,
    model: ModelConfig,
}

impl Default for ValuationRequestBuilder {
    fn default() -> Self {
        Self::new(PromptTemplate::VALUATION, ModelConfig::VALUATION)
    }
}

impl ValuationRequestBuilder {
    pub fn new(template: PromptTemplate, model: ModelConfig) -> Self {
        Self { template, model }
    }

    pub fn build(&self, subject: &Subject, datasets: &[DatasetOutcome]) -> InferenceRequest {
        let property_info = serde_json::to_value(subject)
            .map(|v| pretty(&v))
            .unwrap_or_else(|_| format!("{subject:?}"));

        let prompt = self.template.render(&[
            ("property_info", property_info),
            ("comparables_data", dataset_slot(datasets, SourceKind::Comparables)),
            ("rental_data", dataset_slot(datasets, SourceKind::Rental)),
        ]);

        InferenceRequest {
            messages: vec![
                ChatMessage::system(self.template.system),
                ChatMessage::user(prompt),
            ],
            model: self.model.clone(),
        }
    }
}

/// Builds the rebalancing prompt from the market index dataset.
#[derive(Debug, Clone)]
pub struct RebalanceRequestBuilder {
    template: PromptTemplate,
    model: ModelConfig,
}

impl Default for RebalanceRequestBuilder {
    fn default() -> Self {
        Self::new(PromptTemplate::REBALANCE, ModelConfig::REBALANCE)
    }
}

impl RebalanceRequestBuilder {
    pub fn new(template: PromptTemplate, model: ModelConfig) -> Self {
        Self { template, model }
    }

    pub fn build(&self, datasets: &[DatasetOutcome]) -> InferenceRequest {
        let (market_conditions, token_universe, composition) =
            match find(datasets, SourceKind::MarketIndex) {
                Some(dataset) => index_sections(dataset),
                None => (
                    DEFAULT_MARKET_CONDITIONS.to_string(),
                    missing_marker(SourceKind::MarketIndex),
                    DEFAULT_COMPOSITION.to_string(),
                ),
            };

        let prompt = self.template.render(&[
            ("market_conditions", market_conditions),
            ("token_universe", token_universe),
            ("current_index_composition", composition),
        ]);

        InferenceRequest {
            messages: vec![
                ChatMessage::system(self.template.system),
                ChatMessage::user(prompt),
            ],
            model: self.model.clone(),
        }
    }
}

/// Split an index feed payload into (conditions, universe, composition).
///
/// A bare list payload is the universe itself; an object may carry the three
/// sections by name, and without a `token_universe` the whole object is used.
fn index_sections(dataset: &ExternalDataset) -> (String, String, String) {
    let conditions = dataset
        .get("market_conditions")
        .map(text_or_pretty)
        .unwrap_or_else(|| DEFAULT_MARKET_CONDITIONS.to_string());

    let composition = dataset
        .get("current_index_composition")
        .map(pretty)
        .unwrap_or_else(|| pretty(&Value::String(DEFAULT_COMPOSITION.to_string())));

    let universe = token_universe(dataset)
        .map(pretty)
        .unwrap_or_else(|| pretty(&dataset.to_value()));

    (conditions, universe, composition)
}

/// The token universe carried by an index dataset, if it can be identified.
pub fn token_universe(dataset: &ExternalDataset) -> Option<&Value> {
    if let Some(universe) = dataset.get("token_universe") {
        return Some(universe);
    }
    match dataset.get("data") {
        Some(list @ Value::Array(_)) if dataset.fields.len() == 1 => Some(list),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subject() -> Subject {
        Subject {
            id: "P1".to_string(),
            address: "7849 S Drexel Ave, Chicago, IL 60619".to_string(),
            valuation_usd: 290_000,
            size_sqm: 135.0,
            default_risk_score: 75,
            location_score: 80,
        }
    }

    #[test]
    fn test_missing_datasets_use_explicit_marker() {
        let datasets = vec![
            DatasetOutcome::Present(ExternalDataset::from_value(
                SourceKind::Comparables,
                json!({"zestimate": 301000}),
            )),
            DatasetOutcome::absent(SourceKind::Rental, "HTTP 500"),
        ];
        let request = ValuationRequestBuilder::default().build(&subject(), &datasets);
        let prompt = request.prompt();

        assert!(prompt.contains("\"zestimate\": 301000"));
        assert!(prompt.contains("No rental data available"));
        assert!(prompt.contains("\"property_id\": \"P1\""));
        assert!(!prompt.contains("{rental_data}"));
        assert!(!prompt.contains("{comparables_data}"));
    }

    #[test]
    fn test_slot_tokens_inside_data_stay_literal() {
        let subject = Subject {
            address: "Lot {rental_data}".to_string(),
            ..subject()
        };
        let datasets = vec![
            DatasetOutcome::absent(SourceKind::Comparables, "HTTP 404"),
            DatasetOutcome::Present(ExternalDataset::from_value(
                SourceKind::Rental,
                json!({"rent_estimate": 1800, "note": "see {comparables_data}"}),
            )),
        ];
        let prompt = ValuationRequestBuilder::default()
            .build(&subject, &datasets)
            .prompt()
            .to_string();

        assert!(prompt.contains("Lot {rental_data}"));
        assert!(prompt.contains("see {comparables_data}"));
        assert_eq!(prompt.matches("\"rent_estimate\": 1800").count(), 1);
        assert_eq!(prompt.matches("No comparables data available").count(), 1);
    }

    #[test]
    fn test_render_keeps_unknown_braces() {
        let template = PromptTemplate {
            system: "s",
            body: "{\"a\": {x}} {y {missing} {",
        };
        let text = template.render(&[("x", "1".to_string()), ("y", "2".to_string())]);
        assert_eq!(text, "{\"a\": 1} {y {missing} {");
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = ValuationRequestBuilder::default();
        let a = builder.build(&subject(), &[]);
        let b = builder.build(&subject(), &[]);
        assert_eq!(a, b);
        assert_eq!(a.model, ModelConfig::VALUATION);
        assert_eq!(a.messages.len(), 2);
        assert_eq!(a.messages[0].role, "system");
        assert!(a.prompt().contains("JSON object only"));
    }

    #[test]
    fn test_rebalance_list_payload_is_universe() {
        let datasets = vec![DatasetOutcome::Present(ExternalDataset::from_value(
            SourceKind::MarketIndex,
            json!([{"symbol": "UNI", "marketCap": 1}]),
        ))];
        let request = RebalanceRequestBuilder::default().build(&datasets);
        let prompt = request.prompt();

        assert!(prompt.contains("\"symbol\": \"UNI\""));
        assert!(prompt.contains(DEFAULT_MARKET_CONDITIONS));
        assert!(prompt.contains(DEFAULT_COMPOSITION));
        assert_eq!(request.model, ModelConfig::REBALANCE);
    }

    #[test]
    fn test_rebalance_object_payload_sections() {
        let datasets = vec![DatasetOutcome::Present(ExternalDataset::from_value(
            SourceKind::MarketIndex,
            json!({
                "market_conditions": "BTC trending up",
                "token_universe": [{"symbol": "AAVE"}],
                "current_index_composition": {"AAVE": 0.5}
            }),
        ))];
        let prompt = RebalanceRequestBuilder::default().build(&datasets).prompt().to_string();

        assert!(prompt.contains("BTC trending up"));
        assert!(prompt.contains("\"AAVE\": 0.5"));
        assert!(!prompt.contains(DEFAULT_COMPOSITION));
    }
}
