//! Data model for one valuation (or rebalancing) run
//!
//! These types describe what flows between the pipeline stages: the subject
//! being valued, the datasets gathered about it, the request sent to the
//! inference service, the typed result parsed back, and the on-chain writes
//! derived from that result.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Subject
// =============================================================================

/// The entity being valued in one pipeline run.
///
/// Field names on the wire match what the inference service is asked to echo
/// back, so the subject can be embedded in the prompt as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    /// Stable identifier (e.g. "PROP001")
    #[serde(rename = "property_id")]
    pub id: String,

    /// Free-form location / description, also used as the data source lookup key
    pub address: String,

    /// Current valuation in whole USD
    pub valuation_usd: u64,

    /// Size in square meters
    pub size_sqm: f64,

    /// Current default risk score (0-100, higher = riskier)
    pub default_risk_score: u8,

    /// Current location score (0-100, higher = better)
    pub location_score: u8,
}

impl Subject {
    pub fn validate(&self) -> CoreResult<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::InvalidSubject("id cannot be empty".into()));
        }
        if self.default_risk_score > 100 {
            return Err(CoreError::InvalidSubject(format!(
                "default_risk_score {} outside 0-100",
                self.default_risk_score
            )));
        }
        if self.location_score > 100 {
            return Err(CoreError::InvalidSubject(format!(
                "location_score {} outside 0-100",
                self.location_score
            )));
        }
        if !self.size_sqm.is_finite() || self.size_sqm < 0.0 {
            return Err(CoreError::InvalidSubject(format!(
                "size_sqm {} is not a valid size",
                self.size_sqm
            )));
        }
        Ok(())
    }

    /// Key handed to data sources for lookups.
    pub fn lookup_key(&self) -> &str {
        &self.address
    }
}

// =============================================================================
// External datasets
// =============================================================================

/// Which provider a dataset came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Market comparables, price history, neighborhood data
    Comparables,
    /// Rental market analysis
    Rental,
    /// Token universe and market conditions for the index basket
    MarketIndex,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Comparables => "comparables",
            SourceKind::Rental => "rental",
            SourceKind::MarketIndex => "market_index",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provider's structured contribution to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalDataset {
    pub source: SourceKind,
    pub fields: Map<String, Value>,
}

impl ExternalDataset {
    /// Wrap an arbitrary provider payload. Objects become the field map
    /// directly; anything else is stored under `data`.
    pub fn from_value(source: SourceKind, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Self { source, fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// Result of asking one data source for its dataset. `Absent` is a valid
/// terminal state, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetOutcome {
    Present(ExternalDataset),
    Absent { source: SourceKind, reason: String },
}

impl DatasetOutcome {
    pub fn absent(source: SourceKind, reason: impl Into<String>) -> Self {
        DatasetOutcome::Absent {
            source,
            reason: reason.into(),
        }
    }

    pub fn source(&self) -> SourceKind {
        match self {
            DatasetOutcome::Present(dataset) => dataset.source,
            DatasetOutcome::Absent { source, .. } => *source,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, DatasetOutcome::Present(_))
    }

    pub fn dataset(&self) -> Option<&ExternalDataset> {
        match self {
            DatasetOutcome::Present(dataset) => Some(dataset),
            DatasetOutcome::Absent { .. } => None,
        }
    }
}

// =============================================================================
// Inference request
// =============================================================================

/// Model settings, fixed per pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfig {
    pub model: &'static str,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

impl ModelConfig {
    pub const VALUATION: ModelConfig = ModelConfig {
        model: "asi1-extended",
        temperature: 0.3,
        max_tokens: 3000,
        stream: false,
    };

    pub const REBALANCE: ModelConfig = ModelConfig {
        model: "asi1-mini",
        temperature: 0.7,
        max_tokens: 1000,
        stream: false,
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Everything the inference client needs for one completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub messages: Vec<ChatMessage>,
    pub model: ModelConfig,
}

impl InferenceRequest {
    /// The user prompt (the last user message).
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }
}

// =============================================================================
// Inference results
// =============================================================================

/// Updated figures for a property, as judged by the inference service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValuation {
    pub property_id: String,
    pub address: String,
    pub valuation_usd: u64,
    pub size_sqm: f64,
    /// 0 (lowest risk) to 100 (highest risk)
    pub default_risk_score: u8,
    /// 0 (worst) to 100 (best)
    pub location_score: u8,
}

/// Rebalancing intent per token: -1 strong sell, 0 hold, 1 strong buy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RebalanceSignals(pub BTreeMap<String, f64>);

impl RebalanceSignals {
    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.0.get(symbol).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InferenceResult {
    Valuation(PropertyValuation),
    Rebalance(RebalanceSignals),
}

// =============================================================================
// On-chain writes
// =============================================================================

/// The contract functions a valuation run writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteFunction {
    UpdateValuation,
    UpdateRiskScore,
    UpdateLocationScore,
}

impl WriteFunction {
    /// Solidity function name on the settlement contract
    pub fn signature_name(&self) -> &'static str {
        match self {
            WriteFunction::UpdateValuation => "updateValuation",
            WriteFunction::UpdateRiskScore => "updateRiskScore",
            WriteFunction::UpdateLocationScore => "updateLocationScore",
        }
    }
}

impl fmt::Display for WriteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.signature_name())
    }
}

/// One logical state change to apply on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainWriteOp {
    pub function: WriteFunction,
    pub value: u64,
}

impl ChainWriteOp {
    /// The ordered write list for a valuation: valuation, then risk, then location.
    pub fn for_valuation(valuation: &PropertyValuation) -> Vec<ChainWriteOp> {
        vec![
            ChainWriteOp {
                function: WriteFunction::UpdateValuation,
                value: valuation.valuation_usd,
            },
            ChainWriteOp {
                function: WriteFunction::UpdateRiskScore,
                value: u64::from(valuation.default_risk_score),
            },
            ChainWriteOp {
                function: WriteFunction::UpdateLocationScore,
                value: u64::from(valuation.location_score),
            },
        ]
    }
}

/// Where a write op got to in `Built -> Signed -> Submitted -> Confirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxPhase {
    Built,
    Signed,
    Submitted,
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Outcome of one `ChainWriteOp` submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxReceipt {
    pub op: ChainWriteOp,
    /// Last phase reached before confirmation or failure
    pub phase: TxPhase,
    pub status: TxStatus,
    /// Nonce the transaction was submitted with; `None` if it never reached the node
    pub nonce: Option<u64>,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

impl TxReceipt {
    pub fn new(op: ChainWriteOp) -> Self {
        Self {
            op,
            phase: TxPhase::Built,
            status: TxStatus::Pending,
            nonce: None,
            tx_hash: None,
            error: None,
        }
    }

    pub fn advance(&mut self, phase: TxPhase) {
        self.phase = phase;
        if phase == TxPhase::Confirmed {
            self.status = TxStatus::Confirmed;
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TxStatus::Failed;
        self.error = Some(error.into());
    }

    /// Whether the node has seen this transaction's nonce.
    pub fn reached_node(&self) -> bool {
        self.phase >= TxPhase::Submitted
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == TxStatus::Confirmed
    }
}
