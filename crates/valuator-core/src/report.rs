//! Structured outcome of one pipeline run

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Unparseable;
use crate::models::{
    DatasetOutcome, InferenceResult, PropertyValuation, SourceKind, Subject, TxReceipt, TxStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Valuation,
    Rebalance,
}

/// How far a run got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    /// Required datasets missing; inference not attempted
    InsufficientData,
    /// Inference call failed (transport / HTTP)
    InferenceFailed,
    /// Reply could not be extracted into a valid result
    MalformedResponse,
    /// Result extracted; settlement not applicable or skipped
    Evaluated,
    /// Every write op confirmed
    Settled,
    /// Some write ops confirmed, some failed
    PartiallySettled,
    /// No write op confirmed
    SettlementFailed,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStage::InsufficientData => "insufficient data",
            RunStage::InferenceFailed => "inference failed",
            RunStage::MalformedResponse => "malformed response",
            RunStage::Evaluated => "evaluated",
            RunStage::Settled => "settled",
            RunStage::PartiallySettled => "partially settled",
            RunStage::SettlementFailed => "settlement failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Collected,
    Absent { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub source: SourceKind,
    #[serde(flatten)]
    pub status: SourceStatus,
}

impl From<&DatasetOutcome> for SourceReport {
    fn from(outcome: &DatasetOutcome) -> Self {
        let status = match outcome {
            DatasetOutcome::Present(_) => SourceStatus::Collected,
            DatasetOutcome::Absent { reason, .. } => SourceStatus::Absent {
                reason: reason.clone(),
            },
        };
        Self {
            source: outcome.source(),
            status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InferenceStatus {
    NotAttempted,
    Failed { error: String },
    Unparseable { reason: String, raw: String },
    Parsed { result: InferenceResult },
}

impl From<Unparseable> for InferenceStatus {
    fn from(err: Unparseable) -> Self {
        InferenceStatus::Unparseable {
            reason: err.reason,
            raw: err.raw,
        }
    }
}

/// Change of the new figures relative to the subject's current ones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValuationDelta {
    pub valuation_change_usd: i64,
    pub valuation_change_pct: f64,
    pub risk_score_change: i16,
    pub location_score_change: i16,
}

impl ValuationDelta {
    pub fn between(current: &Subject, updated: &PropertyValuation) -> Self {
        // Both sides are u64, so the exact difference always fits in i128
        let change = i128::from(updated.valuation_usd) - i128::from(current.valuation_usd);
        let valuation_change_usd = change.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;
        let valuation_change_pct = if current.valuation_usd > 0 {
            change as f64 / current.valuation_usd as f64 * 100.0
        } else {
            0.0
        };
        Self {
            valuation_change_usd,
            valuation_change_pct,
            risk_score_change: i16::from(updated.default_risk_score)
                - i16::from(current.default_risk_score),
            location_score_change: i16::from(updated.location_score)
                - i16::from(current.location_score),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pipeline: PipelineKind,
    pub subject_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stage: RunStage,
    pub sources: Vec<SourceReport>,
    pub inference: InferenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ValuationDelta>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unknown_symbols: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transactions: Vec<TxReceipt>,
}

impl RunReport {
    pub fn start(pipeline: PipelineKind, subject_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline,
            subject_id: subject_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            stage: RunStage::InsufficientData,
            sources: Vec::new(),
            inference: InferenceStatus::NotAttempted,
            comparison: None,
            unknown_symbols: Vec::new(),
            transactions: Vec::new(),
        }
    }

    pub fn finish(mut self, stage: RunStage) -> Self {
        self.stage = stage;
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn result(&self) -> Option<&InferenceResult> {
        match &self.inference {
            InferenceStatus::Parsed { result } => Some(result),
            _ => None,
        }
    }

    pub fn inference_attempted(&self) -> bool {
        !matches!(self.inference, InferenceStatus::NotAttempted)
    }
}

/// Stage reached after settlement, from the per-op receipts.
pub fn settlement_stage(receipts: &[TxReceipt]) -> RunStage {
    let confirmed = receipts
        .iter()
        .filter(|r| r.status == TxStatus::Confirmed)
        .count();
    match confirmed {
        0 if receipts.is_empty() => RunStage::Evaluated,
        0 => RunStage::SettlementFailed,
        n if n == receipts.len() => RunStage::Settled,
        _ => RunStage::PartiallySettled,
    }
}
