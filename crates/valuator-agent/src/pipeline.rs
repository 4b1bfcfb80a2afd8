//! Pipeline orchestration
//!
//! One run: gather every source concurrently, check the data policy, build the
//! request, call the inference service once, extract and validate the reply,
//! and for valuations optionally settle the new figures on-chain.
//! Only fatal errors (see [`AgentError::is_fatal`]) escape `run_*`; every
//! other failure is recorded in the returned [`RunReport`].

use std::collections::BTreeSet;
use std::sync::Arc;

use alloy::primitives::Address;
use serde_json::Value;
use valuator_core::prompt::token_universe;
use valuator_core::{
    extract, settlement_stage, ChainWriteOp, DatasetOutcome, FromInference, InferenceRequest,
    InferenceResult, InferenceStatus, PipelineKind, PropertyValuation, RebalanceRequestBuilder,
    RebalanceSignals, RunReport, RunStage, SourceKind, SourceReport, Subject, ValuationDelta,
    ValuationRequestBuilder,
};

use crate::chain::{ChainClient, TransactionSequencer};
use crate::config::RequiredSources;
use crate::error::{AgentError, Result};
use crate::inference::InferenceService;
use crate::sources::{collect_all, DataSource};

/// Subject id recorded for rebalancing runs, which value a basket, not a property.
const INDEX_SUBJECT: &str = "index";

impl RequiredSources {
    /// Whether the collected outcomes allow inference. At least one dataset
    /// is always needed.
    pub fn satisfied_by(&self, outcomes: &[DatasetOutcome]) -> bool {
        let present = outcomes.iter().filter(|o| o.is_present()).count();
        match self {
            RequiredSources::All => present > 0 && present == outcomes.len(),
            RequiredSources::Any => present > 0,
        }
    }
}

/// Where and how valuation results are written on-chain.
pub struct Settlement {
    pub chain: Arc<dyn ChainClient>,
    pub contract: Address,
    pub gas_limit: u64,
}

pub struct PipelineOrchestrator {
    sources: Vec<Arc<dyn DataSource>>,
    inference: Arc<dyn InferenceService>,
    required: RequiredSources,
    settlement: Option<Settlement>,
}

impl PipelineOrchestrator {
    pub fn new(
        sources: Vec<Arc<dyn DataSource>>,
        inference: Arc<dyn InferenceService>,
        required: RequiredSources,
    ) -> Self {
        Self {
            sources,
            inference,
            required,
            settlement: None,
        }
    }

    /// Enable on-chain settlement of valuation results.
    pub fn with_settlement(mut self, settlement: Settlement) -> Self {
        self.settlement = Some(settlement);
        self
    }

    pub async fn run_valuation(&self, subject: &Subject) -> Result<RunReport> {
        subject
            .validate()
            .map_err(|e| AgentError::Config(e.to_string()))?;

        let mut report = RunReport::start(PipelineKind::Valuation, subject.id.clone());
        tracing::info!(run_id = %report.run_id, property_id = %subject.id, "Starting valuation run");

        let Some(datasets) = self.gather(&mut report, subject.lookup_key()).await else {
            return Ok(report.finish(RunStage::InsufficientData));
        };

        let request = ValuationRequestBuilder::default().build(subject, &datasets);
        let valuation: PropertyValuation =
            match self.infer(&mut report, &request, InferenceResult::Valuation).await? {
                Ok(valuation) => valuation,
                Err(stage) => return Ok(report.finish(stage)),
            };

        let delta = ValuationDelta::between(subject, &valuation);
        tracing::info!(
            valuation_usd = valuation.valuation_usd,
            change_usd = delta.valuation_change_usd,
            change_pct = %format!("{:.2}", delta.valuation_change_pct),
            risk_score = valuation.default_risk_score,
            location_score = valuation.location_score,
            "Valuation evaluated"
        );
        report.comparison = Some(delta);

        let Some(settlement) = &self.settlement else {
            tracing::info!("Settlement disabled, skipping on-chain update");
            return Ok(report.finish(RunStage::Evaluated));
        };

        let stage = self.settle(&mut report, settlement, &valuation).await?;
        Ok(report.finish(stage))
    }

    pub async fn run_rebalance(&self) -> Result<RunReport> {
        let mut report = RunReport::start(PipelineKind::Rebalance, INDEX_SUBJECT);
        tracing::info!(run_id = %report.run_id, "Starting rebalance run");

        let Some(datasets) = self.gather(&mut report, "").await else {
            return Ok(report.finish(RunStage::InsufficientData));
        };

        let request = RebalanceRequestBuilder::default().build(&datasets);
        let signals: RebalanceSignals =
            match self.infer(&mut report, &request, InferenceResult::Rebalance).await? {
                Ok(signals) => signals,
                Err(stage) => return Ok(report.finish(stage)),
            };

        report.unknown_symbols = unknown_symbols(&datasets, &signals);
        for symbol in &report.unknown_symbols {
            tracing::warn!(symbol = %symbol, "Rebalance signal for a token outside the universe");
        }
        tracing::info!(tokens = signals.len(), "Rebalance signals evaluated");

        Ok(report.finish(RunStage::Evaluated))
    }

    /// Collect every source and apply the data policy. `None` means the run
    /// stops here with insufficient data.
    async fn gather(&self, report: &mut RunReport, key: &str) -> Option<Vec<DatasetOutcome>> {
        let datasets = collect_all(&self.sources, key).await;
        report.sources = datasets.iter().map(SourceReport::from).collect();

        if self.required.satisfied_by(&datasets) {
            return Some(datasets);
        }

        let missing: Vec<&str> = datasets
            .iter()
            .filter(|o| !o.is_present())
            .map(|o| o.source().as_str())
            .collect();
        tracing::warn!(
            policy = ?self.required,
            missing = ?missing,
            "Insufficient data, skipping inference"
        );
        None
    }

    /// Call the inference service and extract the result. The inner `Err`
    /// carries the stage a recoverable failure ends the run at.
    async fn infer<T: FromInference + Clone>(
        &self,
        report: &mut RunReport,
        request: &InferenceRequest,
        wrap: fn(T) -> InferenceResult,
    ) -> Result<std::result::Result<T, RunStage>> {
        let raw = match self.inference.complete(request).await {
            Ok(raw) => raw,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::error!(error = %e, "Inference failed");
                report.inference = InferenceStatus::Failed {
                    error: e.to_string(),
                };
                return Ok(Err(RunStage::InferenceFailed));
            }
        };

        match extract::<T>(&raw) {
            Ok(value) => {
                report.inference = InferenceStatus::Parsed {
                    result: wrap(value.clone()),
                };
                Ok(Ok(value))
            }
            Err(unparseable) => {
                tracing::error!(reason = %unparseable.reason, raw = %unparseable.raw, "Malformed inference response");
                report.inference = unparseable.into();
                Ok(Err(RunStage::MalformedResponse))
            }
        }
    }

    async fn settle(
        &self,
        report: &mut RunReport,
        settlement: &Settlement,
        valuation: &PropertyValuation,
    ) -> Result<RunStage> {
        let ops = ChainWriteOp::for_valuation(valuation);
        let sequencer =
            TransactionSequencer::new(settlement.chain.as_ref(), settlement.contract, settlement.gas_limit);

        report.transactions = sequencer.apply(&ops).await?;
        let stage = settlement_stage(&report.transactions);
        tracing::info!(stage = %stage, "Settlement finished");
        Ok(stage)
    }
}

/// Symbols in `signals` that the index feed's token universe does not list.
/// Empty when no universe could be identified.
fn unknown_symbols(datasets: &[DatasetOutcome], signals: &RebalanceSignals) -> Vec<String> {
    let Some(universe) = datasets
        .iter()
        .filter(|o| o.source() == SourceKind::MarketIndex)
        .find_map(DatasetOutcome::dataset)
        .and_then(token_universe)
    else {
        return Vec::new();
    };

    let known = universe_symbols(universe);
    if known.is_empty() {
        return Vec::new();
    }

    signals
        .symbols()
        .filter(|symbol| !known.contains(*symbol))
        .map(String::from)
        .collect()
}

/// A universe is a list of symbols, a list of `{symbol, ...}` objects, or an
/// object keyed by symbol.
fn universe_symbols(universe: &Value) -> BTreeSet<&str> {
    match universe {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(symbol) => Some(symbol.as_str()),
                Value::Object(token) => token.get("symbol").and_then(Value::as_str),
                _ => None,
            })
            .collect(),
        Value::Object(tokens) => tokens.keys().map(String::as_str).collect(),
        _ => BTreeSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::sequencer::testing::{FailAt, MockChain};
    use crate::inference::testing::ScriptedInference;
    use crate::sources::testing::StaticSource;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tokio_test::{assert_err, assert_ok};
    use valuator_core::{TxStatus, WriteFunction};

    const FENCED_REPLY: &str = "```json\n{\"property_id\":\"P1\",\"address\":\"X\",\"valuation_usd\":300000,\"size_sqm\":135,\"default_risk_score\":40,\"location_score\":82}\n```";

    fn subject() -> Subject {
        Subject {
            id: "P1".to_string(),
            address: "X".to_string(),
            valuation_usd: 290_000,
            size_sqm: 135.0,
            default_risk_score: 75,
            location_score: 80,
        }
    }

    fn both_sources() -> Vec<Arc<dyn DataSource>> {
        vec![
            StaticSource::present(SourceKind::Comparables, json!({"zestimate": 305000})),
            StaticSource::present(SourceKind::Rental, json!({"rent_estimate": 2100})),
        ]
    }

    fn settlement(chain: Arc<MockChain>) -> Settlement {
        Settlement {
            chain,
            contract: "0x4Fea3A6A4CBaCBc848065D18F04B9524d635e1e4".parse().unwrap(),
            gas_limit: 1_000_000,
        }
    }

    #[test]
    fn test_required_sources_policy() {
        let present = DatasetOutcome::Present(valuator_core::ExternalDataset::from_value(
            SourceKind::Comparables,
            json!({}),
        ));
        let absent = DatasetOutcome::absent(SourceKind::Rental, "timeout");

        let mixed = [present.clone(), absent.clone()];
        assert!(!RequiredSources::All.satisfied_by(&mixed));
        assert!(RequiredSources::Any.satisfied_by(&mixed));
        assert!(RequiredSources::All.satisfied_by(&[present]));

        let none = [absent.clone(), absent];
        assert!(!RequiredSources::All.satisfied_by(&none));
        assert!(!RequiredSources::Any.satisfied_by(&none));
        assert!(!RequiredSources::All.satisfied_by(&[]));
    }

    #[tokio::test]
    async fn test_missing_required_source_stops_before_inference() {
        let comparables =
            StaticSource::present(SourceKind::Comparables, json!({"zestimate": 305000}));
        let rental = StaticSource::absent(SourceKind::Rental);
        let inference = Arc::new(ScriptedInference::replying(FENCED_REPLY));
        let chain = Arc::new(MockChain::new(0));

        let orchestrator = PipelineOrchestrator::new(
            vec![comparables.clone(), rental.clone()],
            inference.clone(),
            RequiredSources::All,
        )
        .with_settlement(settlement(chain.clone()));

        let report = assert_ok!(orchestrator.run_valuation(&subject()).await);

        assert_eq!(report.stage, RunStage::InsufficientData);
        assert_eq!(report.stage.to_string(), "insufficient data");
        assert_eq!(inference.call_count(), 0);
        assert!(!report.inference_attempted());
        assert!(report.transactions.is_empty());
        assert!(chain.events.lock().unwrap().is_empty());
        assert_eq!(comparables.calls.load(Ordering::SeqCst), 1);
        assert_eq!(rental.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.sources.len(), 2);
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_all_sources_absent_never_calls_inference() {
        for policy in [RequiredSources::All, RequiredSources::Any] {
            let inference = Arc::new(ScriptedInference::replying(FENCED_REPLY));
            let orchestrator = PipelineOrchestrator::new(
                vec![
                    StaticSource::absent(SourceKind::Comparables),
                    StaticSource::absent(SourceKind::Rental),
                ],
                inference.clone(),
                policy,
            );

            let report = assert_ok!(orchestrator.run_valuation(&subject()).await);
            assert_eq!(report.stage, RunStage::InsufficientData);
            assert_eq!(inference.call_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_any_policy_proceeds_with_partial_data() {
        let inference = Arc::new(ScriptedInference::replying(FENCED_REPLY));
        let orchestrator = PipelineOrchestrator::new(
            vec![
                StaticSource::present(SourceKind::Comparables, json!({"zestimate": 305000})),
                StaticSource::absent(SourceKind::Rental),
            ],
            inference.clone(),
            RequiredSources::Any,
        );

        let report = assert_ok!(orchestrator.run_valuation(&subject()).await);
        assert_eq!(report.stage, RunStage::Evaluated);

        let requests = inference.requests.lock().unwrap();
        assert!(requests[0].prompt().contains("No rental data available"));
    }

    #[tokio::test]
    async fn test_fenced_reply_settles_three_ops_in_order() {
        let inference = Arc::new(ScriptedInference::replying(FENCED_REPLY));
        let chain = Arc::new(MockChain::new(12));
        let orchestrator =
            PipelineOrchestrator::new(both_sources(), inference.clone(), RequiredSources::All)
                .with_settlement(settlement(chain.clone()));

        let report = assert_ok!(orchestrator.run_valuation(&subject()).await);

        match report.result() {
            Some(InferenceResult::Valuation(valuation)) => {
                assert_eq!(valuation.valuation_usd, 300_000);
                assert_eq!(valuation.default_risk_score, 40);
            }
            other => panic!("expected valuation, got {other:?}"),
        }

        let comparison = report.comparison.as_ref().unwrap();
        assert_eq!(comparison.valuation_change_usd, 10_000);
        assert_eq!(comparison.risk_score_change, -35);

        let functions: Vec<_> = report.transactions.iter().map(|r| r.op.function).collect();
        assert_eq!(
            functions,
            vec![
                WriteFunction::UpdateValuation,
                WriteFunction::UpdateRiskScore,
                WriteFunction::UpdateLocationScore
            ]
        );
        let values: Vec<_> = report.transactions.iter().map(|r| r.op.value).collect();
        assert_eq!(values, vec![300_000, 40, 82]);
        let nonces: Vec<_> = report.transactions.iter().map(|r| r.nonce).collect();
        assert_eq!(nonces, vec![Some(12), Some(13), Some(14)]);
        assert_eq!(report.stage, RunStage::Settled);

        let request = &inference.requests.lock().unwrap()[0];
        assert_eq!(request.model.model, "asi1-extended");
        assert_eq!(request.messages[0].role, "system");
    }

    #[tokio::test]
    async fn test_rejected_risk_update_reports_partial_settlement() {
        let chain = Arc::new(MockChain::new(4).failing(1, FailAt::Submit));
        let orchestrator = PipelineOrchestrator::new(
            both_sources(),
            Arc::new(ScriptedInference::replying(FENCED_REPLY)),
            RequiredSources::All,
        )
        .with_settlement(settlement(chain.clone()));

        let report = assert_ok!(orchestrator.run_valuation(&subject()).await);

        let statuses: Vec<_> = report.transactions.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![TxStatus::Confirmed, TxStatus::Failed, TxStatus::Confirmed]
        );
        assert_eq!(report.transactions[0].nonce, Some(4));
        assert_eq!(report.transactions[2].nonce, Some(5));
        assert_eq!(report.stage, RunStage::PartiallySettled);
    }

    #[tokio::test]
    async fn test_unparseable_reply_keeps_raw_text_and_skips_settlement() {
        let raw = "The property is worth about 300k.";
        let chain = Arc::new(MockChain::new(0));
        let orchestrator = PipelineOrchestrator::new(
            both_sources(),
            Arc::new(ScriptedInference::replying(raw)),
            RequiredSources::All,
        )
        .with_settlement(settlement(chain.clone()));

        let report = assert_ok!(orchestrator.run_valuation(&subject()).await);

        assert_eq!(report.stage, RunStage::MalformedResponse);
        match &report.inference {
            InferenceStatus::Unparseable { raw: kept, .. } => assert_eq!(kept, raw),
            other => panic!("expected unparseable, got {other:?}"),
        }
        assert!(report.result().is_none());
        assert!(report.comparison.is_none());
        assert!(report.transactions.is_empty());
        assert!(chain.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_score_is_malformed() {
        let reply = r#"{"property_id":"P1","address":"X","valuation_usd":300000,"size_sqm":135,"default_risk_score":140,"location_score":82}"#;
        let orchestrator = PipelineOrchestrator::new(
            both_sources(),
            Arc::new(ScriptedInference::replying(reply)),
            RequiredSources::All,
        );

        let report = assert_ok!(orchestrator.run_valuation(&subject()).await);
        assert_eq!(report.stage, RunStage::MalformedResponse);
    }

    #[tokio::test]
    async fn test_huge_valuation_reports_saturated_change() {
        let reply = r#"{"property_id":"P1","address":"X","valuation_usd":9223372036854775808,"size_sqm":135,"default_risk_score":40,"location_score":82}"#;
        let chain = Arc::new(MockChain::new(0));
        let orchestrator = PipelineOrchestrator::new(
            both_sources(),
            Arc::new(ScriptedInference::replying(reply)),
            RequiredSources::All,
        )
        .with_settlement(settlement(chain.clone()));

        let report = assert_ok!(orchestrator.run_valuation(&subject()).await);

        let comparison = report.comparison.as_ref().unwrap();
        assert_eq!(comparison.valuation_change_usd, i64::MAX - 290_000 + 1);
        assert_eq!(report.transactions[0].op.value, 1 << 63);
        assert_eq!(report.stage, RunStage::Settled);
    }

    #[tokio::test]
    async fn test_inference_http_error_is_recorded() {
        let orchestrator = PipelineOrchestrator::new(
            both_sources(),
            Arc::new(ScriptedInference::failing(502, "bad gateway")),
            RequiredSources::All,
        );

        let report = assert_ok!(orchestrator.run_valuation(&subject()).await);
        assert_eq!(report.stage, RunStage::InferenceFailed);
        match &report.inference {
            InferenceStatus::Failed { error } => {
                assert!(error.contains("502"));
                assert!(error.contains("bad gateway"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_without_settlement_run_stops_at_evaluated() {
        let orchestrator = PipelineOrchestrator::new(
            both_sources(),
            Arc::new(ScriptedInference::replying(FENCED_REPLY)),
            RequiredSources::All,
        );

        let report = assert_ok!(orchestrator.run_valuation(&subject()).await);
        assert_eq!(report.stage, RunStage::Evaluated);
        assert!(report.transactions.is_empty());
        assert!(report.comparison.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_chain_aborts_run() {
        let orchestrator = PipelineOrchestrator::new(
            both_sources(),
            Arc::new(ScriptedInference::replying(FENCED_REPLY)),
            RequiredSources::All,
        )
        .with_settlement(settlement(Arc::new(MockChain::unreachable())));

        let err = assert_err!(orchestrator.run_valuation(&subject()).await);
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_invalid_subject_is_fatal() {
        let orchestrator = PipelineOrchestrator::new(
            both_sources(),
            Arc::new(ScriptedInference::replying(FENCED_REPLY)),
            RequiredSources::All,
        );
        let subject = Subject {
            id: " ".to_string(),
            ..subject()
        };

        let err = assert_err!(orchestrator.run_valuation(&subject).await);
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[tokio::test]
    async fn test_rebalance_flags_unknown_symbols() {
        let feed = StaticSource::present(
            SourceKind::MarketIndex,
            json!([{"symbol": "ETH"}, {"symbol": "BTC"}, "SOL"]),
        );
        let inference = Arc::new(ScriptedInference::replying(
            "```\n{\"ETH\": 0.5, \"BTC\": -0.2, \"DOGE\": 1.0}\n```",
        ));
        let orchestrator =
            PipelineOrchestrator::new(vec![feed], inference.clone(), RequiredSources::All);

        let report = assert_ok!(orchestrator.run_rebalance().await);

        assert_eq!(report.stage, RunStage::Evaluated);
        assert_eq!(report.unknown_symbols, vec!["DOGE".to_string()]);
        match report.result() {
            Some(InferenceResult::Rebalance(signals)) => {
                assert_eq!(signals.len(), 3);
                assert_eq!(signals.get("DOGE"), Some(1.0));
            }
            other => panic!("expected rebalance, got {other:?}"),
        }

        let request = &inference.requests.lock().unwrap()[0];
        assert_eq!(request.model.model, "asi1-mini");
        assert!(request.prompt().contains("Equal weight distribution"));
    }

    #[tokio::test]
    async fn test_rebalance_without_feed_is_insufficient() {
        let inference = Arc::new(ScriptedInference::replying("{\"ETH\": 0.1}"));
        let orchestrator = PipelineOrchestrator::new(
            vec![StaticSource::absent(SourceKind::MarketIndex)],
            inference.clone(),
            RequiredSources::All,
        );

        let report = assert_ok!(orchestrator.run_rebalance().await);
        assert_eq!(report.stage, RunStage::InsufficientData);
        assert_eq!(report.subject_id, "index");
        assert_eq!(inference.call_count(), 0);
    }

    #[test]
    fn test_universe_symbols_shapes() {
        assert_eq!(
            universe_symbols(&json!({"ETH": {"weight": 0.5}, "BTC": {}})),
            BTreeSet::from(["BTC", "ETH"])
        );
        assert!(universe_symbols(&json!("ETH")).is_empty());
    }
}
