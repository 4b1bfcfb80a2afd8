//! Response extraction
//!
//! The inference service is only *asked* to answer with bare JSON. Replies
//! sometimes arrive wrapped in a markdown fence (optionally tagged `json`),
//! so extraction unwraps the first fenced block when there is one, parses the
//! rest as JSON, and validates it against the expected result shape.
//! Anything else is reported as [`Unparseable`] with the raw text attached.

use serde_json::{Map, Value};

use crate::error::Unparseable;
use crate::models::{InferenceResult, PropertyValuation, RebalanceSignals};

const FENCE: &str = "```";

/// A typed result that can be validated out of a parsed JSON reply.
pub trait FromInference: Sized {
    fn from_json(value: Value) -> Result<Self, String>;
}

/// Parse a raw inference reply into `T`.
pub fn extract<T: FromInference>(raw: &str) -> Result<T, Unparseable> {
    let body = json_body(raw);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| Unparseable::new(format!("invalid JSON: {e}"), raw))?;
    T::from_json(value).map_err(|reason| Unparseable::new(reason, raw))
}

pub fn extract_valuation(raw: &str) -> Result<InferenceResult, Unparseable> {
    extract::<PropertyValuation>(raw).map(InferenceResult::Valuation)
}

pub fn extract_rebalance(raw: &str) -> Result<InferenceResult, Unparseable> {
    extract::<RebalanceSignals>(raw).map(InferenceResult::Rebalance)
}

/// The JSON candidate inside a reply: the content of the first fenced block
/// (minus its language tag), or the whole reply trimmed.
pub fn json_body(raw: &str) -> &str {
    let Some(open) = raw.find(FENCE) else {
        return raw.trim();
    };
    let after_open = &raw[open + FENCE.len()..];
    let block = match after_open.find(FENCE) {
        Some(close) => &after_open[..close],
        None => after_open,
    };
    strip_language_tag(block).trim()
}

/// Drop a leading info-string token such as `json` from a fenced block.
fn strip_language_tag(block: &str) -> &str {
    let head = block.trim_start_matches([' ', '\t']);
    if !head.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return block;
    }
    let tag_len = head
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+')))
        .unwrap_or(head.len());
    let rest = &head[tag_len..];
    if rest.starts_with(|c: char| c.is_whitespace() || c == '{' || c == '[') {
        rest
    } else {
        block
    }
}

fn require<'a>(object: &'a Map<String, Value>, field: &str) -> Result<&'a Value, String> {
    object
        .get(field)
        .ok_or_else(|| format!("missing field `{field}`"))
}

fn require_str(object: &Map<String, Value>, field: &str) -> Result<String, String> {
    match require(object, field)? {
        Value::String(s) => Ok(s.clone()),
        other => Err(format!("field `{field}` must be a string, got {other}")),
    }
}

fn require_number(object: &Map<String, Value>, field: &str) -> Result<f64, String> {
    require(object, field)?
        .as_f64()
        .filter(|n| n.is_finite())
        .ok_or_else(|| format!("field `{field}` must be a number"))
}

/// Integral numbers only; `300000.0` is accepted, `300000.5` is not.
fn require_integer(object: &Map<String, Value>, field: &str) -> Result<u64, String> {
    let value = require(object, field)?;
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    match value.as_f64() {
        // u64::MAX as f64 rounds up to 2^64, which is already out of range
        Some(n) if n.is_finite() && n >= 0.0 && n.fract() == 0.0 && n < u64::MAX as f64 => {
            Ok(n as u64)
        }
        Some(n) => Err(format!("field `{field}` must be a non-negative integer, got {n}")),
        None => Err(format!("field `{field}` must be a number")),
    }
}

fn require_score(object: &Map<String, Value>, field: &str) -> Result<u8, String> {
    match require_integer(object, field) {
        Ok(n) if n <= 100 => Ok(n as u8),
        Ok(n) => Err(format!("field `{field}` out of range 0-100: {n}")),
        // negative scores fail the integer check; report them as range errors
        Err(_) if require_number(object, field).is_ok_and(|n| n < 0.0) => {
            Err(format!("field `{field}` out of range 0-100"))
        }
        Err(e) => Err(e),
    }
}

impl FromInference for PropertyValuation {
    fn from_json(value: Value) -> Result<Self, String> {
        let Value::Object(object) = value else {
            return Err("expected a JSON object".to_string());
        };

        let size_sqm = require_number(&object, "size_sqm")?;
        if size_sqm < 0.0 {
            return Err(format!("field `size_sqm` cannot be negative: {size_sqm}"));
        }

        Ok(PropertyValuation {
            property_id: require_str(&object, "property_id")?,
            address: require_str(&object, "address")?,
            valuation_usd: require_integer(&object, "valuation_usd")?,
            size_sqm,
            default_risk_score: require_score(&object, "default_risk_score")?,
            location_score: require_score(&object, "location_score")?,
        })
    }
}

impl FromInference for RebalanceSignals {
    fn from_json(value: Value) -> Result<Self, String> {
        let Value::Object(object) = value else {
            return Err("expected a JSON object of symbol -> signal".to_string());
        };
        if object.is_empty() {
            return Err("no rebalance signals in response".to_string());
        }

        let mut signals = std::collections::BTreeMap::new();
        for (symbol, signal) in object {
            let n = signal
                .as_f64()
                .filter(|n| n.is_finite())
                .ok_or_else(|| format!("signal for `{symbol}` must be a number, got {signal}"))?;
            if !(-1.0..=1.0).contains(&n) {
                return Err(format!("signal for `{symbol}` out of range -1..1: {n}"));
            }
            signals.insert(symbol, n);
        }
        Ok(RebalanceSignals(signals))
    }
}
