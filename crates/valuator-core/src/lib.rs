//! # Valuator Core
//!
//! Data model and pure pipeline stages for the RWA valuation agent.
//!
//! This crate turns a subject plus whatever market data was collected into a
//! prompt for the inference service, and turns the service's free-form reply
//! back into a validated, typed result. No network or chain access happens
//! here; that lives in `valuator-agent`.

pub mod error;
pub mod extract;
pub mod models;
pub mod prompt;
pub mod report;

pub use error::*;
pub use extract::{extract, extract_rebalance, extract_valuation, FromInference};
pub use models::*;
pub use prompt::{RebalanceRequestBuilder, ValuationRequestBuilder};
pub use report::*;
