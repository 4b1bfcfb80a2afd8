//! Error types for Valuator Core

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Invalid subject: {0}")]
    InvalidSubject(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// An inference reply that could not be turned into a typed result.
///
/// The raw text is kept verbatim so it can be inspected in the run report.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Unparseable inference response: {reason}")]
pub struct Unparseable {
    pub reason: String,
    pub raw: String,
}

impl Unparseable {
    pub fn new(reason: impl Into<String>, raw: &str) -> Self {
        Self {
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }
}
