//! Error types for the valuation agent

use thiserror::Error;

/// Agent error. `MissingCredential`, `NetworkUnreachable` and `Config` are
/// fatal and abort the run; everything else is recovered into the report.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("Network unreachable at {endpoint}: {message}")]
    NetworkUnreachable { endpoint: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP {status} from {endpoint}: {body}")]
    Http {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Transport error ({kind}) calling {endpoint}: {message}")]
    Transport {
        endpoint: String,
        kind: &'static str,
        message: String,
    },

    #[error("Invalid response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::MissingCredential(_)
                | AgentError::NetworkUnreachable { .. }
                | AgentError::Config(_)
        )
    }

    /// Wrap a reqwest failure with the endpoint and a coarse failure kind.
    pub fn transport(endpoint: &str, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connect"
        } else if err.is_decode() {
            "decode"
        } else if err.is_body() {
            "body"
        } else {
            "request"
        };
        AgentError::Transport {
            endpoint: endpoint.to_string(),
            kind,
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(err: config::ConfigError) -> Self {
        AgentError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Credential value if present and non-blank.
pub fn credential<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AgentError::MissingCredential(name)),
    }
}

/// `abcd...wxyz` preview of a secret for logs.
pub fn mask(secret: Option<&str>) -> String {
    match secret {
        None | Some("") => "EMPTY".to_string(),
        Some(s) if s.len() > 8 && s.is_char_boundary(4) && s.is_char_boundary(s.len() - 4) => {
            format!("{}...{}", &s[..4], &s[s.len() - 4..])
        }
        Some(_) => "***".to_string(),
    }
}
