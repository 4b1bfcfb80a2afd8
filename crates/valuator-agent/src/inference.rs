//! Chat-completion client for the inference service
//!
//! One POST per call, no retries. The reply text is returned untouched;
//! extraction and validation happen in `valuator_core::extract`.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use valuator_core::{ChatMessage, InferenceRequest};

use crate::config::InferenceConfig;
use crate::error::{credential, mask, AgentError, Result};

#[async_trait::async_trait]
pub trait InferenceService: Send + Sync {
    /// Send the request and return the raw completion text.
    async fn complete(&self, request: &InferenceRequest) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

impl<'a> From<&'a InferenceRequest> for CompletionBody<'a> {
    fn from(request: &'a InferenceRequest) -> Self {
        Self {
            model: request.model.model,
            messages: &request.messages,
            temperature: request.model.temperature,
            max_tokens: request.model.max_tokens,
            stream: request.model.stream,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Pull `choices[0].message.content` out of a completion response.
fn completion_text(endpoint: &str, response: CompletionResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| AgentError::InvalidResponse {
            endpoint: endpoint.to_string(),
            message: "completion has no choices[0].message.content".to_string(),
        })
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// ASI:One chat completions client (OpenAI-compatible wire format).
pub struct AsiOneClient {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl AsiOneClient {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        tracing::debug!(
            url = %config.url,
            api_key = %mask(config.api_key.as_deref()),
            "Creating inference client"
        );
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait::async_trait]
impl InferenceService for AsiOneClient {
    async fn complete(&self, request: &InferenceRequest) -> Result<String> {
        let api_key = credential(&self.api_key, "inference.api_key")?;
        let start = Instant::now();

        tracing::info!(
            url = %self.url,
            model = %request.model.model,
            temperature = %request.model.temperature,
            max_tokens = %request.model.max_tokens,
            prompt_chars = request.prompt().len(),
            "Sending inference request"
        );

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .header("Accept", "application/json")
            .json(&CompletionBody::from(request))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Inference request failed");
                AgentError::transport(&self.url, &e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Inference service returned an error");
            return Err(AgentError::Http {
                endpoint: self.url.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CompletionResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to decode inference response");
            AgentError::InvalidResponse {
                endpoint: self.url.clone(),
                message: e.to_string(),
            }
        })?;

        let text = completion_text(&self.url, parsed)?;
        tracing::info!(
            chars = text.len(),
            duration_ms = %start.elapsed().as_millis(),
            preview = %preview(&text, 200),
            "Inference response received"
        );

        Ok(text)
    }
}
