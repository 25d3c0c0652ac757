use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::AssistantConfig;
use crate::error::AgrivaniError;
use crate::message::{Message, Role};

/// Anything that can turn a transcript into one assistant reply.
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    async fn complete(&self, transcript: &[Message]) -> Result<String, AgrivaniError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatResponseMessage>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// HTTP client for an OpenAI-compatible chat completions endpoint.
pub struct AssistantGateway {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    system_prompt: String,
    temperature: Option<f32>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl AssistantGateway {
    pub fn new(config: &AssistantConfig) -> Result<Self, AgrivaniError> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms));

        if !config.api_key.is_empty() {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = format!("Bearer {}", config.api_key);
            let mut value = reqwest::header::HeaderValue::from_str(&value)
                .map_err(|e| AgrivaniError::Config(format!("invalid API key: {}", e)))?;
            value.set_sensitive(true);
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        let client = builder
            .build()
            .map_err(|e| AgrivaniError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn build_request<'a>(&'a self, transcript: &'a [Message]) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        messages.push(ChatMessage {
            role: Role::System,
            content: &self.system_prompt,
        });
        messages.extend(transcript.iter().map(|m| ChatMessage {
            role: m.role,
            content: &m.content,
        }));

        ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        }
    }

    async fn attempt(&self, request: &ChatRequest<'_>) -> Result<String, AgrivaniError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| AgrivaniError::NetworkFailure(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            // 429 and 5xx are worth another try; other statuses will not change.
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(AgrivaniError::NetworkFailure(format!(
                    "API returned status {}",
                    status
                )));
            }
            return Err(AgrivaniError::MalformedResponse(format!(
                "API returned status {}",
                status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AgrivaniError::NetworkFailure(format!("failed to read body: {}", e)))?;

        extract_reply(&body)
    }
}

/// Pull `choices[0].message.content` out of a completion response body.
fn extract_reply(body: &[u8]) -> Result<String, AgrivaniError> {
    let parsed: ChatResponse = serde_json::from_slice(body)
        .map_err(|e| AgrivaniError::MalformedResponse(format!("failed to parse response: {}", e)))?;

    let content = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AgrivaniError::MalformedResponse("no choices in response".to_string()))?
        .message
        .and_then(|m| m.content)
        .ok_or_else(|| AgrivaniError::MalformedResponse("no message content".to_string()))?;

    if content.trim().is_empty() {
        return Err(AgrivaniError::MalformedResponse("empty message content".to_string()));
    }

    Ok(content)
}

#[async_trait]
impl CompletionGateway for AssistantGateway {
    async fn complete(&self, transcript: &[Message]) -> Result<String, AgrivaniError> {
        let request = self.build_request(transcript);
        debug!(
            "Sending {} messages to {} ({})",
            request.messages.len(),
            self.endpoint,
            self.model
        );

        let mut attempt = 0;
        loop {
            match self.attempt(&request).await {
                Ok(reply) => {
                    debug!("Gateway reply received ({} chars)", reply.len());
                    return Ok(reply);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self
                        .retry_backoff
                        .saturating_mul(2u32.saturating_pow(attempt));
                    attempt += 1;
                    warn!(
                        "Gateway attempt {} failed ({}), retrying in {:?}",
                        attempt, e, delay
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
