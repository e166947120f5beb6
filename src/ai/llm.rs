//! LLM backends
//!
//! The responder talks to any chat model through [`LlmBackend`]. Errors are
//! split into the classes the retry policy cares about.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a chat request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// LLM call failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    /// The call did not finish within its timeout
    #[error("LLM request timed out")]
    Timeout,

    /// The provider asked us to slow down
    #[error("LLM rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Any other provider or transport failure
    #[error("LLM API error: {0}")]
    Api(String),
}

impl LlmError {
    /// Whether the responder should retry after this error
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited { .. })
    }
}

/// Chat completion backend
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Generate a reply for `messages` under `system_prompt`
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] describing why no text was produced
    async fn generate(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, LlmError>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<RequestMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions client
pub struct OpenAiCompatibleLlm {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiCompatibleLlm {
    /// Create a client for `base_url` (e.g. `https://api.openai.com/v1`)
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            max_tokens: 200,
            temperature: 0.7,
        }
    }

    /// Override the completion token cap
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleLlm {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let mut request_messages = Vec::with_capacity(messages.len() + 1);
        request_messages.push(RequestMessage {
            role: Role::System,
            content: system_prompt,
        });
        request_messages.extend(messages.iter().map(|m| RequestMessage {
            role: m.role,
            content: &m.content,
        }));

        let body = CompletionRequest {
            model: &self.model,
            messages: request_messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Api(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{status}: {body}")));
        }

        let completion: CompletionResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Api(e.to_string())
            }
        })?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| LlmError::Api("empty completion".to_string()))
    }
}

/// Backend used when no LLM is configured; every turn falls back
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredLlm;

#[async_trait]
impl LlmBackend for UnconfiguredLlm {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn generate(
        &self,
        _system_prompt: &str,
        _messages: &[ChatMessage],
        _timeout: Duration,
    ) -> Result<String, LlmError> {
        Err(LlmError::Api("no LLM backend configured".to_string()))
    }
}
