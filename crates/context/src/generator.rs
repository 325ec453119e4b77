//! Answer generation
//!
//! Provides:
//! - The `Generator` trait consumed by the planner and the engine
//! - An OpenAI-compatible chat completions adapter with retry
//! - A hard timeout wrapper that surfaces `GenerationTimeout`

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use ragforge_common::config::GenerationConfig;
use ragforge_common::errors::{AppError, Result};
use ragforge_common::metrics;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Input to one completion call
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn new(system_prompt: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages,
            temperature: 0.0,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Text generation service
#[async_trait]
pub trait Generator: Send + Sync {
    /// Complete a conversation
    async fn complete(&self, request: CompletionRequest) -> Result<String>;

    /// Model identifier
    fn model_name(&self) -> &str;
}

/// Run `complete` under the request's timeout
///
/// Expiry becomes `AppError::GenerationTimeout`; the call is dropped, not
/// left running.
pub async fn complete_with_timeout(generator: &dyn Generator, request: CompletionRequest) -> Result<String> {
    let timeout = request.timeout;
    match tokio::time::timeout(timeout, generator.complete(request)).await {
        Ok(result) => result,
        Err(_) => {
            metrics::record_generation_timeout();
            warn!(
                model = generator.model_name(),
                timeout_secs = timeout.as_secs(),
                "Generation timed out"
            );
            Err(AppError::GenerationTimeout {
                timeout_secs: timeout.as_secs(),
            })
        }
    }
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

const MAX_BACKOFF_ELAPSED: Duration = Duration::from_secs(10);

/// OpenAI-compatible chat completions client
///
/// Without an API key it answers with a canned development response.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    max_tokens: usize,
    max_retries: u32,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_retries: config.max_retries.max(1),
        })
    }

    async fn call_api(
        &self,
        api_key: &str,
        request: &CompletionRequest,
    ) -> std::result::Result<String, backoff::Error<AppError>> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ApiMessage {
            role: Role::System,
            content: &request.system_prompt,
        });
        messages.extend(request.messages.iter().map(|m| ApiMessage {
            role: m.role,
            content: &m.content,
        }));

        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| backoff::Error::transient(AppError::from(e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = AppError::Generation {
                message: format!("LLM API error {}: {}", status, text),
            };
            // Rate limits and server errors are worth another attempt
            return Err(if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                backoff::Error::transient(err)
            } else {
                backoff::Error::permanent(err)
            });
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            backoff::Error::permanent(AppError::Generation {
                message: format!("Failed to parse LLM response: {}", e),
            })
        })?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                backoff::Error::permanent(AppError::Generation {
                    message: "Empty response from LLM".to_string(),
                })
            })
    }

    fn mock_response(request: &CompletionRequest) -> String {
        let question = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.lines().last().unwrap_or_default().trim().to_string())
            .unwrap_or_default();

        format!(
            "Based on the provided context, here is an answer to: {}\n\n[Mock response - LLM API key not configured]",
            question
        )
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let Some(api_key) = self.api_key.as_deref() else {
            debug!("No generation API key, returning mock response");
            return Ok(Self::mock_response(&request));
        };

        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_elapsed_time: Some(MAX_BACKOFF_ELAPSED),
            ..ExponentialBackoff::default()
        };

        let max_retries = self.max_retries;
        let mut attempt = 0u32;
        retry(policy, || {
            attempt += 1;
            let current = attempt;
            let request = &request;
            async move {
                self.call_api(api_key, request).await.map_err(|e| match e {
                    backoff::Error::Transient { err, .. } if current < max_retries => {
                        warn!(
                            attempt = current,
                            max_attempts = max_retries,
                            error = %err,
                            "Generation request failed, retrying"
                        );
                        backoff::Error::transient(err)
                    }
                    backoff::Error::Transient { err, .. } => backoff::Error::permanent(err),
                    permanent => permanent,
                })
            }
        })
        .await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
