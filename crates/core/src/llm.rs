use crate::error::ChatError;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::warn;
use url::Url;

pub const MODEL_MAX_ATTEMPTS: u32 = 3;

const MODEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MODEL_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ChatError>;
}

/// Chat-completions client for an OpenAI-style endpoint. Every call is
/// bounded by a request timeout and a small number of retries with
/// exponential backoff before the failure surfaces to the caller.
pub struct HttpModelClient {
    endpoint: Url,
    api_key: String,
    model: String,
    client: reqwest::Client,
    max_attempts: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: String,
}

impl HttpModelClient {
    pub fn new(endpoint: &str, api_key: String, model: String) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid model endpoint: {endpoint}"))?;
        let client = reqwest::Client::builder()
            .timeout(MODEL_REQUEST_TIMEOUT)
            .build()
            .context("building http client")?;

        Ok(Self {
            endpoint,
            api_key,
            model,
            client,
            max_attempts: MODEL_MAX_ATTEMPTS,
        })
    }

    /// Credentials are a startup requirement: a missing `MODEL_API_KEY` is a
    /// configuration error, not something to recover from at request time.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("MODEL_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("MODEL_API_KEY is required")?;

        let endpoint = std::env::var("MODEL_ENDPOINT")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());

        let model = std::env::var("MODEL_NAME")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "gpt-4o-mini".to_string());

        Self::new(&endpoint, api_key, model)
    }

    async fn request_once(&self, messages: &[ChatMessage]) -> Result<String, String> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": 0.2,
            }))
            .send()
            .await
            .map_err(|error| error.to_string())?;

        if !response.status().is_success() {
            return Err(format!("model endpoint returned {}", response.status()));
        }

        let payload: CompletionResponse = response
            .json()
            .await
            .map_err(|error| format!("invalid completion payload: {error}"))?;

        let content = payload
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err("model returned an empty completion".to_string());
        }
        Ok(content)
    }
}

#[async_trait]
impl LanguageModel for HttpModelClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ChatError> {
        let mut last_error = String::new();

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(MODEL_RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
            }

            match self.request_once(messages).await {
                Ok(content) => return Ok(content),
                Err(error) => {
                    warn!(attempt = attempt + 1, error = %error, "model call failed");
                    last_error = error;
                }
            }
        }

        Err(ChatError::ModelUnavailable(format!(
            "{} attempts exhausted: {last_error}",
            self.max_attempts
        )))
    }
}
