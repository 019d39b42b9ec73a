//! OpenAI-compatible reasoning and embedding client.
//!
//! Talks to any endpoint that follows the OpenAI chat completions and
//! embeddings API format (OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio).

use super::{ChatMessage, CompletionParams, EmbeddingClient, ReasoningClient};
use crate::config::EndpointConfig;
use crate::error::{ConfigError, DependencyError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// HTTP client for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    api_key_env: String,
    timeout_secs: u64,
}

impl OpenAiCompatibleClient {
    /// Create a client from configuration.
    ///
    /// Reads the API key from the environment variable named in
    /// `config.api_key_env`. A missing key is only an error for non-local
    /// endpoints, and only once a request is made.
    pub fn new(config: &EndpointConfig) -> std::result::Result<Self, ConfigError> {
        let api_key = std::env::var(&config.api_key_env).ok();
        Self::with_key(config, api_key)
    }

    /// Create a client with an explicitly provided API key.
    pub fn with_key(
        config: &EndpointConfig,
        api_key: Option<String>,
    ) -> std::result::Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            api_key_env: config.api_key_env.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn is_local(&self) -> bool {
        self.base_url.contains("localhost") || self.base_url.contains("127.0.0.1")
    }

    fn bearer(&self) -> Result<&str> {
        match (&self.api_key, self.is_local()) {
            (Some(key), _) => Ok(key),
            // Local servers (Ollama, vLLM, LM Studio) accept any token.
            (None, true) => Ok("local"),
            (None, false) => {
                debug!(var = %self.api_key_env, "API key environment variable not set");
                Err(DependencyError::AuthFailed {
                    dependency: self.model.clone(),
                }
                .into())
            }
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(url = %url, model = %self.model, "Sending request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.bearer()?)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DependencyError::Timeout {
                        dependency: self.model.clone(),
                        timeout_secs: self.timeout_secs,
                    }
                } else {
                    DependencyError::request(&self.model, format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            DependencyError::request(&self.model, format!("Failed to read response body: {e}"))
        })?;

        if !status.is_success() {
            return Err(self.map_http_error(status, &text).into());
        }

        serde_json::from_str(&text)
            .map_err(|e| DependencyError::parse(&self.model, format!("Invalid JSON: {e}")).into())
    }

    fn map_http_error(&self, status: reqwest::StatusCode, body: &str) -> DependencyError {
        match status.as_u16() {
            401 | 403 => DependencyError::AuthFailed {
                dependency: self.model.clone(),
            },
            code => {
                let message = serde_json::from_str::<Value>(body)
                    .ok()
                    .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                    .unwrap_or_else(|| body.chars().take(200).collect());
                DependencyError::request(&self.model, format!("HTTP {code}: {message}"))
            }
        }
    }

    async fn chat_completion(&self, body: Value) -> Result<String> {
        let json = self.post("chat/completions", &body).await?;
        parse_chat_content(&json).ok_or_else(|| {
            DependencyError::parse(&self.model, "Response has no message content").into()
        })
    }
}

fn parse_chat_content(json: &Value) -> Option<String> {
    json["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
}

fn parse_embeddings(json: &Value) -> Option<Vec<Vec<f32>>> {
    let mut data: Vec<&Value> = json["data"].as_array()?.iter().collect();
    // The API may return items out of order; `index` is authoritative.
    data.sort_by_key(|item| item["index"].as_u64().unwrap_or(0));
    data.into_iter()
        .map(|item| {
            item["embedding"].as_array().map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
        })
        .collect()
}

/// Strip a Markdown code fence some models wrap JSON output in.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[async_trait]
impl ReasoningClient for OpenAiCompatibleClient {
    async fn complete(&self, prompt: &str, params: CompletionParams) -> Result<String> {
        self.chat_completion(json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "stream": false,
        }))
        .await
    }

    async fn extract_structured(&self, text: &str, schema: &Value) -> Result<Value> {
        let system = format!(
            "Extract information from the user's text. Respond with a single JSON object \
             that conforms to this JSON schema and nothing else:\n{schema}"
        );
        let content = self
            .chat_completion(json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": text },
                ],
                "temperature": 0.0,
                "response_format": { "type": "json_object" },
                "stream": false,
            }))
            .await?;

        serde_json::from_str(strip_code_fence(&content)).map_err(|e| {
            DependencyError::parse(&self.model, format!("Structured output is not JSON: {e}"))
                .into()
        })
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        self.chat_completion(json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        }))
        .await
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiCompatibleClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch
            .pop()
            .ok_or_else(|| DependencyError::parse(&self.model, "Empty embedding response").into())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let json = self
            .post(
                "embeddings",
                &json!({
                    "model": self.model,
                    "input": texts,
                }),
            )
            .await?;

        let embeddings = parse_embeddings(&json).ok_or_else(|| {
            DependencyError::parse(&self.model, "Response has no embedding data")
        })?;
        if embeddings.len() != texts.len() {
            return Err(DependencyError::parse(
                &self.model,
                format!(
                    "Expected {} embeddings, received {}",
                    texts.len(),
                    embeddings.len()
                ),
            )
            .into());
        }
        Ok(embeddings)
    }
}
