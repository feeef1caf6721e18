//! HTTP client for the completion provider.

use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{UpstreamError, UpstreamResult};
use super::types::{CompletionRequest, CompletionResponse, WireMessage};
use crate::chat::{DEFAULT_MODEL, DEFAULT_TEMPERATURE, Message, clamp_temperature};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a concise, helpful assistant.";

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Chat completions URL.
    pub endpoint: String,
    /// Bearer credential. Falls back to `OPENAI_API_KEY` when unset.
    pub api_key: Option<String>,
    /// Model used when the request does not name one. Falls back to `OPENAI_MODEL`.
    pub model: Option<String>,
    /// Instruction prepended to every conversation.
    pub system_prompt: String,
    /// Connect timeout in seconds. Streaming responses have no overall timeout.
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            model: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            connect_timeout_secs: 30,
        }
    }
}

impl UpstreamConfig {
    /// Fill unset credential and model from the conventional environment variables.
    pub fn with_env_fallbacks(mut self) -> Self {
        if self.api_key.as_deref().is_none_or(str::is_empty) {
            self.api_key = std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|key| !key.is_empty());
        }
        if self.model.as_deref().is_none_or(str::is_empty) {
            self.model = std::env::var("OPENAI_MODEL")
                .ok()
                .filter(|model| !model.is_empty());
        }
        self
    }
}

/// Client for an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    default_model: String,
    system_prompt: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> UpstreamResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
            default_model: config
                .model
                .clone()
                .filter(|model| !model.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_prompt: config.system_prompt.clone(),
        })
    }

    /// Whether a credential is configured. Without one no request is ever sent.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Build the request body: system instruction first, then the conversation.
    pub fn build_request(
        &self,
        messages: &[Message],
        model: Option<&str>,
        temperature: Option<f32>,
        stream: bool,
    ) -> CompletionRequest {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        wire.push(WireMessage::system(&self.system_prompt));
        wire.extend(messages.iter().map(WireMessage::from));

        CompletionRequest {
            model: model
                .filter(|m| !m.is_empty())
                .unwrap_or(self.default_model.as_str())
                .to_string(),
            stream,
            temperature: temperature
                .map(clamp_temperature)
                .unwrap_or(DEFAULT_TEMPERATURE),
            messages: wire,
        }
    }

    /// Start a streamed completion and return the raw event byte stream.
    pub async fn open_stream(
        &self,
        messages: &[Message],
        model: Option<&str>,
        temperature: Option<f32>,
    ) -> UpstreamResult<impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static> {
        let request = self.build_request(messages, model, temperature, true);
        let response = self.post(&request).await?;
        Ok(response.bytes_stream())
    }

    /// Run a buffered completion and return the full reply, if the provider sent one.
    pub async fn complete(
        &self,
        messages: &[Message],
        model: Option<&str>,
        temperature: Option<f32>,
    ) -> UpstreamResult<Option<String>> {
        let request = self.build_request(messages, model, temperature, false);
        let response = self.post(&request).await?;
        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::ParseError(e.to_string()))?;
        Ok(body.first_content())
    }

    async fn post(&self, request: &CompletionRequest) -> UpstreamResult<reqwest::Response> {
        let api_key = self.api_key.as_deref().ok_or(UpstreamError::NotConfigured)?;

        tracing::debug!(
            model = %request.model,
            stream = request.stream,
            messages = request.messages.len(),
            "sending completion request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status { status, body });
        }

        Ok(response)
    }
}
