use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use conductor_core::errors::ProviderError;
use conductor_core::messages::Message;
use conductor_core::provider::{ChatOptions, ChunkStream, Provider};

use crate::stream_parse::{openai_delta, sse_chunks};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend for any OpenAI-compatible `/chat/completions` endpoint
/// (OpenAI itself, LM Studio, vLLM, ...).
pub struct OpenAiProvider {
    name: String,
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl OpenAiProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self {
            name: "openai".into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Register under a different name, e.g. for a local compatible server.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key.expose_secret()),
            None => req,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
}

#[derive(Serialize)]
pub(crate) struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

pub(crate) fn wire_messages(messages: &[Message]) -> Vec<WireMessage<'_>> {
    messages
        .iter()
        .map(|m| WireMessage {
            role: m.role().as_str(),
            content: m.content(),
        })
        .collect()
}

pub(crate) fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(CONNECT_TIMEOUT)
    } else {
        ProviderError::Network(e.to_string())
    }
}

/// Map a non-success response to a [`ProviderError`], honouring `Retry-After`.
pub(crate) async fn status_error(resp: reqwest::Response) -> ProviderError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();
    match ProviderError::from_status(status, body) {
        ProviderError::RateLimited { .. } => ProviderError::RateLimited { retry_after },
        other => other,
    }
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, messages, options), fields(provider = %self.name, model = %options.model))]
    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ChunkStream, ProviderError> {
        let body = ChatRequest {
            model: &options.model,
            messages: wire_messages(messages),
            stream: true,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stop: &options.stop,
        };
        debug!(messages = messages.len(), "sending chat completion request");

        let resp = self
            .authorize(self.client.post(format!("{}/chat/completions", self.base_url)))
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        Ok(sse_chunks(resp.bytes_stream(), openai_delta))
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let resp = self
            .authorize(self.client.get(format!("{}/models", self.base_url)))
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let list: ModelList = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        let mut ids: Vec<String> = list.data.into_iter().map(|m| m.id).collect();
        ids.sort();
        Ok(ids)
    }
}
