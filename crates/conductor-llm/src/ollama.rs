use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use conductor_core::errors::ProviderError;
use conductor_core::messages::Message;
use conductor_core::provider::{ChatOptions, ChunkStream, Provider};

use crate::openai::{status_error, transport_error, wire_messages, WireMessage};
use crate::stream_parse::{ndjson_chunks, ollama_line};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend for a local Ollama daemon.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "ModelOptions::is_empty")]
    options: ModelOptions<'a>,
}

#[derive(Serialize)]
struct ModelOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
}

impl ModelOptions<'_> {
    fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.num_predict.is_none() && self.stop.is_empty()
    }
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    #[instrument(skip(self, messages, options), fields(provider = "ollama", model = %options.model))]
    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ChunkStream, ProviderError> {
        let body = ChatRequest {
            model: &options.model,
            messages: wire_messages(messages),
            stream: true,
            options: ModelOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
                stop: &options.stop,
            },
        };
        debug!(messages = messages.len(), "sending ollama chat request");

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        Ok(ndjson_chunks(resp.bytes_stream(), ollama_line))
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let tags: TagList = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}
