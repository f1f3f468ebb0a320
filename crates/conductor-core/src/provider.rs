use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::ProviderError;
use crate::messages::Message;

/// A finite, non-restartable sequence of UTF-8 text fragments. Concatenating
/// every `Ok` item yields the final assistant message.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Options controlling a single chat completion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatOptions {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
}

impl ChatOptions {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

/// Trait implemented by each LLM backend (OpenAI-compatible, Ollama, ...).
/// Retries are the implementor's concern; callers never retry.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ChunkStream, ProviderError>;

    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_options_for_model() {
        let opts = ChatOptions::for_model("gpt-4o");
        assert_eq!(opts.model, "gpt-4o");
        assert!(opts.temperature.is_none());
        assert!(opts.max_tokens.is_none());
        assert!(opts.stop.is_empty());
    }
}
