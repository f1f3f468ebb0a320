use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use conductor_core::errors::ProviderError;
use conductor_core::messages::Message;
use conductor_core::provider::{ChatOptions, ChunkStream, Provider};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield these chunks, then end normally.
    Chunks(Vec<String>),
    /// Fail the `chat()` call itself.
    Error(ProviderError),
    /// Yield these chunks, then fail mid-stream.
    Interrupted(Vec<String>, ProviderError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// Convenience: a single-chunk text response.
    pub fn text(text: &str) -> Self {
        Self::Chunks(vec![text.to_string()])
    }

    pub fn chunks(parts: &[&str]) -> Self {
        Self::Chunks(parts.iter().map(|p| p.to_string()).collect())
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// A request the mock received, kept for assertions.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub options: ChatOptions,
}

/// Mock provider that returns pre-programmed responses in sequence.
pub struct MockProvider {
    responses: Vec<MockResponse>,
    repeat: bool,
    models: Vec<String>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            repeat: false,
            models: vec!["mock-model".into()],
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with the same response.
    pub fn always(response: MockResponse) -> Self {
        Self {
            repeat: true,
            ..Self::new(vec![response])
        }
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    fn response_for(&self, idx: usize) -> Result<MockResponse, ProviderError> {
        let slot = if self.repeat { 0 } else { idx };
        self.responses.get(slot).cloned().ok_or_else(|| {
            ProviderError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            ))
        })
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ChunkStream, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(RecordedRequest {
            messages: messages.to_vec(),
            options: options.clone(),
        });

        let mut current = self.response_for(idx)?;
        // Unroll nested delays iteratively to avoid recursive async.
        loop {
            match current {
                MockResponse::Chunks(chunks) => {
                    return Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))));
                }
                MockResponse::Error(e) => return Err(e),
                MockResponse::Interrupted(chunks, error) => {
                    let items = chunks
                        .into_iter()
                        .map(Ok)
                        .chain(std::iter::once(Err(error)));
                    return Ok(Box::pin(stream::iter(items)));
                }
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.models.clone())
    }
}
