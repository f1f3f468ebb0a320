pub mod mock;
pub mod ollama;
pub mod openai;
pub mod pricing;
pub mod registry;
pub mod reliable;
pub mod stream_parse;

pub use mock::{MockProvider, MockResponse};
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use registry::ProviderRegistry;
pub use reliable::{ReliableConfig, ReliableProvider};
