use std::collections::HashMap;
use std::sync::Arc;

use secrecy::SecretString;
use tracing::debug;

use conductor_core::errors::ProviderError;
use conductor_core::provider::Provider;
use conductor_core::settings::ConductorSettings;

use crate::ollama::OllamaProvider;
use crate::openai::OpenAiProvider;
use crate::reliable::ReliableProvider;

/// Name → provider lookup. Constructed explicitly and passed around.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the stock registry (`openai`, `ollama`), each behind a
    /// [`ReliableProvider`]. The OpenAI key comes from `OPENAI_API_KEY`.
    pub fn from_settings(settings: &ConductorSettings) -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);
        Self::from_settings_with_key(settings, api_key)
    }

    pub fn from_settings_with_key(
        settings: &ConductorSettings,
        openai_key: Option<SecretString>,
    ) -> Result<Self, ProviderError> {
        let mut registry = Self::new();
        let openai = OpenAiProvider::new(&settings.providers.openai_base_url, openai_key)?;
        registry.register("openai", Arc::new(ReliableProvider::with_defaults(openai)));
        let ollama = OllamaProvider::new(&settings.providers.ollama_base_url)?;
        registry.register("ollama", Arc::new(ReliableProvider::with_defaults(ollama)));
        Ok(registry)
    }

    /// Register a provider, replacing any previous one under the same name.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        let name = name.into();
        debug!(provider = %name, "registered provider");
        let _ = self.providers.insert(name, provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
