use shared::error::CommonError;

use crate::config::Config;
use crate::providers::{
    ChatRequest, ChatResponse, ChatStream, ProviderAdapter, ProviderId, ResolvedCredential,
    openai_compatible,
};

const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

/// Local Ollama daemon, OpenAI-compatible endpoint. Tolerates an
/// unconfigured credential (§4.2 step 7).
pub struct OllamaAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaAdapter {
    pub fn new(config: &Config) -> Self {
        let provider_config = config.provider_config(ProviderId::Ollama);
        Self {
            base_url: provider_config
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Ollama
    }

    async fn chat(
        &self,
        req: &ChatRequest,
        credential: &ResolvedCredential,
    ) -> Result<ChatResponse, CommonError> {
        openai_compatible::chat(&self.client, &self.base_url, req, credential).await
    }

    async fn stream(
        &self,
        req: &ChatRequest,
        credential: &ResolvedCredential,
    ) -> Result<ChatStream, CommonError> {
        openai_compatible::stream(&self.client, &self.base_url, req, credential).await
    }

    async fn chat_with_schema(
        &self,
        req: &ChatRequest,
        schema: &serde_json::Value,
        credential: &ResolvedCredential,
    ) -> Result<serde_json::Value, CommonError> {
        openai_compatible::chat_with_schema(self, &self.client, &self.base_url, req, schema, credential).await
    }
}
