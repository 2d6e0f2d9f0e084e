use shared::error::CommonError;

use crate::config::Config;
use crate::providers::{
    ChatRequest, ChatResponse, ChatStream, ProviderAdapter, ProviderId, ResolvedCredential,
    openai_compatible,
};

const DEFAULT_BASE_URL: &str = "https://api.cerebras.ai/v1";

pub struct CerebrasAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl CerebrasAdapter {
    pub fn new(config: &Config) -> Self {
        let provider_config = config.provider_config(ProviderId::Cerebras);
        Self {
            base_url: provider_config
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for CerebrasAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Cerebras
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
        let mut augmented = req.clone();
        augmented.options.extra.insert(
            "response_format".to_string(),
            serde_json::json!({
                "type": "json_schema",
                "json_schema": { "name": "response", "schema": schema, "strict": true }
            }),
        );
        let response =
            openai_compatible::chat(&self.client, &self.base_url, &augmented, credential).await?;
        serde_json::from_str(&response.content).map_err(|e| CommonError::InvalidResponse {
            msg: format!("cerebras structured output was not valid JSON: {e}"),
            source: None,
        })
    }
}
