use shared::error::CommonError;

use crate::config::Config;
use crate::providers::{
    ChatRequest, ChatResponse, ChatStream, ProviderAdapter, ProviderId, ResolvedCredential,
    openai_compatible,
};

const DEFAULT_BASE_URL: &str = "https://open.bigmodel.cn/api/paas/v4";

pub struct ZhipuaiAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl ZhipuaiAdapter {
    pub fn new(config: &Config) -> Self {
        let provider_config = config.provider_config(ProviderId::Zhipuai);
        Self {
            base_url: provider_config
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ZhipuaiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Zhipuai
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
