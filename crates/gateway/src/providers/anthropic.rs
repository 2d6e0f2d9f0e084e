use futures::StreamExt;
use serde_json::json;
use shared::error::CommonError;

use crate::config::Config;
use crate::providers::{
    ChatChunk, ChatRequest, ChatResponse, ChatStream, ProviderAdapter, ProviderId,
    ResolvedCredential, TokenUsage, chat_with_schema_via_fallback,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(config: &Config) -> Self {
        let provider_config = config.provider_config(ProviderId::Anthropic);
        Self {
            base_url: provider_config
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: reqwest::Client::new(),
        }
    }

    fn request_body(&self, req: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut system = None;
        let messages: Vec<_> = req
            .messages
            .iter()
            .filter_map(|m| {
                if m.role == "system" {
                    system = m.content.as_str().map(|s| s.to_string());
                    None
                } else {
                    Some(json!({ "role": m.role, "content": m.content }))
                }
            })
            .collect();

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.options.max_tokens.unwrap_or(4096),
            "stream": stream,
        });
        let obj = body.as_object_mut().unwrap();
        if let Some(system) = system {
            obj.insert("system".to_string(), json!(system));
        }
        if let Some(temperature) = req.options.temperature {
            obj.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(tools) = &req.options.tools {
            obj.insert("tools".to_string(), tools.clone());
        }
        body
    }

    fn authorize(&self, request: reqwest::RequestBuilder, credential: &ResolvedCredential) -> reqwest::RequestBuilder {
        let mut request = request.header("anthropic-version", ANTHROPIC_VERSION);
        if let Some(key) = &credential.api_key {
            request = request.header("x-api-key", key);
        }
        request
    }
}

fn parse_response(raw: serde_json::Value) -> ChatResponse {
    let content = raw
        .pointer("/content/0/text")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let usage = TokenUsage {
        input_tokens: raw.pointer("/usage/input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        output_tokens: raw.pointer("/usage/output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
    };
    ChatResponse { content, usage, raw }
}

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    async fn chat(
        &self,
        req: &ChatRequest,
        credential: &ResolvedCredential,
    ) -> Result<ChatResponse, CommonError> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .authorize(self.client.post(&url), credential)
            .json(&self.request_body(req, false))
            .send()
            .await
            .map_err(|e| CommonError::network_error(e.to_string()))?;

        let status = response.status();
        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CommonError::network_error(e.to_string()))?;
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CommonError::rate_limit(raw.to_string()));
        }
        if status.is_client_error() {
            return Err(CommonError::invalid_request(raw.to_string()));
        }
        if status.is_server_error() {
            return Err(CommonError::server_error(raw.to_string()));
        }
        Ok(parse_response(raw))
    }

    async fn stream(
        &self,
        req: &ChatRequest,
        credential: &ResolvedCredential,
    ) -> Result<ChatStream, CommonError> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .authorize(self.client.post(&url), credential)
            .json(&self.request_body(req, true))
            .send()
            .await
            .map_err(|e| CommonError::network_error(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_client_error() {
                CommonError::invalid_request(body)
            } else {
                CommonError::server_error(body)
            });
        }

        let mut byte_stream = response.bytes_stream();
        let out = async_stream::stream! {
            let mut buffer = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(CommonError::network_error(e.to_string()));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else { continue };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    let raw: serde_json::Value = match serde_json::from_str(data) {
                        Ok(v) => v,
                        Err(e) => {
                            yield Err(CommonError::InvalidResponse { msg: format!("malformed anthropic SSE event: {e}"), source: None });
                            return;
                        }
                    };
                    let event_type = raw.get("type").and_then(|v| v.as_str()).unwrap_or_default();
                    match event_type {
                        "content_block_delta" => {
                            let delta = raw.pointer("/delta/text").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                            yield Ok(ChatChunk { delta, usage: None, raw, is_final: false });
                        }
                        "message_delta" => {
                            let usage = raw.pointer("/usage/output_tokens").and_then(|v| v.as_u64()).map(|output_tokens| TokenUsage { input_tokens: 0, output_tokens });
                            yield Ok(ChatChunk { delta: String::new(), usage, raw, is_final: false });
                        }
                        "message_stop" => {
                            yield Ok(ChatChunk { delta: String::new(), usage: None, raw, is_final: true });
                            return;
                        }
                        _ => {}
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }

    async fn chat_with_schema(
        &self,
        req: &ChatRequest,
        schema: &serde_json::Value,
        credential: &ResolvedCredential,
    ) -> Result<serde_json::Value, CommonError> {
        chat_with_schema_via_fallback(self, req, schema, credential).await
    }
}
