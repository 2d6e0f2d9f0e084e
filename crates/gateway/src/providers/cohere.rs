use futures::StreamExt;
use serde_json::json;
use shared::error::CommonError;

use crate::config::Config;
use crate::providers::{
    ChatChunk, ChatRequest, ChatResponse, ChatStream, ProviderAdapter, ProviderId,
    ResolvedCredential, TokenUsage, chat_with_schema_via_fallback,
};

const DEFAULT_BASE_URL: &str = "https://api.cohere.com/v2";

pub struct CohereAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl CohereAdapter {
    pub fn new(config: &Config) -> Self {
        let provider_config = config.provider_config(ProviderId::Cohere);
        Self {
            base_url: provider_config
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: reqwest::Client::new(),
        }
    }

    fn request_body(&self, req: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": req.model,
            "messages": req.messages,
            "stream": stream,
        });
        let obj = body.as_object_mut().unwrap();
        if let Some(max_tokens) = req.options.max_tokens {
            obj.insert("max_tokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = req.options.temperature {
            obj.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(tools) = &req.options.tools {
            obj.insert("tools".to_string(), tools.clone());
        }
        body
    }
}

fn parse_response(raw: serde_json::Value) -> ChatResponse {
    let content = raw
        .pointer("/message/content/0/text")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let usage = TokenUsage {
        input_tokens: raw
            .pointer("/usage/billed_units/input_tokens")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0) as u64,
        output_tokens: raw
            .pointer("/usage/billed_units/output_tokens")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0) as u64,
    };
    ChatResponse { content, usage, raw }
}

#[async_trait::async_trait]
impl ProviderAdapter for CohereAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Cohere
    }

    async fn chat(
        &self,
        req: &ChatRequest,
        credential: &ResolvedCredential,
    ) -> Result<ChatResponse, CommonError> {
        let url = format!("{}/chat", self.base_url);
        let mut request = self.client.post(&url);
        if let Some(key) = &credential.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
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
        let url = format!("{}/chat", self.base_url);
        let mut request = self.client.post(&url);
        if let Some(key) = &credential.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
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
                    if line.is_empty() {
                        continue;
                    }
                    let raw: serde_json::Value = match serde_json::from_str(&line) {
                        Ok(v) => v,
                        Err(e) => {
                            yield Err(CommonError::InvalidResponse { msg: format!("malformed cohere stream event: {e}"), source: None });
                            return;
                        }
                    };
                    let event_type = raw.get("type").and_then(|v| v.as_str()).unwrap_or_default();
                    match event_type {
                        "content-delta" => {
                            let delta = raw.pointer("/delta/message/content/text").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                            yield Ok(ChatChunk { delta, usage: None, raw, is_final: false });
                        }
                        "message-end" => {
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
