use futures::StreamExt;
use serde_json::json;
use shared::error::CommonError;

use crate::config::{Config, GeminiVertexConfig};
use crate::providers::{
    ChatChunk, ChatRequest, ChatResponse, ChatStream, ProviderAdapter, ProviderId,
    ResolvedCredential, TokenUsage, chat_with_schema_via_fallback,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Either the public Gemini API (API key in the query string) or Vertex AI
/// (project/location-scoped endpoint, Bearer OAuth token).
pub struct GeminiAdapter {
    base_url: String,
    vertex: Option<GeminiVertexConfig>,
    client: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(config: &Config) -> Self {
        let provider_config = config.provider_config(ProviderId::Gemini);
        let vertex = Some(config.gemini_vertex.clone()).filter(|v| v.enabled);
        Self {
            base_url: provider_config
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            vertex,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        match &self.vertex {
            Some(v) => {
                let location = v.location.as_deref().unwrap_or("us-central1");
                let project = v.project.as_deref().unwrap_or_default();
                format!(
                    "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google/models/{model}:{method}",
                )
            }
            None => format!("{}/models/{model}:{method}", self.base_url),
        }
    }

    fn request_body(&self, req: &ChatRequest) -> serde_json::Value {
        let contents: Vec<_> = req
            .messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| {
                json!({
                    "role": if m.role == "assistant" { "model" } else { "user" },
                    "parts": [{ "text": m.content }]
                })
            })
            .collect();
        let system_instruction = req
            .messages
            .iter()
            .find(|m| m.role == "system")
            .and_then(|m| m.content.as_str())
            .map(|text| json!({ "parts": [{ "text": text }] }));

        let mut body = json!({ "contents": contents });
        let obj = body.as_object_mut().unwrap();
        if let Some(system_instruction) = system_instruction {
            obj.insert("systemInstruction".to_string(), system_instruction);
        }
        let mut generation_config = serde_json::Map::new();
        if let Some(max_tokens) = req.options.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = req.options.temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }
        if !generation_config.is_empty() {
            obj.insert(
                "generationConfig".to_string(),
                serde_json::Value::Object(generation_config),
            );
        }
        if let Some(tools) = &req.options.tools {
            obj.insert("tools".to_string(), tools.clone());
        }
        body
    }

    fn request(&self, url: &str, credential: &ResolvedCredential) -> reqwest::RequestBuilder {
        let mut request = self.client.post(url);
        match (&self.vertex, &credential.api_key) {
            (Some(_), Some(token)) => request = request.bearer_auth(token),
            (None, Some(key)) => request = request.query(&[("key", key.as_str())]),
            _ => {}
        }
        request
    }
}

fn parse_response(raw: serde_json::Value) -> ChatResponse {
    let content = raw
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let usage = TokenUsage {
        input_tokens: raw
            .pointer("/usageMetadata/promptTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: raw
            .pointer("/usageMetadata/candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    };
    ChatResponse { content, usage, raw }
}

#[async_trait::async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    async fn chat(
        &self,
        req: &ChatRequest,
        credential: &ResolvedCredential,
    ) -> Result<ChatResponse, CommonError> {
        let url = self.endpoint(&req.model, "generateContent");
        let response = self
            .request(&url, credential)
            .json(&self.request_body(req))
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
        let url = self.endpoint(&req.model, "streamGenerateContent");
        let response = self
            .request(&url, credential)
            .query(&[("alt", "sse")])
            .json(&self.request_body(req))
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
                            yield Err(CommonError::InvalidResponse { msg: format!("malformed gemini SSE chunk: {e}"), source: None });
                            return;
                        }
                    };
                    let delta = raw.pointer("/candidates/0/content/parts/0/text").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let is_final = raw.pointer("/candidates/0/finishReason").is_some();
                    let usage = raw.get("usageMetadata").map(|_| TokenUsage {
                        input_tokens: raw.pointer("/usageMetadata/promptTokenCount").and_then(|v| v.as_u64()).unwrap_or(0),
                        output_tokens: raw.pointer("/usageMetadata/candidatesTokenCount").and_then(|v| v.as_u64()).unwrap_or(0),
                    });
                    yield Ok(ChatChunk { delta, usage, raw, is_final });
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
        let augmented = req.clone();
        let url = self.endpoint(&augmented.model, "generateContent");
        let mut body = self.request_body(&augmented);
        let obj = body.as_object_mut().unwrap();
        let mut generation_config = obj
            .remove("generationConfig")
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        generation_config.insert("responseMimeType".to_string(), json!("application/json"));
        generation_config.insert("responseSchema".to_string(), schema.clone());
        obj.insert(
            "generationConfig".to_string(),
            serde_json::Value::Object(generation_config),
        );

        let response = self
            .request(&url, credential)
            .json(&body)
            .send()
            .await
            .map_err(|e| CommonError::network_error(e.to_string()))?;
        let status = response.status();
        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CommonError::network_error(e.to_string()))?;
        if status.is_client_error() {
            return Err(CommonError::invalid_request(raw.to_string()));
        }
        if status.is_server_error() {
            return Err(CommonError::server_error(raw.to_string()));
        }
        let content = parse_response(raw).content;
        if content.is_empty() {
            // Vertex on some models ignores responseSchema; fall back rather
            // than error on an empty body.
            return chat_with_schema_via_fallback(self, &augmented, schema, credential).await;
        }
        serde_json::from_str(&content).map_err(|e| CommonError::InvalidResponse {
            msg: format!("gemini structured output was not valid JSON: {e}"),
            source: None,
        })
    }
}
