//! Shared transcoder for the OpenAI-compatible wire shape (§4.1): backs
//! `openai`, `cerebras`, `mistral`, `vllm`, `ollama`, and `zhipuai`, each of
//! which is a thin wrapper supplying its own base URL / auth header.

use futures::StreamExt;
use serde_json::json;
use shared::error::CommonError;

use crate::providers::{
    ChatChunk, ChatRequest, ChatResponse, ChatStream, ResolvedCredential, TokenUsage,
    chat_with_schema_via_fallback, ProviderAdapter,
};

/// Build the `POST {base_url}/chat/completions` request body from the
/// canonical vocabulary.
pub fn request_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
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
    for (k, v) in &req.options.extra {
        obj.insert(k.clone(), v.clone());
    }
    body
}

/// Attach `Authorization: Bearer <key>` if a credential is present; bare
/// otherwise (vllm/ollama tolerate unauthenticated requests, §4.2 step 7).
pub fn authorize(
    request: reqwest::RequestBuilder,
    credential: &ResolvedCredential,
) -> reqwest::RequestBuilder {
    match &credential.api_key {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}

fn parse_response(raw: serde_json::Value) -> ChatResponse {
    let content = raw
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let usage = TokenUsage {
        input_tokens: raw
            .pointer("/usage/prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: raw
            .pointer("/usage/completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    };
    ChatResponse {
        content,
        usage,
        raw,
    }
}

async fn map_response_error(response: reqwest::Response) -> CommonError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        CommonError::rate_limit(body)
    } else if status.is_client_error() {
        CommonError::invalid_request(body)
    } else {
        CommonError::server_error(body)
    }
}

pub async fn chat(
    client: &reqwest::Client,
    base_url: &str,
    req: &ChatRequest,
    credential: &ResolvedCredential,
) -> Result<ChatResponse, CommonError> {
    let url = format!("{base_url}/chat/completions");
    let response = authorize(client.post(&url), credential)
        .json(&request_body(req, false))
        .send()
        .await
        .map_err(|e| CommonError::network_error(e.to_string()))?;

    if !response.status().is_success() {
        return Err(map_response_error(response).await);
    }
    let raw: serde_json::Value = response
        .json()
        .await
        .map_err(|e| CommonError::network_error(e.to_string()))?;
    Ok(parse_response(raw))
}

pub async fn stream(
    client: &reqwest::Client,
    base_url: &str,
    req: &ChatRequest,
    credential: &ResolvedCredential,
) -> Result<ChatStream, CommonError> {
    let url = format!("{base_url}/chat/completions");
    let response = authorize(client.post(&url), credential)
        .json(&request_body(req, true))
        .send()
        .await
        .map_err(|e| CommonError::network_error(e.to_string()))?;

    if !response.status().is_success() {
        return Err(map_response_error(response).await);
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
                if data == "[DONE]" {
                    yield Ok(ChatChunk {
                        delta: String::new(),
                        usage: None,
                        raw: serde_json::Value::Null,
                        is_final: true,
                    });
                    return;
                }
                if data.is_empty() {
                    continue;
                }
                match serde_json::from_str::<serde_json::Value>(data) {
                    Ok(raw) => {
                        let delta = raw
                            .pointer("/choices/0/delta/content")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let usage = raw.get("usage").map(|_| TokenUsage {
                            input_tokens: raw.pointer("/usage/prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                            output_tokens: raw.pointer("/usage/completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                        });
                        yield Ok(ChatChunk { delta, usage, raw, is_final: false });
                    }
                    Err(e) => {
                        yield Err(CommonError::InvalidResponse {
                            msg: format!("malformed SSE chunk: {e}"),
                            source: None,
                        });
                        return;
                    }
                }
            }
        }
    };

    Ok(Box::pin(out))
}

/// Attempt the native `response_format: json_schema` mode vllm/ollama/zhipuai
/// all accept (it's the same OpenAI-compatible field openai/cerebras/mistral
/// use), falling back to the synthetic-instruction prompt when the server
/// ignores it and returns empty content rather than erroring outright.
pub async fn chat_with_schema(
    adapter: &dyn ProviderAdapter,
    client: &reqwest::Client,
    base_url: &str,
    req: &ChatRequest,
    schema: &serde_json::Value,
    credential: &ResolvedCredential,
) -> Result<serde_json::Value, CommonError> {
    let mut augmented = req.clone();
    augmented.options.extra.insert(
        "response_format".to_string(),
        json!({
            "type": "json_schema",
            "json_schema": { "name": "response", "schema": schema, "strict": true }
        }),
    );
    let response = chat(client, base_url, &augmented, credential).await?;
    if response.content.is_empty() {
        return chat_with_schema_via_fallback(adapter, req, schema, credential).await;
    }
    serde_json::from_str(&response.content).map_err(|e| CommonError::InvalidResponse {
        msg: format!("structured output was not valid JSON: {e}"),
        source: None,
    })
}
