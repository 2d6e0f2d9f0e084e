//! Provider Router & Transcoder (§4.1): one small adapter per upstream
//! provider over a single shared request/response vocabulary. The concrete
//! provider is a tagged variant ([`ProviderId`]), never a class hierarchy —
//! see `build_adapter` for the compile-time-exhaustive factory.

pub mod anthropic;
pub mod bedrock;
pub mod cerebras;
pub mod cohere;
pub mod gemini;
pub mod mistral;
pub mod ollama;
pub mod openai;
pub mod openai_compatible;
pub mod vllm;
pub mod zhipuai;

use std::pin::Pin;

use futures::Stream;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use shared::error::CommonError;
use utoipa::ToSchema;

use crate::config::Config;

/// Tagged provider variant. Adding a provider here without a matching arm in
/// `build_adapter` fails to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Gemini,
    Bedrock,
    Cohere,
    Cerebras,
    Mistral,
    Vllm,
    Ollama,
    Zhipuai,
}

impl ProviderId {
    pub const ALL: &'static [ProviderId] = &[
        ProviderId::OpenAi,
        ProviderId::Anthropic,
        ProviderId::Gemini,
        ProviderId::Bedrock,
        ProviderId::Cohere,
        ProviderId::Cerebras,
        ProviderId::Mistral,
        ProviderId::Vllm,
        ProviderId::Ollama,
        ProviderId::Zhipuai,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Gemini => "gemini",
            ProviderId::Bedrock => "bedrock",
            ProviderId::Cohere => "cohere",
            ProviderId::Cerebras => "cerebras",
            ProviderId::Mistral => "mistral",
            ProviderId::Vllm => "vllm",
            ProviderId::Ollama => "ollama",
            ProviderId::Zhipuai => "zhipuai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        ProviderId::ALL.iter().find(|p| p.as_str() == s).copied()
    }

    /// The `{P}` placeholder in `ARCHESTRA_CHAT_{P}_API_KEY` / `ARCHESTRA_{P}_BASE_URL`.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "OPENAI",
            ProviderId::Anthropic => "ANTHROPIC",
            ProviderId::Gemini => "GEMINI",
            ProviderId::Bedrock => "BEDROCK",
            ProviderId::Cohere => "COHERE",
            ProviderId::Cerebras => "CEREBRAS",
            ProviderId::Mistral => "MISTRAL",
            ProviderId::Vllm => "VLLM",
            ProviderId::Ollama => "OLLAMA",
            ProviderId::Zhipuai => "ZHIPUAI",
        }
    }

    /// Providers that tolerate an unconfigured/placeholder credential (§4.2 step 6/7).
    pub fn allows_placeholder_credential(&self) -> bool {
        matches!(self, ProviderId::Vllm | ProviderId::Ollama)
    }

    /// Providers whose structured-output mode is absent/unreliable and must
    /// fall back to a synthetic JSON-schema instruction (§4.1).
    pub fn needs_schema_fallback(&self) -> bool {
        matches!(
            self,
            ProviderId::Anthropic | ProviderId::Cohere | ProviderId::Ollama
                | ProviderId::Vllm | ProviderId::Zhipuai
        )
    }
}

/// A message in the canonical vocabulary. `content` is left as `Value` so
/// adapters can pass through fields they don't understand unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ChatMessage {
    pub role: String,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ChatOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub tools: Option<serde_json::Value>,
    /// Provider-specific fields the caller sent that this vocabulary doesn't
    /// model explicitly; passed through unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub options: ChatOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ChatResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ChatChunk {
    pub delta: String,
    pub usage: Option<TokenUsage>,
    pub raw: serde_json::Value,
    pub is_final: bool,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, CommonError>> + Send>>;

/// A dereferenced credential for one request: the resolved secret value
/// (`None` is legal for `vllm`/`ollama`/Vertex-mode Gemini) and an optional
/// per-key base-URL override.
#[derive(Debug, Clone, Default)]
pub struct ResolvedCredential {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn chat(
        &self,
        req: &ChatRequest,
        credential: &ResolvedCredential,
    ) -> Result<ChatResponse, CommonError>;

    async fn stream(
        &self,
        req: &ChatRequest,
        credential: &ResolvedCredential,
    ) -> Result<ChatStream, CommonError>;

    async fn chat_with_schema(
        &self,
        req: &ChatRequest,
        schema: &serde_json::Value,
        credential: &ResolvedCredential,
    ) -> Result<serde_json::Value, CommonError>;
}

/// Compile-time-exhaustive provider factory (§9): a missing arm here is a
/// build failure, not a runtime surprise.
pub fn build_adapter(provider: ProviderId, config: &Config) -> Box<dyn ProviderAdapter> {
    match provider {
        ProviderId::OpenAi => Box::new(openai::OpenAiAdapter::new(config)),
        ProviderId::Anthropic => Box::new(anthropic::AnthropicAdapter::new(config)),
        ProviderId::Gemini => Box::new(gemini::GeminiAdapter::new(config)),
        ProviderId::Bedrock => Box::new(bedrock::BedrockAdapter::new(config)),
        ProviderId::Cohere => Box::new(cohere::CohereAdapter::new(config)),
        ProviderId::Cerebras => Box::new(cerebras::CerebrasAdapter::new(config)),
        ProviderId::Mistral => Box::new(mistral::MistralAdapter::new(config)),
        ProviderId::Vllm => Box::new(vllm::VllmAdapter::new(config)),
        ProviderId::Ollama => Box::new(ollama::OllamaAdapter::new(config)),
        ProviderId::Zhipuai => Box::new(zhipuai::ZhipuaiAdapter::new(config)),
    }
}

/// Strip a single leading/trailing triple-backtick fence if present (§4.1
/// "parse the response permissively").
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches('\n');
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Shared structured-output fallback (§4.1) for providers whose native
/// schema mode is absent or unreliable: prepend a synthetic instruction to
/// the first user message, then parse the reply permissively.
pub async fn chat_with_schema_via_fallback(
    adapter: &dyn ProviderAdapter,
    req: &ChatRequest,
    schema: &serde_json::Value,
    credential: &ResolvedCredential,
) -> Result<serde_json::Value, CommonError> {
    let instruction = format!(
        "You must respond with valid JSON matching this schema: {schema}. Return only the JSON object."
    );
    let mut augmented = req.clone();
    match augmented.messages.iter_mut().find(|m| m.role == "user") {
        Some(msg) => {
            let existing = msg.content.as_str().unwrap_or_default();
            msg.content = serde_json::Value::String(format!("{instruction}\n\n{existing}"));
        }
        None => augmented.messages.insert(
            0,
            ChatMessage {
                role: "user".to_string(),
                content: serde_json::Value::String(instruction),
            },
        ),
    }

    let response = adapter.chat(&augmented, credential).await?;
    let candidate = strip_code_fence(&response.content);
    serde_json::from_str(candidate).map_err(|e| {
        CommonError::InvalidResponse {
            msg: format!("structured-output fallback did not return valid JSON: {e}"),
            source: None,
        }
    })
}
