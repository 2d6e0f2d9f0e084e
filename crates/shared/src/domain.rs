//! Core domain entities shared across the gateway and MCP dispatcher.
//!
//! These mirror the entities owned by the external `Store` collaborator
//! (see [`crate::store`]); this crate only carries their shape, never their
//! persistence.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::primitives::WrappedChronoDateTime;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct Agent {
    pub id: String,
    pub org_id: String,
    pub teams: Vec<String>,
    pub llm_api_key_id: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct Conversation {
    pub id: String,
    pub org_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub chat_api_key_id: Option<String>,
    pub has_custom_tool_selection: bool,
}

/// `scope` determines which of `user_id`/`team_id` is populated; see
/// [`ChatApiKeyScope`] for the invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChatApiKeyScope {
    Personal,
    Team,
    OrgWide,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ChatApiKey {
    pub id: String,
    pub org_id: String,
    pub provider: String,
    pub scope: ChatApiKeyScope,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub secret_id: Option<String>,
    pub is_system: bool,
    pub created_at: WrappedChronoDateTime,
}

/// A secret's plain value, or an unresolved `path#key` vault reference.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SecretValue {
    Plain { value: String },
    VaultRef { path: String, key: String },
}

impl SecretValue {
    /// Parse the stored `path#key` vault-reference grammar; anything without
    /// a `#` is a plain value.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('#') {
            Some((path, key)) if !path.is_empty() && !key.is_empty() => SecretValue::VaultRef {
                path: path.to_string(),
                key: key.to_string(),
            },
            _ => SecretValue::Plain {
                value: raw.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct Secret {
    pub id: String,
    pub value: SecretValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum McpServerKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct OAuthConfig {
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct McpCatalogItem {
    pub id: String,
    pub server_type: McpServerKind,
    pub server_url: Option<String>,
    pub oauth_config: Option<OAuthConfig>,
    pub advertises_streamable_http: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct McpServer {
    pub id: String,
    pub catalog_id: String,
    pub owner_id: Option<String>,
    pub team_id: Option<String>,
    pub secret_id: Option<String>,
    pub oauth_refresh_error: Option<String>,
    pub oauth_refresh_failed_at: Option<WrappedChronoDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct Tool {
    pub id: String,
    pub mcp_server_id: Option<String>,
    pub catalog_id: Option<String>,
    pub name: String,
    pub response_modifier_template: Option<String>,
    pub use_dynamic_team_credential: bool,
    pub execution_source_mcp_server_id: Option<String>,
    pub credential_source_mcp_server_id: Option<String>,
}

/// Slugify a tool name the way the DB stores it: lowercase, `[a-z0-9_-]` only.
pub fn slugify_tool_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct McpHttpSession {
    pub connection_key: String,
    pub session_id: String,
    pub session_endpoint_url: Option<String>,
    pub session_endpoint_pod_name: Option<String>,
    pub updated_at: WrappedChronoDateTime,
}

/// The `{provider}:{endpoint}` discriminator grammar (§9 open question b).
/// Constructed only through [`InteractionType::new`] so call sites can't drift
/// from the grammar by hand-formatting strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(transparent)]
pub struct InteractionType(String);

impl InteractionType {
    pub fn new(provider: &str, endpoint: &str) -> Self {
        Self(format!("{provider}:{endpoint}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn provider(&self) -> &str {
        self.0.split_once(':').map(|(p, _)| p).unwrap_or(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct Interaction {
    pub id: String,
    pub agent_id: String,
    pub org_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub external_agent_id: Option<String>,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Option<f64>,
    #[serde(rename = "type")]
    pub interaction_type: InteractionType,
    pub created_at: WrappedChronoDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LimitEntityType {
    Agent,
    Team,
    Organization,
}

impl LimitEntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitEntityType::Agent => "agent",
            LimitEntityType::Team => "team",
            LimitEntityType::Organization => "organization",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct Limit {
    pub id: String,
    pub entity_type: LimitEntityType,
    pub entity_id: String,
    pub limit_value: f64,
    pub models: Vec<String>,
    pub last_cleanup: Option<WrappedChronoDateTime>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct LimitCounter {
    pub current_usage_tokens_in: u64,
    pub current_usage_tokens_out: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ModelPrice {
    pub model: String,
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
}

impl ModelPrice {
    /// Convert a token count pair to a cost in the same unit as `limit_value`.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_price_per_million
            + output_tokens as f64 * self.output_price_per_million)
            / 1_000_000.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ToolCallAuditEntry {
    pub agent_id: String,
    pub tool_name: String,
    pub tool_call: serde_json::Value,
    pub tool_result: serde_json::Value,
    pub is_error: bool,
    pub user_id: Option<String>,
    pub auth_method: Option<String>,
    pub created_at: WrappedChronoDateTime,
}

/// High-frequency tool-call names excluded from the audit log (§4.3).
const AUDIT_FILTERED_SUBSTRINGS: &[&str] = &["screenshot", "tab", "viewport"];

pub fn is_audit_filtered(tool_name: &str) -> bool {
    let lower = tool_name.to_lowercase();
    AUDIT_FILTERED_SUBSTRINGS
        .iter()
        .any(|needle| lower.contains(needle))
}
