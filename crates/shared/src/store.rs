//! Abstract collaborator interfaces the gateway and MCP dispatcher depend on
//! but never implement: `Store` (typed CRUD over the entities of
//! [`crate::domain`] plus the transactional counters owned by usage
//! metering), `SecretStore` (vault-reference resolution), and
//! `PodOrchestrator` (remote MCP server process lookup/attach).
//!
//! These are wired as `Arc<dyn ...>` by whatever deployment embeds this
//! gateway; this crate ships no concrete implementation.

use crate::domain::{
    Agent, ChatApiKey, Conversation, Interaction, Limit, LimitEntityType, McpCatalogItem,
    McpHttpSession, McpServer, Secret, SecretValue, Tool, ToolCallAuditEntry,
};
use crate::error::CommonError;
use crate::primitives::WrappedChronoDateTime;

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, CommonError>;
    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, CommonError>;
    async fn list_user_team_ids(&self, user_id: &str) -> Result<Vec<String>, CommonError>;
    async fn get_team_org_id(&self, team_id: &str) -> Result<Option<String>, CommonError>;

    // Credential Resolver reads
    async fn get_chat_api_key(&self, key_id: &str) -> Result<Option<ChatApiKey>, CommonError>;
    async fn get_personal_chat_api_key(
        &self,
        org_id: &str,
        provider: &str,
        user_id: &str,
    ) -> Result<Option<ChatApiKey>, CommonError>;
    async fn list_team_chat_api_keys(
        &self,
        org_id: &str,
        provider: &str,
        team_ids: &[String],
    ) -> Result<Vec<ChatApiKey>, CommonError>;
    async fn get_org_wide_chat_api_key(
        &self,
        org_id: &str,
        provider: &str,
    ) -> Result<Option<ChatApiKey>, CommonError>;
    async fn get_secret(&self, secret_id: &str) -> Result<Option<Secret>, CommonError>;

    // MCP catalog/server/tool reads
    async fn get_mcp_catalog_item(
        &self,
        catalog_id: &str,
    ) -> Result<Option<McpCatalogItem>, CommonError>;
    async fn get_mcp_server(&self, server_id: &str) -> Result<Option<McpServer>, CommonError>;
    async fn list_mcp_servers_owned_by_any(
        &self,
        owner_ids: &[String],
    ) -> Result<Vec<McpServer>, CommonError>;
    /// Every MCP server in the catalog regardless of owner, for the
    /// org-token/external-IdP resolution steps that must be able to reach a
    /// server the caller doesn't themselves own.
    async fn list_all_mcp_servers(&self, catalog_id: &str) -> Result<Vec<McpServer>, CommonError>;
    async fn get_tool(&self, tool_id: &str) -> Result<Option<Tool>, CommonError>;
    async fn find_tool_by_name(
        &self,
        mcp_server_id: &str,
        slug: &str,
    ) -> Result<Option<Tool>, CommonError>;
    async fn set_mcp_server_oauth_error(
        &self,
        server_id: &str,
        error: Option<String>,
        failed_at: Option<WrappedChronoDateTime>,
    ) -> Result<(), CommonError>;
    async fn update_secret_value(
        &self,
        secret_id: &str,
        new_value: SecretValue,
    ) -> Result<(), CommonError>;

    // Core-owned writes: MCP session persistence, audit log, interactions,
    // and the usage-metering counters.
    async fn get_mcp_http_session(
        &self,
        connection_key: &str,
    ) -> Result<Option<McpHttpSession>, CommonError>;
    async fn upsert_mcp_http_session(&self, session: &McpHttpSession) -> Result<(), CommonError>;
    async fn delete_mcp_http_session(&self, connection_key: &str) -> Result<(), CommonError>;
    async fn append_tool_call_audit(&self, entry: &ToolCallAuditEntry) -> Result<(), CommonError>;
    async fn insert_interaction(&self, interaction: &Interaction) -> Result<(), CommonError>;

    async fn list_limits_for_entity(
        &self,
        entity_type: LimitEntityType,
        entity_id: &str,
    ) -> Result<Vec<Limit>, CommonError>;
    async fn get_limit_usage(
        &self,
        limit_id: &str,
    ) -> Result<(u64, u64), CommonError>;
    async fn increment_limit_usage(
        &self,
        limit_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<(), CommonError>;
    /// Zero the counters of every limit whose `last_cleanup` is older than
    /// `cutoff`; returns the number of limits reset.
    async fn reset_due_limits(&self, cutoff: WrappedChronoDateTime) -> Result<u64, CommonError>;
}

/// Vault-reference secret resolution, kept separate from `Store` because it
/// may be backed by a wholly different system (e.g. Vault, AWS Secrets
/// Manager) than the relational entities `Store` exposes.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    async fn resolve(&self, value: &SecretValue) -> Result<String, CommonError>;
}

/// A live handle to an attached remote process, as returned by
/// [`PodOrchestrator::attach`]. Mirrors the shape an MCP stdio transport
/// needs: stdin/stdout framed as byte streams.
pub struct AttachedProcess {
    pub stdin: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
}

/// Resolves a remote MCP server's Kubernetes-style deployment to a running
/// pod, for stdio transports that must be attached to rather than spawned
/// locally, and to an HTTP endpoint for streamable-HTTP transports.
#[async_trait::async_trait]
pub trait PodOrchestrator: Send + Sync {
    async fn get_or_load_deployment(&self, server_id: &str) -> Result<(), CommonError>;
    async fn get_running_pod(&self, server_id: &str) -> Result<String, CommonError>;
    async fn attach(
        &self,
        pod_name: &str,
        container: &str,
    ) -> Result<AttachedProcess, CommonError>;
    async fn get_http_endpoint(&self, server_id: &str) -> Result<String, CommonError>;
}
