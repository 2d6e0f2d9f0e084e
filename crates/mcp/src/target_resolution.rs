//! Target MCP server resolution and transport-family selection (§4.3
//! "Transport selection" / "Target server resolution").

use shared::domain::{McpCatalogItem, McpServer, McpServerKind, Tool};
use shared::error::CommonError;
use shared::identity::TokenAuthContext;
use shared::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    HttpStreamable,
}

/// `local` + no streamable-HTTP advertisement uses stdio over pod attach;
/// everything else (advertised streamable HTTP, or a `remote` catalog item)
/// uses the HTTP streamable transport.
pub fn transport_kind(catalog_item: &McpCatalogItem) -> TransportKind {
    match catalog_item.server_type {
        McpServerKind::Remote => TransportKind::HttpStreamable,
        McpServerKind::Local if catalog_item.advertises_streamable_http => {
            TransportKind::HttpStreamable
        }
        McpServerKind::Local => TransportKind::Stdio,
    }
}

/// Resolve the concrete `McpServer` a tool call should run against.
///
/// Static assignment (`useDynamicTeamCredential=false`) picks the fixed
/// execution/credential source id. Dynamic assignment walks the five-step
/// fallback in caller-context order.
pub async fn resolve_target_server(
    store: &dyn Store,
    tool: &Tool,
    catalog_item: &McpCatalogItem,
    user_id: Option<&str>,
    user_team_ids: &[String],
    auth: &TokenAuthContext,
) -> Result<McpServer, CommonError> {
    if !tool.use_dynamic_team_credential {
        let server_id = match catalog_item.server_type {
            McpServerKind::Local => tool.execution_source_mcp_server_id.as_deref(),
            McpServerKind::Remote => tool.credential_source_mcp_server_id.as_deref(),
        };
        let server_id = server_id.ok_or_else(|| {
            CommonError::misconfigured(format!(
                "tool '{}' has useDynamicTeamCredential=false but no source server configured",
                tool.name
            ))
        })?;
        return store
            .get_mcp_server(server_id)
            .await?
            .ok_or_else(|| CommonError::not_found("mcp server not found", server_id.to_string()));
    }

    let candidate_owner_ids: Vec<String> = user_id
        .into_iter()
        .map(str::to_string)
        .chain(user_team_ids.iter().cloned())
        .collect();
    let candidates = store
        .list_mcp_servers_owned_by_any(&candidate_owner_ids)
        .await?;

    // 1. user-owned, personal (teamId null)
    if let Some(user_id) = user_id {
        if let Some(server) = candidates
            .iter()
            .find(|s| s.owner_id.as_deref() == Some(user_id) && s.team_id.is_none())
        {
            return Ok(server.clone());
        }
    }

    // 2. owned by any team member, teamId null
    if let Some(server) = candidates.iter().find(|s| {
        s.team_id.is_none()
            && s.owner_id
                .as_deref()
                .map(|owner| user_team_ids.iter().any(|t| t == owner))
                .unwrap_or(false)
    }) {
        return Ok(server.clone());
    }

    // 3. any server whose owner is a team member
    if let Some(server) = candidates.iter().find(|s| {
        s.owner_id
            .as_deref()
            .map(|owner| user_team_ids.iter().any(|t| t == owner))
            .unwrap_or(false)
    }) {
        return Ok(server.clone());
    }

    // 4 and 5 fall through to any server in the catalog, not just ones the
    // caller already owns — org tokens and external-IdP callers are trusted
    // at the catalog level, so re-fetch unrestricted by owner.
    if auth.is_org_token || auth.is_external_idp {
        let all_servers = store.list_all_mcp_servers(&catalog_item.id).await?;

        // 4. any server, caller is an org token
        if auth.is_org_token {
            if let Some(server) = all_servers.first() {
                return Ok(server.clone());
            }
        }

        // 5. any server, caller is external-IdP
        if auth.is_external_idp {
            if let Some(server) = all_servers.first() {
                return Ok(server.clone());
            }
        }
    }

    Err(CommonError::not_found(
        format!(
            "no accessible MCP server for tool '{}' — install one at /settings/mcp-servers",
            tool.name
        ),
        tool.id.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::{
        ChatApiKey, Conversation, Interaction, Limit, LimitEntityType, McpHttpSession, Secret,
        SecretValue, ToolCallAuditEntry,
    };
    use shared::primitives::WrappedChronoDateTime;

    fn server(id: &str, owner_id: Option<&str>, team_id: Option<&str>) -> McpServer {
        McpServer {
            id: id.to_string(),
            catalog_id: "cat-1".to_string(),
            owner_id: owner_id.map(str::to_string),
            team_id: team_id.map(str::to_string),
            secret_id: None,
            oauth_refresh_error: None,
            oauth_refresh_failed_at: None,
        }
    }

    fn auth(is_org_token: bool, is_external_idp: bool) -> TokenAuthContext {
        TokenAuthContext {
            token_id: "tok-1".to_string(),
            user_id: Some("caller".to_string()),
            org_id: "org-1".to_string(),
            team_ids: Some(vec![]),
            is_org_token,
            is_external_idp,
            raw_token: None,
        }
    }

    fn dynamic_tool() -> Tool {
        Tool {
            id: "tool-1".to_string(),
            mcp_server_id: None,
            catalog_id: "cat-1".to_string(),
            name: "search".to_string(),
            response_modifier_template: None,
            use_dynamic_team_credential: true,
            execution_source_mcp_server_id: None,
            credential_source_mcp_server_id: None,
        }
    }

    /// Only has a server owned by a stranger, unreachable via the owned-only
    /// lookup steps 1-3 use — reachable only through the any-server fallback.
    struct StrangerOwnedServerStore;

    #[async_trait::async_trait]
    impl Store for StrangerOwnedServerStore {
        async fn get_agent(&self, _: &str) -> Result<Option<shared::domain::Agent>, CommonError> { Ok(None) }
        async fn get_conversation(&self, _: &str) -> Result<Option<Conversation>, CommonError> { Ok(None) }
        async fn list_user_team_ids(&self, _: &str) -> Result<Vec<String>, CommonError> { Ok(vec![]) }
        async fn get_team_org_id(&self, _: &str) -> Result<Option<String>, CommonError> { Ok(None) }
        async fn get_chat_api_key(&self, _: &str) -> Result<Option<ChatApiKey>, CommonError> { Ok(None) }
        async fn get_personal_chat_api_key(&self, _: &str, _: &str, _: &str) -> Result<Option<ChatApiKey>, CommonError> { Ok(None) }
        async fn list_team_chat_api_keys(&self, _: &str, _: &str, _: &[String]) -> Result<Vec<ChatApiKey>, CommonError> { Ok(vec![]) }
        async fn get_org_wide_chat_api_key(&self, _: &str, _: &str) -> Result<Option<ChatApiKey>, CommonError> { Ok(None) }
        async fn get_secret(&self, _: &str) -> Result<Option<Secret>, CommonError> { Ok(None) }
        async fn get_mcp_catalog_item(&self, _: &str) -> Result<Option<McpCatalogItem>, CommonError> { Ok(None) }
        async fn get_mcp_server(&self, _: &str) -> Result<Option<McpServer>, CommonError> { Ok(None) }
        async fn list_mcp_servers_owned_by_any(&self, _: &[String]) -> Result<Vec<McpServer>, CommonError> {
            Ok(vec![])
        }
        async fn list_all_mcp_servers(&self, _: &str) -> Result<Vec<McpServer>, CommonError> {
            Ok(vec![server("srv-stranger", Some("someone-else"), None)])
        }
        async fn get_tool(&self, _: &str) -> Result<Option<Tool>, CommonError> { Ok(None) }
        async fn find_tool_by_name(&self, _: &str, _: &str) -> Result<Option<Tool>, CommonError> { Ok(None) }
        async fn set_mcp_server_oauth_error(&self, _: &str, _: Option<String>, _: Option<WrappedChronoDateTime>) -> Result<(), CommonError> { Ok(()) }
        async fn update_secret_value(&self, _: &str, _: SecretValue) -> Result<(), CommonError> { Ok(()) }
        async fn get_mcp_http_session(&self, _: &str) -> Result<Option<McpHttpSession>, CommonError> { Ok(None) }
        async fn upsert_mcp_http_session(&self, _: &McpHttpSession) -> Result<(), CommonError> { Ok(()) }
        async fn delete_mcp_http_session(&self, _: &str) -> Result<(), CommonError> { Ok(()) }
        async fn append_tool_call_audit(&self, _: &ToolCallAuditEntry) -> Result<(), CommonError> { Ok(()) }
        async fn insert_interaction(&self, _: &Interaction) -> Result<(), CommonError> { Ok(()) }
        async fn list_limits_for_entity(&self, _: LimitEntityType, _: &str) -> Result<Vec<Limit>, CommonError> { Ok(vec![]) }
        async fn get_limit_usage(&self, _: &str) -> Result<(u64, u64), CommonError> { Ok((0, 0)) }
        async fn increment_limit_usage(&self, _: &str, _: u64, _: u64) -> Result<(), CommonError> { Ok(()) }
        async fn reset_due_limits(&self, _: WrappedChronoDateTime) -> Result<u64, CommonError> { Ok(0) }
    }

    #[tokio::test]
    async fn org_token_falls_through_to_any_server_not_just_owned_ones() {
        let store = StrangerOwnedServerStore;
        let catalog_item = catalog_item(McpServerKind::Remote, false);
        let tool = dynamic_tool();
        let resolved = resolve_target_server(
            &store,
            &tool,
            &catalog_item,
            Some("caller"),
            &[],
            &auth(true, false),
        )
        .await
        .unwrap();
        assert_eq!(resolved.id, "srv-stranger");
    }

    #[tokio::test]
    async fn external_idp_falls_through_to_any_server_not_just_owned_ones() {
        let store = StrangerOwnedServerStore;
        let catalog_item = catalog_item(McpServerKind::Remote, false);
        let tool = dynamic_tool();
        let resolved = resolve_target_server(
            &store,
            &tool,
            &catalog_item,
            Some("caller"),
            &[],
            &auth(false, true),
        )
        .await
        .unwrap();
        assert_eq!(resolved.id, "srv-stranger");
    }

    #[tokio::test]
    async fn plain_token_never_reaches_any_server_fallback() {
        let store = StrangerOwnedServerStore;
        let catalog_item = catalog_item(McpServerKind::Remote, false);
        let tool = dynamic_tool();
        let err = resolve_target_server(
            &store,
            &tool,
            &catalog_item,
            Some("caller"),
            &[],
            &auth(false, false),
        )
        .await
        .unwrap_err();
        assert!(matches!(err.kind(), shared::error::ChatErrorKind::NotFound));
    }

    fn catalog_item(server_type: McpServerKind, advertises_streamable_http: bool) -> McpCatalogItem {
        McpCatalogItem {
            id: "cat-1".to_string(),
            server_type,
            server_url: None,
            oauth_config: None,
            advertises_streamable_http,
        }
    }

    #[test]
    fn local_without_streamable_http_uses_stdio() {
        let item = catalog_item(McpServerKind::Local, false);
        assert_eq!(transport_kind(&item), TransportKind::Stdio);
    }

    #[test]
    fn local_advertising_streamable_http_uses_http() {
        let item = catalog_item(McpServerKind::Local, true);
        assert_eq!(transport_kind(&item), TransportKind::HttpStreamable);
    }

    #[test]
    fn remote_always_uses_http() {
        let item = catalog_item(McpServerKind::Remote, false);
        assert_eq!(transport_kind(&item), TransportKind::HttpStreamable);
    }
}
