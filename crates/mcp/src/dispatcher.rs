//! The connection pool and tool-call orchestration (§4.3). This is the part
//! that ties [`crate::connection`], [`crate::target_resolution`],
//! [`crate::oauth`], [`crate::tool_modifier`] and [`crate::transport`]
//! together into one call path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OnceCell, Semaphore};

use shared::domain::{
    is_audit_filtered, McpCatalogItem, McpServer, OAuthConfig, Tool, ToolCallAuditEntry,
};
use shared::error::CommonError;
use shared::identity::TokenAuthContext;
use shared::primitives::WrappedChronoDateTime;
use shared::store::{PodOrchestrator, SecretStore, Store};

use crate::connection::{ClientState, ConnectionKey};
use crate::oauth::{self, OAuthRefresher, RefreshOutcome};
use crate::target_resolution::{self, TransportKind};
use crate::tool_modifier::apply_response_modifier;
use crate::transport::{Client, McpClientHandle};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub http_concurrency_limit: usize,
    pub connect_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            http_concurrency_limit: 4,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything needed to identify and authorize a single tool call. Built by
/// the HTTP ingress layer from the inbound request.
pub struct ToolCallContext<'a> {
    pub agent_id: String,
    pub conversation_scope: Option<(String, String)>,
    pub ext_idp_user_id: Option<String>,
    pub user_id: Option<String>,
    pub user_team_ids: Vec<String>,
    pub auth: &'a TokenAuthContext,
    pub auth_method: Option<String>,
    pub tool: &'a Tool,
    pub catalog_item: &'a McpCatalogItem,
    pub arguments: Option<Value>,
}

struct ManagedConnection {
    client: Box<dyn McpClientHandle>,
    limiter: Arc<Semaphore>,
    tool_names: OnceCell<HashMap<String, String>>,
    state: std::sync::Mutex<ClientState>,
}

impl ManagedConnection {
    fn new(client: Box<dyn McpClientHandle>, transport_kind: TransportKind, http_limit: usize) -> Self {
        let permits = match transport_kind {
            TransportKind::Stdio => 1,
            TransportKind::HttpStreamable => http_limit,
        };
        Self {
            client,
            limiter: Arc::new(Semaphore::new(permits)),
            tool_names: OnceCell::new(),
            state: std::sync::Mutex::new(ClientState::Ready),
        }
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap() = state;
    }
}

fn looks_like_auth_error(err: &CommonError) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("401") || msg.contains("unauthorized")
}

/// The per-process connection pool. One instance is shared across requests.
pub struct McpDispatcher {
    connections: DashMap<ConnectionKey, Arc<ManagedConnection>>,
    recovery_locks: DashMap<ConnectionKey, Arc<AsyncMutex<()>>>,
    store: Arc<dyn Store>,
    secret_store: Arc<dyn SecretStore>,
    pod_orchestrator: Arc<dyn PodOrchestrator>,
    config: DispatcherConfig,
}

impl McpDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        secret_store: Arc<dyn SecretStore>,
        pod_orchestrator: Arc<dyn PodOrchestrator>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            recovery_locks: DashMap::new(),
            store,
            secret_store,
            pod_orchestrator,
            config,
        }
    }

    /// Resolve the target server, get-or-create a live connection, translate
    /// the tool name, call it, retry exactly once on an OAuth 401, apply the
    /// response modifier, and write the audit log. One call, start to finish.
    pub async fn call_tool(&self, ctx: ToolCallContext<'_>) -> Result<Value, CommonError> {
        let server = target_resolution::resolve_target_server(
            self.store.as_ref(),
            ctx.tool,
            ctx.catalog_item,
            ctx.user_id.as_deref(),
            &ctx.user_team_ids,
            ctx.auth,
        )
        .await?;
        let transport_kind = target_resolution::transport_kind(ctx.catalog_item);
        let conversation_scope = ctx
            .conversation_scope
            .as_ref()
            .map(|(a, c)| (a.as_str(), c.as_str()));
        let key = ConnectionKey::build(
            &ctx.catalog_item.id,
            &server.id,
            conversation_scope,
            ctx.ext_idp_user_id.as_deref(),
        );

        let conn = self
            .get_or_create_connection(&key, ctx.catalog_item, &server, transport_kind)
            .await?;

        let result = self.call_on_connection(&key, &conn, ctx.tool, ctx.arguments.clone()).await;

        let result = match result {
            Err(err) if looks_like_auth_error(&err) => {
                self.handle_auth_error(&key, ctx.catalog_item, &server, ctx.tool, ctx.arguments.clone())
                    .await
            }
            other => other,
        };

        let is_error = result.is_err();
        let tool_result = match &result {
            Ok(value) => value.clone(),
            Err(err) => serde_json::json!({ "error": err.to_string() }),
        };

        if !is_audit_filtered(&ctx.tool.name) {
            let entry = ToolCallAuditEntry {
                agent_id: ctx.agent_id.clone(),
                tool_name: ctx.tool.name.clone(),
                tool_call: ctx.arguments.clone().unwrap_or(Value::Null),
                tool_result: tool_result.clone(),
                is_error,
                user_id: ctx.user_id.clone(),
                auth_method: ctx.auth_method.clone(),
                created_at: WrappedChronoDateTime::now(),
            };
            self.store.append_tool_call_audit(&entry).await?;
        }

        let content = result?;
        Ok(apply_response_modifier(
            ctx.tool.response_modifier_template.as_deref(),
            &content,
        ))
    }

    async fn call_on_connection(
        &self,
        key: &ConnectionKey,
        conn: &Arc<ManagedConnection>,
        tool: &Tool,
        arguments: Option<Value>,
    ) -> Result<Value, CommonError> {
        let _permit = conn
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| CommonError::network_error(format!("connection closed: {err}")))?;
        conn.set_state(ClientState::InUse);

        let canonical_name = self.resolve_tool_name(conn, &tool.name).await?;
        let outcome = conn.client.call_tool(&canonical_name, arguments).await;

        match &outcome {
            Ok(_) => conn.set_state(ClientState::Ready),
            Err(_) => {
                conn.set_state(ClientState::Closing);
                self.connections.remove(key);
            }
        }
        outcome
    }

    async fn resolve_tool_name(
        &self,
        conn: &Arc<ManagedConnection>,
        slugged_name: &str,
    ) -> Result<String, CommonError> {
        let map = conn
            .tool_names
            .get_or_try_init(|| async {
                let tools = conn.client.list_tools().await?;
                let mut map = HashMap::new();
                for tool in tools {
                    map.insert(tool.name.to_lowercase(), tool.name.to_string());
                }
                Ok::<_, CommonError>(map)
            })
            .await?;
        Ok(map
            .get(&slugged_name.to_lowercase())
            .cloned()
            .unwrap_or_else(|| slugged_name.to_string()))
    }

    async fn handle_auth_error(
        &self,
        key: &ConnectionKey,
        catalog_item: &McpCatalogItem,
        server: &McpServer,
        tool: &Tool,
        arguments: Option<Value>,
    ) -> Result<Value, CommonError> {
        self.connections.remove(key);

        let Some(oauth_config) = catalog_item.oauth_config.as_ref() else {
            return Err(CommonError::invalid_request(format!(
                "tool '{}' received an auth error and its server has no oauth config",
                tool.name
            )));
        };

        let refresher = EnvOAuthRefresher;
        let outcome = oauth::refresh_and_persist(
            self.store.as_ref(),
            self.secret_store.as_ref(),
            &refresher,
            server,
            oauth_config,
        )
        .await?;

        match outcome {
            RefreshOutcome::Refreshed => {
                let transport_kind = target_resolution::transport_kind(catalog_item);
                let conn = self
                    .get_or_create_connection(key, catalog_item, server, transport_kind)
                    .await?;
                self.call_on_connection(key, &conn, tool, arguments).await
            }
            RefreshOutcome::NoRefreshToken => Err(CommonError::invalid_request(format!(
                "tool '{}' auth expired and no refresh token is on file",
                tool.name
            ))),
            RefreshOutcome::Failed => Err(CommonError::invalid_request(format!(
                "tool '{}' auth refresh failed",
                tool.name
            ))),
        }
    }

    async fn get_or_create_connection(
        &self,
        key: &ConnectionKey,
        catalog_item: &McpCatalogItem,
        server: &McpServer,
        transport_kind: TransportKind,
    ) -> Result<Arc<ManagedConnection>, CommonError> {
        // Clone the Arc out before awaiting so we never hold a DashMap shard
        // guard across a suspension point.
        let existing = self.connections.get(key).map(|entry| entry.clone());
        if let Some(conn) = existing {
            if conn.client.ping().await.is_ok() {
                return Ok(conn);
            }
            self.connections.remove(key);
            self.store.delete_mcp_http_session(key.as_str()).await?;
        }

        let lock = self
            .recovery_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Someone else may have won the race and already recreated it.
        if let Some(conn) = self.connections.get(key).map(|entry| entry.clone()) {
            return Ok(conn);
        }

        let client = self
            .build_client(key, catalog_item, server, transport_kind)
            .await?;
        let conn = Arc::new(ManagedConnection::new(
            client,
            transport_kind,
            self.config.http_concurrency_limit,
        ));

        if transport_kind == TransportKind::HttpStreamable {
            if let Some(session_id) = conn.client.session_id() {
                self.store
                    .upsert_mcp_http_session(&shared::domain::McpHttpSession {
                        connection_key: key.as_str().to_string(),
                        session_id,
                        session_endpoint_url: None,
                        session_endpoint_pod_name: None,
                        updated_at: WrappedChronoDateTime::now(),
                    })
                    .await?;
            }
        }

        self.connections.insert(key.clone(), conn.clone());
        Ok(conn)
    }

    async fn build_client(
        &self,
        key: &ConnectionKey,
        catalog_item: &McpCatalogItem,
        server: &McpServer,
        transport_kind: TransportKind,
    ) -> Result<Box<dyn McpClientHandle>, CommonError> {
        match transport_kind {
            TransportKind::Stdio => {
                self.pod_orchestrator
                    .get_or_load_deployment(&server.id)
                    .await?;
                let pod_name = self.pod_orchestrator.get_running_pod(&server.id).await?;
                let attached = self
                    .pod_orchestrator
                    .attach(&pod_name, "mcp-server")
                    .await?;
                let client = tokio::time::timeout(
                    self.config.connect_timeout,
                    Client::connect_stdio(attached),
                )
                .await
                .map_err(|_| CommonError::network_error("mcp stdio connect timed out"))??;
                Ok(Box::new(client))
            }
            TransportKind::HttpStreamable => {
                let url = match catalog_item.server_url.clone() {
                    Some(url) => url,
                    None => self.pod_orchestrator.get_http_endpoint(&server.id).await?,
                };
                let token = self.resolve_bearer_token(server).await?;
                let resume_session_id = self
                    .store
                    .get_mcp_http_session(key.as_str())
                    .await?
                    .map(|session| session.session_id);
                let client = tokio::time::timeout(
                    self.config.connect_timeout,
                    Client::connect_http(&url, token.as_deref(), resume_session_id.as_deref()),
                )
                .await
                .map_err(|_| CommonError::network_error("mcp http connect timed out"))??;
                Ok(Box::new(client))
            }
        }
    }

    async fn resolve_bearer_token(&self, server: &McpServer) -> Result<Option<String>, CommonError> {
        let Some(secret_id) = &server.secret_id else {
            return Ok(None);
        };
        let Some(secret) = self.store.get_secret(secret_id).await? else {
            return Ok(None);
        };
        let resolved = self.secret_store.resolve(&secret.value).await?;
        if resolved.is_empty() {
            Ok(None)
        } else {
            Ok(Some(resolved))
        }
    }
}

/// Placeholder refresher hitting `oauth_config.token_url` with a standard
/// `refresh_token` grant. Swapped out by embedders who need a different
/// token-exchange client.
struct EnvOAuthRefresher;

impl OAuthRefresher for EnvOAuthRefresher {
    async fn refresh(
        &self,
        config: &OAuthConfig,
        refresh_token: &str,
    ) -> Result<oauth::RefreshedToken, CommonError> {
        let client = reqwest::Client::new();
        let response = client
            .post(&config.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &config.client_id),
            ])
            .send()
            .await
            .map_err(|err| CommonError::network_error(format!("oauth refresh request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(CommonError::invalid_request(format!(
                "oauth token endpoint returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| CommonError::network_error(format!("oauth refresh response decode failed: {err}")))?;
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| CommonError::invalid_request("oauth refresh response missing access_token"))?
            .to_string();
        let refresh_token = body
            .get("refresh_token")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(oauth::RefreshedToken {
            access_token,
            refresh_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::Tool as RmcpTool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as SyncMutex;

    #[test]
    fn auth_error_detection_matches_401_and_unauthorized() {
        assert!(looks_like_auth_error(&CommonError::network_error(
            "upstream returned 401"
        )));
        assert!(looks_like_auth_error(&CommonError::network_error(
            "Unauthorized: token expired"
        )));
        assert!(!looks_like_auth_error(&CommonError::network_error(
            "connection refused"
        )));
    }

    struct FakeClient {
        tools: Vec<RmcpTool>,
        calls: SyncMutex<Vec<String>>,
        fail_next: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl McpClientHandle for FakeClient {
        async fn list_tools(&self) -> Result<Vec<RmcpTool>, CommonError> {
            Ok(self.tools.clone())
        }

        async fn call_tool(&self, name: &str, _arguments: Option<Value>) -> Result<Value, CommonError> {
            self.calls.lock().unwrap().push(name.to_string());
            if self.fail_next.swap(0, Ordering::SeqCst) == 1 {
                return Err(CommonError::network_error("upstream returned 401"));
            }
            Ok(serde_json::json!({ "ok": true }))
        }

        async fn ping(&self) -> Result<(), CommonError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), CommonError> {
            Ok(())
        }

        fn session_id(&self) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn unknown_tool_name_passes_through_unchanged_when_upstream_has_no_match() {
        let client = FakeClient {
            tools: vec![],
            calls: SyncMutex::new(vec![]),
            fail_next: AtomicUsize::new(0),
        };
        let conn = Arc::new(ManagedConnection::new(
            Box::new(client),
            TransportKind::HttpStreamable,
            4,
        ));
        let dispatcher = McpDispatcher {
            connections: DashMap::new(),
            recovery_locks: DashMap::new(),
            store: Arc::new(NoopStore),
            secret_store: Arc::new(NoopSecretStore),
            pod_orchestrator: Arc::new(NoopPodOrchestrator),
            config: DispatcherConfig::default(),
        };

        let resolved = dispatcher
            .resolve_tool_name(&conn, "my_search_tool")
            .await
            .unwrap();
        assert_eq!(resolved, "my_search_tool");
    }

    #[tokio::test]
    async fn stdio_connection_gets_a_single_permit() {
        let client = FakeClient {
            tools: vec![],
            calls: SyncMutex::new(vec![]),
            fail_next: AtomicUsize::new(0),
        };
        let conn = ManagedConnection::new(Box::new(client), TransportKind::Stdio, 4);
        assert_eq!(conn.limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn http_connection_gets_the_configured_permit_count() {
        let client = FakeClient {
            tools: vec![],
            calls: SyncMutex::new(vec![]),
            fail_next: AtomicUsize::new(0),
        };
        let conn = ManagedConnection::new(Box::new(client), TransportKind::HttpStreamable, 4);
        assert_eq!(conn.limiter.available_permits(), 4);
    }

    struct NoopStore;
    #[async_trait::async_trait]
    impl Store for NoopStore {
        async fn get_agent(&self, _: &str) -> Result<Option<shared::domain::Agent>, CommonError> { Ok(None) }
        async fn get_conversation(&self, _: &str) -> Result<Option<shared::domain::Conversation>, CommonError> { Ok(None) }
        async fn list_user_team_ids(&self, _: &str) -> Result<Vec<String>, CommonError> { Ok(vec![]) }
        async fn get_team_org_id(&self, _: &str) -> Result<Option<String>, CommonError> { Ok(None) }
        async fn get_chat_api_key(&self, _: &str) -> Result<Option<shared::domain::ChatApiKey>, CommonError> { Ok(None) }
        async fn get_personal_chat_api_key(&self, _: &str, _: &str, _: &str) -> Result<Option<shared::domain::ChatApiKey>, CommonError> { Ok(None) }
        async fn list_team_chat_api_keys(&self, _: &str, _: &str, _: &[String]) -> Result<Vec<shared::domain::ChatApiKey>, CommonError> { Ok(vec![]) }
        async fn get_org_wide_chat_api_key(&self, _: &str, _: &str) -> Result<Option<shared::domain::ChatApiKey>, CommonError> { Ok(None) }
        async fn get_secret(&self, _: &str) -> Result<Option<shared::domain::Secret>, CommonError> { Ok(None) }
        async fn get_mcp_catalog_item(&self, _: &str) -> Result<Option<McpCatalogItem>, CommonError> { Ok(None) }
        async fn get_mcp_server(&self, _: &str) -> Result<Option<McpServer>, CommonError> { Ok(None) }
        async fn list_mcp_servers_owned_by_any(&self, _: &[String]) -> Result<Vec<McpServer>, CommonError> { Ok(vec![]) }
        async fn list_all_mcp_servers(&self, _: &str) -> Result<Vec<McpServer>, CommonError> { Ok(vec![]) }
        async fn get_tool(&self, _: &str) -> Result<Option<Tool>, CommonError> { Ok(None) }
        async fn find_tool_by_name(&self, _: &str, _: &str) -> Result<Option<Tool>, CommonError> { Ok(None) }
        async fn set_mcp_server_oauth_error(&self, _: &str, _: Option<String>, _: Option<WrappedChronoDateTime>) -> Result<(), CommonError> { Ok(()) }
        async fn update_secret_value(&self, _: &str, _: shared::domain::SecretValue) -> Result<(), CommonError> { Ok(()) }
        async fn get_mcp_http_session(&self, _: &str) -> Result<Option<shared::domain::McpHttpSession>, CommonError> { Ok(None) }
        async fn upsert_mcp_http_session(&self, _: &shared::domain::McpHttpSession) -> Result<(), CommonError> { Ok(()) }
        async fn delete_mcp_http_session(&self, _: &str) -> Result<(), CommonError> { Ok(()) }
        async fn append_tool_call_audit(&self, _: &ToolCallAuditEntry) -> Result<(), CommonError> { Ok(()) }
        async fn insert_interaction(&self, _: &shared::domain::Interaction) -> Result<(), CommonError> { Ok(()) }
        async fn list_limits_for_entity(&self, _: shared::domain::LimitEntityType, _: &str) -> Result<Vec<shared::domain::Limit>, CommonError> { Ok(vec![]) }
        async fn get_limit_usage(&self, _: &str) -> Result<(u64, u64), CommonError> { Ok((0, 0)) }
        async fn increment_limit_usage(&self, _: &str, _: u64, _: u64) -> Result<(), CommonError> { Ok(()) }
        async fn reset_due_limits(&self, _: WrappedChronoDateTime) -> Result<u64, CommonError> { Ok(0) }
    }

    struct NoopSecretStore;
    #[async_trait::async_trait]
    impl SecretStore for NoopSecretStore {
        async fn resolve(&self, _: &shared::domain::SecretValue) -> Result<String, CommonError> {
            Ok(String::new())
        }
    }

    struct NoopPodOrchestrator;
    #[async_trait::async_trait]
    impl PodOrchestrator for NoopPodOrchestrator {
        async fn get_or_load_deployment(&self, _: &str) -> Result<(), CommonError> { Ok(()) }
        async fn get_running_pod(&self, _: &str) -> Result<String, CommonError> { Ok("pod".to_string()) }
        async fn attach(&self, _: &str, _: &str) -> Result<shared::store::AttachedProcess, CommonError> {
            Err(CommonError::network_error("not used in this test"))
        }
        async fn get_http_endpoint(&self, _: &str) -> Result<String, CommonError> {
            Ok("http://localhost".to_string())
        }
    }
}
