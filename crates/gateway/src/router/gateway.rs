//! HTTP ingress (§4.1 "HTTP ingress wiring", §6 "External interfaces"):
//! the ten provider routes, the MCP tool-call ingress, and process
//! health/readiness, all mounted on one `axum::Router` built the way
//! `identity::router` and `soma::router::mcp` build theirs —
//! `utoipa_axum::OpenApiRouter` per handler, merged under one CORS layer.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use http::{HeaderMap, HeaderName};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use utoipa::ToSchema;
use utoipa::openapi::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use mcp::dispatcher::ToolCallContext;
use shared::adapters::openapi::{API_VERSION_TAG, JsonResponse};
use shared::domain::{Agent, Interaction, InteractionType, ModelPrice};
use shared::error::CommonError;
use shared::identity::TokenAuthContext;
use shared::primitives::WrappedChronoDateTime;
use shared::store::Store;

use crate::logic::credential_resolver::{CredentialContext, resolve_credential};
use crate::logic::retry::retry_idempotent;
use crate::logic::usage::{check_admission, record_interaction};
use crate::providers::{
    ChatRequest, ChatResponse, ProviderId, ResolvedCredential, TokenUsage, build_adapter,
};
use crate::service::GatewayService;

pub const PATH_PREFIX: &str = "/v1";
pub const SERVICE_ROUTE_KEY: &str = "gateway";

pub fn create_router() -> OpenApiRouter<GatewayService> {
    OpenApiRouter::new()
        .routes(routes!(chat_completion))
        .routes(routes!(chat_stream))
        .routes(routes!(chat_structured))
        .routes(routes!(call_tool))
        .routes(routes!(healthz))
        .routes(routes!(readyz))
}

/// CORS the way `soma::server` configures it, minus the Vite-dev-server
/// concerns that don't apply to this process: any origin/method/header,
/// exposing the MCP streamable-HTTP session headers so a browser-hosted
/// caller can read them back.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(AllowMethods::any())
        .allow_headers(AllowHeaders::any())
        .expose_headers([
            HeaderName::from_static("mcp-session-id"),
            HeaderName::from_static("mcp-protocol-version"),
        ])
}

/// Mount every gateway route on one concrete `axum::Router`, CORS applied.
/// This is what the bootstrap binary hands to `axum_server::bind(...)`.
pub fn gateway_router(service: GatewayService) -> Router {
    let (router, _) = create_router().split_for_parts();
    router.with_state(service).layer(cors_layer())
}

pub fn generate_openapi_spec() -> OpenApi {
    let (_, spec) = create_router().split_for_parts();
    spec
}

fn parse_provider(raw: &str) -> Result<ProviderId, CommonError> {
    ProviderId::parse(raw).ok_or_else(|| CommonError::invalid_request(format!("unknown provider '{raw}'")))
}

/// `X-Archestra-*` context-propagation headers and the `X-Archestra-Meta`
/// composite shortcut (§6): `externalAgentId/executionId/sessionId`.
/// Individual headers win on conflict. These fields are request-scoped
/// bookkeeping only — never used for authorization, which always comes from
/// the validated [`TokenAuthContext`].
#[derive(Debug, Clone, Default)]
struct RequestContext {
    external_agent_id: Option<String>,
    execution_id: Option<String>,
    session_id: Option<String>,
    context_user_id: Option<String>,
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn parse_request_context(headers: &HeaderMap) -> RequestContext {
    let mut ctx = RequestContext::default();
    if let Some(meta) = header_str(headers, "X-Archestra-Meta") {
        let mut parts = meta.splitn(3, '/');
        ctx.external_agent_id = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        ctx.execution_id = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        ctx.session_id = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    }
    if let Some(v) = header_str(headers, "X-Archestra-Agent-Id") {
        ctx.external_agent_id = Some(v);
    }
    if let Some(v) = header_str(headers, "X-Archestra-Execution-Id") {
        ctx.execution_id = Some(v);
    }
    if let Some(v) = header_str(headers, "X-Archestra-Session-Id") {
        ctx.session_id = Some(v);
    }
    if let Some(v) = header_str(headers, "X-Archestra-User-Id") {
        ctx.context_user_id = Some(v);
    }
    ctx
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, CommonError> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .ok_or_else(|| CommonError::Authentication {
            msg: "missing or malformed Authorization header".to_string(),
            source: None,
        })
}

async fn authenticate(
    service: &GatewayService,
    headers: &HeaderMap,
) -> Result<TokenAuthContext, CommonError> {
    let token = bearer_token(headers)?;
    service.identity_provider.validate_token(token).await
}

async fn load_agent_and_teams(
    service: &GatewayService,
    agent_id: &str,
    auth: &TokenAuthContext,
) -> Result<(Agent, Vec<String>), CommonError> {
    let agent = service
        .store
        .get_agent(agent_id)
        .await?
        .ok_or_else(|| CommonError::not_found("agent not found", agent_id.to_string()))?;
    let user_team_ids = match &auth.team_ids {
        Some(teams) => teams.clone(),
        None => match &auth.user_id {
            Some(user_id) => service.store.list_user_team_ids(user_id).await?,
            None => Vec::new(),
        },
    };
    Ok((agent, user_team_ids))
}

/// `TokenAuthContext` carries no role field, so the closest grounded analog
/// to §4.2.1's "admin" for credential visibility is an org-wide token: it
/// already asserts organization-level authority, the same trust boundary an
/// admin crosses to see every key rather than only their own personal one.
fn is_admin(auth: &TokenAuthContext) -> bool {
    auth.is_org_token
}

async fn resolve_provider_credential(
    service: &GatewayService,
    provider: ProviderId,
    auth: &TokenAuthContext,
    agent: &Agent,
    user_team_ids: &[String],
) -> Result<ResolvedCredential, CommonError> {
    let ctx = CredentialContext {
        org_id: &auth.org_id,
        user_id: auth.user_id.as_deref(),
        user_team_ids,
        provider,
        conversation: None,
        agent,
        is_admin: is_admin(auth),
    };
    let resolution = resolve_credential(
        service.store.as_ref(),
        service.secret_store.as_ref(),
        &service.config,
        &ctx,
    )
    .await?;
    if !resolution.is_usable(provider) {
        return Err(CommonError::misconfigured(format!(
            "no usable credential configured for provider '{}'",
            provider.as_str()
        )));
    }
    Ok(ResolvedCredential {
        api_key: resolution.secret_value,
        base_url: service.config.provider_config(provider).base_url,
    })
}

async fn admit_or_deny(service: &GatewayService, agent: &Agent, model: &str) -> Result<(), CommonError> {
    let decision = check_admission(
        service.store.as_ref(),
        service.config.model_price(model),
        agent,
        model,
    )
    .await?;
    if decision.admitted {
        return Ok(());
    }
    Err(CommonError::rate_limit(format!(
        "usage limit exceeded at {:?} for model '{model}'",
        decision.denied_at
    )))
}

#[allow(clippy::too_many_arguments)]
fn build_interaction(
    agent: &Agent,
    provider: ProviderId,
    model: &str,
    usage: &TokenUsage,
    raw: serde_json::Value,
    request_body: serde_json::Value,
    auth: &TokenAuthContext,
    request_ctx: &RequestContext,
    model_price: Option<&ModelPrice>,
) -> Interaction {
    let user_id = request_ctx
        .context_user_id
        .clone()
        .or_else(|| auth.user_id.clone());
    Interaction {
        id: uuid::Uuid::new_v4().to_string(),
        agent_id: agent.id.clone(),
        org_id: Some(agent.org_id.clone()),
        user_id,
        session_id: request_ctx.session_id.clone(),
        external_agent_id: request_ctx.external_agent_id.clone(),
        request: request_body,
        response: raw,
        model: model.to_string(),
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cost: model_price.map(|p| p.cost(usage.input_tokens, usage.output_tokens)),
        interaction_type: InteractionType::new(provider.as_str(), "chat"),
        created_at: WrappedChronoDateTime::now(),
    }
}

#[utoipa::path(
    post,
    path = format!("{PATH_PREFIX}/{{provider}}/{{agent_id}}"),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    params(
        ("provider" = String, Path, description = "Provider id, e.g. openai, anthropic, bedrock"),
        ("agent_id" = String, Path, description = "Agent id"),
    ),
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Unary chat completion", body = ChatResponse),
        (status = 400, description = "Invalid request", body = CommonError),
        (status = 401, description = "Authentication error", body = CommonError),
        (status = 429, description = "Usage limit exceeded", body = CommonError),
        (status = 500, description = "Internal server error", body = CommonError),
    ),
    operation_id = "chat-completion",
)]
async fn chat_completion(
    State(service): State<GatewayService>,
    Path((provider, agent_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> JsonResponse<ChatResponse, CommonError> {
    chat_completion_inner(service, provider, agent_id, headers, req)
        .await
        .into()
}

async fn chat_completion_inner(
    service: GatewayService,
    provider: String,
    agent_id: String,
    headers: HeaderMap,
    req: ChatRequest,
) -> Result<ChatResponse, CommonError> {
    let provider = parse_provider(&provider)?;
    let auth = authenticate(&service, &headers).await?;
    let request_ctx = parse_request_context(&headers);
    let (agent, user_team_ids) = load_agent_and_teams(&service, &agent_id, &auth).await?;
    admit_or_deny(&service, &agent, &req.model).await?;

    let credential = resolve_provider_credential(&service, provider, &auth, &agent, &user_team_ids).await?;
    let adapter = build_adapter(provider, &service.config);
    let policy = service.config.retry_policy;
    let request_body_json = serde_json::to_value(&req).unwrap_or(serde_json::Value::Null);
    let response = retry_idempotent(&policy, || adapter.chat(&req, &credential)).await?;

    let interaction = build_interaction(
        &agent,
        provider,
        &req.model,
        &response.usage,
        response.raw.clone(),
        request_body_json,
        &auth,
        &request_ctx,
        service.config.model_price(&req.model),
    );
    record_interaction(service.store.as_ref(), &interaction, &agent).await?;

    Ok(response)
}

#[utoipa::path(
    post,
    path = format!("{PATH_PREFIX}/{{provider}}/{{agent_id}}/stream"),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    params(
        ("provider" = String, Path, description = "Provider id, e.g. openai, anthropic, bedrock"),
        ("agent_id" = String, Path, description = "Agent id"),
    ),
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Streamed chat completion (server-sent events)"),
        (status = 400, description = "Invalid request", body = CommonError),
        (status = 401, description = "Authentication error", body = CommonError),
        (status = 429, description = "Usage limit exceeded", body = CommonError),
    ),
    operation_id = "chat-completion-stream",
)]
async fn chat_stream(
    State(service): State<GatewayService>,
    Path((provider, agent_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, CommonError> {
    let provider = parse_provider(&provider)?;
    let auth = authenticate(&service, &headers).await?;
    let request_ctx = parse_request_context(&headers);
    let (agent, user_team_ids) = load_agent_and_teams(&service, &agent_id, &auth).await?;
    admit_or_deny(&service, &agent, &req.model).await?;

    let credential = resolve_provider_credential(&service, provider, &auth, &agent, &user_team_ids).await?;
    let adapter = build_adapter(provider, &service.config);
    let mut upstream = adapter.stream(&req, &credential).await?;

    let store = service.store.clone();
    let model = req.model.clone();
    let model_price = service.config.model_price(&model).cloned();
    let request_body_json = serde_json::to_value(&req).unwrap_or(serde_json::Value::Null);

    let sse_stream = async_stream::stream! {
        let mut usage = TokenUsage::default();
        let mut raw = serde_json::Value::Null;
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(chunk) => {
                    if let Some(chunk_usage) = &chunk.usage {
                        usage = chunk_usage.clone();
                    }
                    raw = chunk.raw.clone();
                    let is_final = chunk.is_final;
                    let payload = serde_json::to_string(&chunk).unwrap_or_default();
                    yield Ok(Event::default().event("chunk").data(payload));
                    if is_final {
                        break;
                    }
                }
                Err(err) => {
                    let payload = serde_json::to_string(&err.to_chat_error_response()).unwrap_or_default();
                    yield Ok(Event::default().event("error").data(payload));
                    return;
                }
            }
        }

        let interaction = build_interaction(
            &agent,
            provider,
            &model,
            &usage,
            raw,
            request_body_json,
            &auth,
            &request_ctx,
            model_price.as_ref(),
        );
        if let Err(err) = record_interaction(store.as_ref(), &interaction, &agent).await {
            tracing::warn!(error = %err, "failed to record streamed interaction");
        }
    };

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ChatWithSchemaRequest {
    pub request: ChatRequest,
    pub schema: serde_json::Value,
}

#[utoipa::path(
    post,
    path = format!("{PATH_PREFIX}/{{provider}}/{{agent_id}}/structured"),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    params(
        ("provider" = String, Path, description = "Provider id, e.g. openai, anthropic, bedrock"),
        ("agent_id" = String, Path, description = "Agent id"),
    ),
    request_body = ChatWithSchemaRequest,
    responses(
        (status = 200, description = "Schema-validated chat completion"),
        (status = 400, description = "Invalid request", body = CommonError),
        (status = 401, description = "Authentication error", body = CommonError),
        (status = 429, description = "Usage limit exceeded", body = CommonError),
        (status = 500, description = "Internal server error", body = CommonError),
    ),
    operation_id = "chat-completion-structured",
)]
async fn chat_structured(
    State(service): State<GatewayService>,
    Path((provider, agent_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<ChatWithSchemaRequest>,
) -> JsonResponse<serde_json::Value, CommonError> {
    chat_structured_inner(service, provider, agent_id, headers, body)
        .await
        .into()
}

async fn chat_structured_inner(
    service: GatewayService,
    provider: String,
    agent_id: String,
    headers: HeaderMap,
    body: ChatWithSchemaRequest,
) -> Result<serde_json::Value, CommonError> {
    let provider = parse_provider(&provider)?;
    let auth = authenticate(&service, &headers).await?;
    let request_ctx = parse_request_context(&headers);
    let (agent, user_team_ids) = load_agent_and_teams(&service, &agent_id, &auth).await?;
    admit_or_deny(&service, &agent, &body.request.model).await?;

    let credential = resolve_provider_credential(&service, provider, &auth, &agent, &user_team_ids).await?;
    let adapter = build_adapter(provider, &service.config);
    let request_body_json = serde_json::to_value(&body.request).unwrap_or(serde_json::Value::Null);
    let value = adapter
        .chat_with_schema(&body.request, &body.schema, &credential)
        .await?;

    // The structured-output fallback surfaces no token usage; the
    // interaction is still recorded for auditability, at zero cost.
    let interaction = build_interaction(
        &agent,
        provider,
        &body.request.model,
        &TokenUsage::default(),
        value.clone(),
        request_body_json,
        &auth,
        &request_ctx,
        service.config.model_price(&body.request.model),
    );
    record_interaction(service.store.as_ref(), &interaction, &agent).await?;

    Ok(value)
}

#[derive(Debug, Clone, Deserialize, ToSchema, JsonSchema)]
pub struct CallToolRequest {
    pub agent_id: String,
    pub conversation_id: Option<String>,
    pub arguments: Option<serde_json::Value>,
}

#[utoipa::path(
    post,
    path = format!("{PATH_PREFIX}/tools/{{tool_id}}/call"),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    params(
        ("tool_id" = String, Path, description = "Tool id"),
    ),
    request_body = CallToolRequest,
    responses(
        (status = 200, description = "Tool call result"),
        (status = 400, description = "Invalid request", body = CommonError),
        (status = 401, description = "Authentication error", body = CommonError),
        (status = 404, description = "Tool not found", body = CommonError),
        (status = 500, description = "Internal server error", body = CommonError),
    ),
    operation_id = "call-tool",
)]
async fn call_tool(
    State(service): State<GatewayService>,
    Path(tool_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CallToolRequest>,
) -> JsonResponse<serde_json::Value, CommonError> {
    call_tool_inner(service, tool_id, headers, body).await.into()
}

async fn call_tool_inner(
    service: GatewayService,
    tool_id: String,
    headers: HeaderMap,
    body: CallToolRequest,
) -> Result<serde_json::Value, CommonError> {
    let auth = authenticate(&service, &headers).await?;
    let request_ctx = parse_request_context(&headers);

    let tool = service
        .store
        .get_tool(&tool_id)
        .await?
        .ok_or_else(|| CommonError::not_found("tool not found", tool_id.clone()))?;
    let catalog_id = tool
        .catalog_id
        .clone()
        .ok_or_else(|| CommonError::misconfigured(format!("tool '{tool_id}' has no catalog item")))?;
    let catalog_item = service
        .store
        .get_mcp_catalog_item(&catalog_id)
        .await?
        .ok_or_else(|| CommonError::not_found("mcp catalog item not found", catalog_id.clone()))?;

    let user_team_ids = match auth.team_ids.clone() {
        Some(teams) => teams,
        None => match &auth.user_id {
            Some(user_id) => service.store.list_user_team_ids(user_id).await?,
            None => Vec::new(),
        },
    };

    let conversation_scope = body
        .conversation_id
        .as_ref()
        .map(|conversation_id| (body.agent_id.clone(), conversation_id.clone()));

    let auth_method = Some(
        if auth.is_org_token {
            "org_token"
        } else {
            "user_token"
        }
        .to_string(),
    );

    let ctx = ToolCallContext {
        agent_id: body.agent_id,
        conversation_scope,
        ext_idp_user_id: if auth.is_external_idp {
            auth.user_id.clone()
        } else {
            None
        },
        user_id: request_ctx.context_user_id.clone().or_else(|| auth.user_id.clone()),
        user_team_ids,
        auth: &auth,
        auth_method,
        tool: &tool,
        catalog_item: &catalog_item,
        arguments: body.arguments,
    };

    service.mcp_dispatcher.call_tool(ctx).await
}

#[utoipa::path(
    get,
    path = format!("{PATH_PREFIX}/healthz"),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    responses((status = 200, description = "Process is alive")),
    operation_id = "healthz",
)]
async fn healthz() -> &'static str {
    "ok"
}

#[utoipa::path(
    get,
    path = format!("{PATH_PREFIX}/readyz"),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    responses(
        (status = 200, description = "Process is ready to serve traffic"),
        (status = 500, description = "Dependency check failed", body = CommonError),
    ),
    operation_id = "readyz",
)]
async fn readyz(State(service): State<GatewayService>) -> Result<&'static str, CommonError> {
    service.store.get_agent("__readyz_probe__").await?;
    Ok("ready")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                HeaderName::try_from(*name).unwrap(),
                http::HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    // Seed scenario 6: `X-Archestra-Meta` populates all three fields when no
    // individual headers are present.
    #[test]
    fn request_context_from_meta_composite_only() {
        let ctx = parse_request_context(&headers(&[(
            "X-Archestra-Meta",
            "agent-A/exec-1/sess-1",
        )]));
        assert_eq!(ctx.external_agent_id.as_deref(), Some("agent-A"));
        assert_eq!(ctx.execution_id.as_deref(), Some("exec-1"));
        assert_eq!(ctx.session_id.as_deref(), Some("sess-1"));
    }

    // Seed scenario 6: an individual header overrides its counterpart field
    // from `X-Archestra-Meta`, leaving the other two untouched.
    #[test]
    fn request_context_individual_header_overrides_meta() {
        let ctx = parse_request_context(&headers(&[
            ("X-Archestra-Meta", "agent-A/exec-1/sess-1"),
            ("X-Archestra-Session-Id", "sess-2"),
        ]));
        assert_eq!(ctx.external_agent_id.as_deref(), Some("agent-A"));
        assert_eq!(ctx.execution_id.as_deref(), Some("exec-1"));
        assert_eq!(ctx.session_id.as_deref(), Some("sess-2"));
    }

    #[test]
    fn request_context_empty_without_headers() {
        let ctx = parse_request_context(&headers(&[]));
        assert!(ctx.external_agent_id.is_none());
        assert!(ctx.execution_id.is_none());
        assert!(ctx.session_id.is_none());
        assert!(ctx.context_user_id.is_none());
    }

    #[test]
    fn bearer_token_requires_prefix() {
        let ok = headers(&[("authorization", "Bearer abc123")]);
        assert_eq!(bearer_token(&ok).unwrap(), "abc123");

        let missing = headers(&[]);
        assert!(bearer_token(&missing).is_err());

        let malformed = headers(&[("authorization", "Basic abc123")]);
        assert!(bearer_token(&malformed).is_err());
    }

    #[test]
    fn is_admin_follows_org_token_flag() {
        let org_auth = TokenAuthContext {
            token_id: "t1".to_string(),
            user_id: Some("u1".to_string()),
            org_id: "org1".to_string(),
            team_ids: None,
            is_org_token: true,
            is_external_idp: false,
            raw_token: None,
        };
        assert!(is_admin(&org_auth));

        let user_auth = TokenAuthContext {
            is_org_token: false,
            ..org_auth
        };
        assert!(!is_admin(&user_auth));
    }

    #[test]
    fn parse_provider_rejects_unknown() {
        assert!(parse_provider("openai").is_ok());
        assert!(parse_provider("not-a-real-provider").is_err());
    }
}
