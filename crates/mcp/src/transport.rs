//! Client transport layer (§4.3 "Client transport layer (expansion)").
//!
//! Two concrete transport families back a connected client: a stdio
//! transport over a pod-attached child process, and an HTTP streamable
//! transport. Both produce the same `RunningService<RoleClient, ClientInfo>`
//! shape, so [`Client`] wraps either behind one set of methods and the
//! connection pool never has to know which one it's holding.

use reqwest::header::HeaderName;
use rmcp::model::{CallToolRequestParam, ClientCapabilities, ClientInfo, Implementation};
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::ServiceExt;
use serde_json::Value;
use shared::error::CommonError;
use shared::store::AttachedProcess;

/// What the connection pool holds per cached entry.
#[async_trait::async_trait]
pub trait McpClientHandle: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<rmcp::model::Tool>, CommonError>;
    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value, CommonError>;
    async fn ping(&self) -> Result<(), CommonError>;
    async fn close(&self) -> Result<(), CommonError>;
    /// The `Mcp-Session-Id` the server assigned, if the transport is HTTP
    /// streamable and the server supports session resumption.
    fn session_id(&self) -> Option<String>;
}

fn client_info() -> ClientInfo {
    ClientInfo {
        protocol_version: Default::default(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "archestra-gateway".to_string(),
            title: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            website_url: None,
            icons: None,
        },
    }
}

fn map_service_error(operation: &str, err: impl std::fmt::Display) -> CommonError {
    CommonError::network_error(format!("mcp {operation} failed: {err}"))
}

/// A connected MCP peer, stdio or HTTP streamable — same wire protocol,
/// same `rmcp` service type either way.
pub struct Client {
    service: RunningService<RoleClient, ClientInfo>,
    session_id: Option<String>,
}

impl Client {
    /// `attached` is already running, handed to us by
    /// `PodOrchestrator::attach`; we speak JSON-RPC over its stdin/stdout.
    pub async fn connect_stdio(attached: AttachedProcess) -> Result<Self, CommonError> {
        let service = client_info()
            .serve((attached.stdout, attached.stdin))
            .await
            .map_err(|err| map_service_error("stdio connect", err))?;
        Ok(Self {
            service,
            session_id: None,
        })
    }

    /// `bearer_token` carries the already-resolved credential — OAuth access
    /// token or static API key — applied as an `Authorization` header. The
    /// caller handles the refresh-and-retry dance on 401 (§4.3 "Auth error
    /// handling"); this constructor only opens a fresh session.
    ///
    /// `resume_session_id`, if given, is a `Mcp-Session-Id` persisted from an
    /// earlier connection on this same `ConnectionKey` (possibly handled by a
    /// different replica) — sent up front so the server can resume the prior
    /// session instead of minting a new one.
    pub async fn connect_http(
        url: &str,
        bearer_token: Option<&str>,
        resume_session_id: Option<&str>,
    ) -> Result<Self, CommonError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = bearer_token {
            let value = format!("Bearer {token}");
            headers.insert(
                reqwest::header::AUTHORIZATION,
                reqwest::header::HeaderValue::from_str(&value)
                    .map_err(|err| CommonError::invalid_request(format!("bad bearer token: {err}")))?,
            );
        }
        if let Some(session_id) = resume_session_id {
            headers.insert(
                HeaderName::from_static("mcp-session-id"),
                reqwest::header::HeaderValue::from_str(session_id)
                    .map_err(|err| CommonError::invalid_request(format!("bad session id: {err}")))?,
            );
        }
        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| map_service_error("http client build", err))?;
        let transport = StreamableHttpClientTransport::with_client(
            http_client,
            StreamableHttpClientTransportConfig::with_uri(url.to_string()),
        );
        // Cheap, `Arc`-backed handle kept alive past `serve()` consuming
        // `transport` — the transport learns the server-assigned session id
        // during the initialize handshake and stores it behind this handle.
        let session_handle = transport.clone();
        let service = client_info()
            .serve(transport)
            .await
            .map_err(|err| map_service_error("http connect", err))?;
        let session_id = session_handle
            .session_id()
            .map(|id| id.to_string())
            .or_else(|| resume_session_id.map(str::to_string));
        Ok(Self {
            service,
            session_id,
        })
    }
}

#[async_trait::async_trait]
impl McpClientHandle for Client {
    async fn list_tools(&self) -> Result<Vec<rmcp::model::Tool>, CommonError> {
        let result = self
            .service
            .list_tools(Default::default())
            .await
            .map_err(|err| map_service_error("list_tools", err))?;
        Ok(result.tools)
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value, CommonError> {
        let result = self
            .service
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: arguments.and_then(|v| v.as_object().cloned()),
            })
            .await
            .map_err(|err| map_service_error("call_tool", err))?;
        serde_json::to_value(&result).map_err(CommonError::from)
    }

    async fn ping(&self) -> Result<(), CommonError> {
        self.service
            .ping()
            .await
            .map_err(|err| map_service_error("ping", err))
    }

    async fn close(&self) -> Result<(), CommonError> {
        self.service
            .cancel()
            .await
            .map_err(|err| map_service_error("close", err))?;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }
}
