//! The gateway's axum `State` (§4 "Component design", wiring). Mirrors the
//! `*Service` pattern used throughout this workspace (see
//! `identity::service::IdentityService`): one `Params` struct for
//! construction, one `Clone`-able struct holding `Arc`-wrapped collaborators
//! for every handler to share.

use std::sync::Arc;

use shared::error::CommonError;
use shared::identity::{IdentityProvider, TokenAuthContext};
use shared::store::{PodOrchestrator, SecretStore, Store};

use mcp::dispatcher::McpDispatcher;

use crate::config::Config;

/// `shared::identity::IdentityProvider` is a native-`async fn` trait (not
/// object-safe), but the gateway's `State` needs a concrete `Clone + Send +
/// Sync + 'static` struct to hold its collaborators behind `Arc<dyn ...>` —
/// the same shape `mcp::transport::McpClientHandle` solves for the
/// dispatcher's connection pool. This trait is that same dyn-safe wrapper,
/// blanket-implemented over any `IdentityProvider`.
#[async_trait::async_trait]
pub trait IdentityProviderHandle: Send + Sync {
    async fn validate_token(&self, raw_token: &str) -> Result<TokenAuthContext, CommonError>;
}

#[async_trait::async_trait]
impl<T: IdentityProvider + Send + Sync> IdentityProviderHandle for T {
    async fn validate_token(&self, raw_token: &str) -> Result<TokenAuthContext, CommonError> {
        IdentityProvider::validate_token(self, raw_token).await
    }
}

/// Parameters for constructing a GatewayService
pub struct GatewayServiceParams {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub secret_store: Arc<dyn SecretStore>,
    pub pod_orchestrator: Arc<dyn PodOrchestrator>,
    pub identity_provider: Arc<dyn IdentityProviderHandle>,
    pub mcp_dispatcher: Arc<McpDispatcher>,
}

#[derive(Clone)]
pub struct GatewayService {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub secret_store: Arc<dyn SecretStore>,
    pub pod_orchestrator: Arc<dyn PodOrchestrator>,
    pub identity_provider: Arc<dyn IdentityProviderHandle>,
    pub mcp_dispatcher: Arc<McpDispatcher>,
}

impl GatewayService {
    pub fn new(params: GatewayServiceParams) -> Self {
        Self {
            config: params.config,
            store: params.store,
            secret_store: params.secret_store,
            pod_orchestrator: params.pod_orchestrator,
            identity_provider: params.identity_provider,
            mcp_dispatcher: params.mcp_dispatcher,
        }
    }
}
