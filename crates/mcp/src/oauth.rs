//! OAuth refresh-and-retry-exactly-once (§4.3 "Auth error handling").

use shared::domain::{McpServer, OAuthConfig, SecretValue};
use shared::error::CommonError;
use shared::primitives::WrappedChronoDateTime;
use shared::store::{SecretStore, Store};

/// Outcome of one refresh attempt, mapped directly onto the `McpServer`
/// row's latched `oauthRefreshError` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Refresh succeeded; `new_secret_id` already persisted via `Store`.
    Refreshed,
    /// The server has no refresh token on file; refresh was never attempted.
    NoRefreshToken,
    /// Refresh was attempted and failed.
    Failed,
}

/// A minimal OAuth token-refresh client. Grounded on the same shape as
/// [`shared::identity::IdentityProvider`] — a single async collaborator
/// method, no dyn dispatch required since callers always hold it generically.
#[allow(async_fn_in_trait)]
pub trait OAuthRefresher {
    /// Exchange a refresh token for a fresh access token (and, if rotated, a
    /// fresh refresh token) against `config.token_url`.
    async fn refresh(
        &self,
        config: &OAuthConfig,
        refresh_token: &str,
    ) -> Result<RefreshedToken, CommonError>;
}

#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Refresh the token backing `server`'s secret and persist the result,
/// latching `oauthRefreshError`/`oauthRefreshFailedAt` on failure (§4.3).
/// On success, the new access token (plus, if rotated, refresh token) is
/// written back through `SecretStore`/`Store` *before* the caller retries the
/// call, so a crash between refresh and retry never loses the new token.
pub async fn refresh_and_persist<R: OAuthRefresher>(
    store: &dyn Store,
    secret_store: &dyn SecretStore,
    refresher: &R,
    server: &McpServer,
    oauth_config: &OAuthConfig,
) -> Result<RefreshOutcome, CommonError> {
    let Some(secret_id) = &server.secret_id else {
        return Ok(RefreshOutcome::NoRefreshToken);
    };
    let Some(secret) = store.get_secret(secret_id).await? else {
        return Ok(RefreshOutcome::NoRefreshToken);
    };
    let refresh_token = secret_store.resolve(&secret.value).await?;
    if refresh_token.is_empty() {
        store
            .set_mcp_server_oauth_error(
                &server.id,
                Some("no_refresh_token".to_string()),
                None,
            )
            .await?;
        return Ok(RefreshOutcome::NoRefreshToken);
    }

    match refresher.refresh(oauth_config, &refresh_token).await {
        Ok(refreshed) => {
            // Only the providers that rotate refresh tokens on every use hand
            // back a new one here — most don't, and the existing refresh
            // token is still valid for the next refresh. Overwriting it with
            // the access token in that case would corrupt the secret: the
            // next refresh attempt would submit an access token as a refresh
            // token and fail.
            if let Some(new_refresh_token) = refreshed.refresh_token {
                let new_value = SecretValue::Plain {
                    value: new_refresh_token,
                };
                store.update_secret_value(secret_id, new_value).await?;
            }
            store
                .set_mcp_server_oauth_error(&server.id, None, None)
                .await?;
            Ok(RefreshOutcome::Refreshed)
        }
        Err(err) => {
            tracing::warn!(server_id = %server.id, error = %err, "oauth refresh failed");
            store
                .set_mcp_server_oauth_error(
                    &server.id,
                    Some("refresh_failed".to_string()),
                    Some(WrappedChronoDateTime::now()),
                )
                .await?;
            Ok(RefreshOutcome::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::error::CommonError;
    use std::sync::Mutex;

    struct FakeStore {
        secret: Option<shared::domain::Secret>,
        set_oauth_error_calls: Mutex<Vec<Option<String>>>,
        update_secret_calls: Mutex<Vec<SecretValue>>,
    }

    #[async_trait::async_trait]
    impl Store for FakeStore {
        async fn get_agent(&self, _: &str) -> Result<Option<shared::domain::Agent>, CommonError> { Ok(None) }
        async fn get_conversation(&self, _: &str) -> Result<Option<shared::domain::Conversation>, CommonError> { Ok(None) }
        async fn list_user_team_ids(&self, _: &str) -> Result<Vec<String>, CommonError> { Ok(vec![]) }
        async fn get_team_org_id(&self, _: &str) -> Result<Option<String>, CommonError> { Ok(None) }
        async fn get_chat_api_key(&self, _: &str) -> Result<Option<shared::domain::ChatApiKey>, CommonError> { Ok(None) }
        async fn get_personal_chat_api_key(&self, _: &str, _: &str, _: &str) -> Result<Option<shared::domain::ChatApiKey>, CommonError> { Ok(None) }
        async fn list_team_chat_api_keys(&self, _: &str, _: &str, _: &[String]) -> Result<Vec<shared::domain::ChatApiKey>, CommonError> { Ok(vec![]) }
        async fn get_org_wide_chat_api_key(&self, _: &str, _: &str) -> Result<Option<shared::domain::ChatApiKey>, CommonError> { Ok(None) }
        async fn get_secret(&self, _: &str) -> Result<Option<shared::domain::Secret>, CommonError> { Ok(self.secret.clone()) }
        async fn get_mcp_catalog_item(&self, _: &str) -> Result<Option<shared::domain::McpCatalogItem>, CommonError> { Ok(None) }
        async fn get_mcp_server(&self, _: &str) -> Result<Option<McpServer>, CommonError> { Ok(None) }
        async fn list_mcp_servers_owned_by_any(&self, _: &[String]) -> Result<Vec<McpServer>, CommonError> { Ok(vec![]) }
        async fn list_all_mcp_servers(&self, _: &str) -> Result<Vec<McpServer>, CommonError> { Ok(vec![]) }
        async fn get_tool(&self, _: &str) -> Result<Option<shared::domain::Tool>, CommonError> { Ok(None) }
        async fn find_tool_by_name(&self, _: &str, _: &str) -> Result<Option<shared::domain::Tool>, CommonError> { Ok(None) }
        async fn set_mcp_server_oauth_error(&self, _: &str, error: Option<String>, _: Option<WrappedChronoDateTime>) -> Result<(), CommonError> {
            self.set_oauth_error_calls.lock().unwrap().push(error);
            Ok(())
        }
        async fn update_secret_value(&self, _: &str, new_value: SecretValue) -> Result<(), CommonError> {
            self.update_secret_calls.lock().unwrap().push(new_value);
            Ok(())
        }
        async fn get_mcp_http_session(&self, _: &str) -> Result<Option<shared::domain::McpHttpSession>, CommonError> { Ok(None) }
        async fn upsert_mcp_http_session(&self, _: &shared::domain::McpHttpSession) -> Result<(), CommonError> { Ok(()) }
        async fn delete_mcp_http_session(&self, _: &str) -> Result<(), CommonError> { Ok(()) }
        async fn append_tool_call_audit(&self, _: &shared::domain::ToolCallAuditEntry) -> Result<(), CommonError> { Ok(()) }
        async fn insert_interaction(&self, _: &shared::domain::Interaction) -> Result<(), CommonError> { Ok(()) }
        async fn list_limits_for_entity(&self, _: shared::domain::LimitEntityType, _: &str) -> Result<Vec<shared::domain::Limit>, CommonError> { Ok(vec![]) }
        async fn get_limit_usage(&self, _: &str) -> Result<(u64, u64), CommonError> { Ok((0, 0)) }
        async fn increment_limit_usage(&self, _: &str, _: u64, _: u64) -> Result<(), CommonError> { Ok(()) }
        async fn reset_due_limits(&self, _: WrappedChronoDateTime) -> Result<u64, CommonError> { Ok(0) }
    }

    struct FakeSecretStore;
    #[async_trait::async_trait]
    impl SecretStore for FakeSecretStore {
        async fn resolve(&self, value: &SecretValue) -> Result<String, CommonError> {
            match value {
                SecretValue::Plain { value } => Ok(value.clone()),
                SecretValue::VaultRef { .. } => Ok("resolved-refresh-token".to_string()),
            }
        }
    }

    struct AlwaysSucceeds;
    impl OAuthRefresher for AlwaysSucceeds {
        async fn refresh(&self, _: &OAuthConfig, _: &str) -> Result<RefreshedToken, CommonError> {
            Ok(RefreshedToken { access_token: "new-access".to_string(), refresh_token: Some("new-refresh".to_string()) })
        }
    }

    struct SucceedsWithoutRotating;
    impl OAuthRefresher for SucceedsWithoutRotating {
        async fn refresh(&self, _: &OAuthConfig, _: &str) -> Result<RefreshedToken, CommonError> {
            Ok(RefreshedToken { access_token: "new-access".to_string(), refresh_token: None })
        }
    }

    struct AlwaysFails;
    impl OAuthRefresher for AlwaysFails {
        async fn refresh(&self, _: &OAuthConfig, _: &str) -> Result<RefreshedToken, CommonError> {
            Err(CommonError::invalid_request("token endpoint rejected refresh"))
        }
    }

    fn server() -> McpServer {
        McpServer {
            id: "srv-1".to_string(),
            catalog_id: "cat-1".to_string(),
            owner_id: None,
            team_id: None,
            secret_id: Some("secret-1".to_string()),
            oauth_refresh_error: None,
            oauth_refresh_failed_at: None,
        }
    }

    fn oauth_config() -> OAuthConfig {
        OAuthConfig {
            authorize_url: "https://example.com/authorize".to_string(),
            token_url: "https://example.com/token".to_string(),
            client_id: "client-1".to_string(),
            scopes: vec![],
        }
    }

    #[tokio::test]
    async fn successful_refresh_clears_error_and_persists_new_secret() {
        let store = FakeStore {
            secret: Some(shared::domain::Secret { id: "secret-1".to_string(), value: SecretValue::Plain { value: "old-refresh".to_string() } }),
            set_oauth_error_calls: Mutex::new(vec![]),
            update_secret_calls: Mutex::new(vec![]),
        };
        let outcome = refresh_and_persist(&store, &FakeSecretStore, &AlwaysSucceeds, &server(), &oauth_config()).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert_eq!(store.set_oauth_error_calls.lock().unwrap().as_slice(), &[None]);
        assert_eq!(store.update_secret_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refresh_without_rotation_leaves_the_stored_refresh_token_untouched() {
        let store = FakeStore {
            secret: Some(shared::domain::Secret { id: "secret-1".to_string(), value: SecretValue::Plain { value: "old-refresh".to_string() } }),
            set_oauth_error_calls: Mutex::new(vec![]),
            update_secret_calls: Mutex::new(vec![]),
        };
        let outcome = refresh_and_persist(&store, &FakeSecretStore, &SucceedsWithoutRotating, &server(), &oauth_config()).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert_eq!(store.set_oauth_error_calls.lock().unwrap().as_slice(), &[None]);
        assert!(
            store.update_secret_calls.lock().unwrap().is_empty(),
            "no refresh token rotation means no write to the secret slot"
        );
    }

    #[tokio::test]
    async fn failed_refresh_latches_error() {
        let store = FakeStore {
            secret: Some(shared::domain::Secret { id: "secret-1".to_string(), value: SecretValue::Plain { value: "old-refresh".to_string() } }),
            set_oauth_error_calls: Mutex::new(vec![]),
            update_secret_calls: Mutex::new(vec![]),
        };
        let outcome = refresh_and_persist(&store, &FakeSecretStore, &AlwaysFails, &server(), &oauth_config()).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Failed);
        assert_eq!(store.set_oauth_error_calls.lock().unwrap().as_slice(), &[Some("refresh_failed".to_string())]);
    }

    #[tokio::test]
    async fn no_secret_on_file_skips_refresh_attempt() {
        let store = FakeStore {
            secret: None,
            set_oauth_error_calls: Mutex::new(vec![]),
            update_secret_calls: Mutex::new(vec![]),
        };
        let outcome = refresh_and_persist(&store, &FakeSecretStore, &AlwaysSucceeds, &server(), &oauth_config()).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::NoRefreshToken);
    }
}
