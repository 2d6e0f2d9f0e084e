//! Credential Resolver (§4.2): the priority-ordered lookup mapping
//! `(tenant, user, teams, agent, conversation, provider)` to a concrete
//! `ChatApiKey`, or an env/placeholder fallback.

use shared::domain::{Agent, ChatApiKey, ChatApiKeyScope, Conversation};
use shared::error::CommonError;
use shared::store::{SecretStore, Store};

use crate::config::Config;
use crate::providers::ProviderId;

pub struct CredentialContext<'a> {
    pub org_id: &'a str,
    pub user_id: Option<&'a str>,
    pub user_team_ids: &'a [String],
    pub provider: ProviderId,
    pub conversation: Option<&'a Conversation>,
    pub agent: &'a Agent,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedCredential {
    pub chat_api_key: Option<ChatApiKey>,
    pub secret_value: Option<String>,
}

impl ResolvedCredential {
    /// Whether this resolution leaves the request usable without a key
    /// (only true for providers that accept a placeholder token, or when a
    /// secret was actually found).
    pub fn is_usable(&self, provider: ProviderId) -> bool {
        self.secret_value.is_some() || provider.allows_placeholder_credential()
    }
}

/// A user has access to `key` iff: it's org-wide, it's a team key for one of
/// the caller's teams, it's their own personal key, or the caller is an
/// admin and the key isn't another user's personal key (§4.2.1).
fn has_access(key: &ChatApiKey, ctx: &CredentialContext<'_>) -> bool {
    if key.scope == ChatApiKeyScope::Personal {
        return key.user_id.as_deref() == ctx.user_id;
    }
    if ctx.is_admin {
        return true;
    }
    match key.scope {
        ChatApiKeyScope::OrgWide => true,
        ChatApiKeyScope::Team => key
            .team_id
            .as_deref()
            .map(|team| ctx.user_team_ids.iter().any(|t| t == team))
            .unwrap_or(false),
        ChatApiKeyScope::Personal => unreachable!("handled above"),
    }
}

async fn finalize(
    store: &dyn Store,
    secret_store: &dyn SecretStore,
    key: ChatApiKey,
) -> Result<ResolvedCredential, CommonError> {
    let secret_value = match &key.secret_id {
        Some(secret_id) => match store.get_secret(secret_id).await? {
            Some(secret) => Some(secret_store.resolve(&secret.value).await?),
            None => None,
        },
        None => None,
    };
    Ok(ResolvedCredential {
        chat_api_key: Some(key),
        secret_value,
    })
}

/// Resolve a credential per the §4.2 priority list. Steps 1-5 consult the
/// `Store`; step 6 falls back to the process config; step 7 is unconfigured.
pub async fn resolve_credential(
    store: &dyn Store,
    secret_store: &dyn SecretStore,
    config: &Config,
    ctx: &CredentialContext<'_>,
) -> Result<ResolvedCredential, CommonError> {
    // 1. conversation-pinned key
    if let Some(conversation) = ctx.conversation {
        if let Some(pinned_id) = &conversation.chat_api_key_id {
            if let Some(key) = store.get_chat_api_key(pinned_id).await? {
                if key.provider == ctx.provider.as_str() {
                    let is_agent_key =
                        ctx.agent.llm_api_key_id.as_deref() == Some(pinned_id.as_str());
                    if is_agent_key || has_access(&key, ctx) {
                        return finalize(store, secret_store, key).await;
                    }
                }
            }
        }
    }

    // 2. agent-configured key, unconditional
    if let Some(agent_key_id) = &ctx.agent.llm_api_key_id {
        if let Some(key) = store.get_chat_api_key(agent_key_id).await? {
            if key.provider == ctx.provider.as_str() {
                return finalize(store, secret_store, key).await;
            }
        }
    }

    // 3. personal key
    if let Some(user_id) = ctx.user_id {
        if let Some(key) = store
            .get_personal_chat_api_key(ctx.org_id, ctx.provider.as_str(), user_id)
            .await?
        {
            if key.secret_id.is_some() {
                return finalize(store, secret_store, key).await;
            }
        }
    }

    // 4. team key, oldest createdAt wins ties
    let mut team_keys = store
        .list_team_chat_api_keys(ctx.org_id, ctx.provider.as_str(), ctx.user_team_ids)
        .await?;
    team_keys.retain(|k| k.secret_id.is_some());
    team_keys.sort_by(|a, b| a.created_at.get_inner().cmp(b.created_at.get_inner()));
    if let Some(key) = team_keys.into_iter().next() {
        return finalize(store, secret_store, key).await;
    }

    // 5. org-wide key
    if let Some(key) = store
        .get_org_wide_chat_api_key(ctx.org_id, ctx.provider.as_str())
        .await?
    {
        if key.secret_id.is_some() {
            return finalize(store, secret_store, key).await;
        }
    }

    // 6. env fallback
    let provider_config = config.provider_config(ctx.provider);
    if let Some(api_key) = provider_config.api_key {
        return Ok(ResolvedCredential {
            chat_api_key: None,
            secret_value: Some(api_key),
        });
    }

    // 7. unconfigured
    Ok(ResolvedCredential::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::primitives::WrappedChronoDateTime;

    fn agent(org_id: &str, llm_api_key_id: Option<&str>) -> Agent {
        Agent {
            id: "agent-1".to_string(),
            org_id: org_id.to_string(),
            teams: vec!["team-1".to_string()],
            llm_api_key_id: llm_api_key_id.map(|s| s.to_string()),
            system_prompt: None,
        }
    }

    fn key(scope: ChatApiKeyScope, user_id: Option<&str>, team_id: Option<&str>) -> ChatApiKey {
        ChatApiKey {
            id: "key-1".to_string(),
            org_id: "org-1".to_string(),
            provider: "openai".to_string(),
            scope,
            user_id: user_id.map(|s| s.to_string()),
            team_id: team_id.map(|s| s.to_string()),
            secret_id: Some("secret-1".to_string()),
            is_system: false,
            created_at: WrappedChronoDateTime::now(),
        }
    }

    #[test]
    fn personal_key_only_visible_to_owner() {
        let a = agent("org-1", None);
        let ctx_owner = CredentialContext {
            org_id: "org-1",
            user_id: Some("user-1"),
            user_team_ids: &[],
            provider: ProviderId::OpenAi,
            conversation: None,
            agent: &a,
            is_admin: false,
        };
        let ctx_admin = CredentialContext {
            user_id: Some("user-2"),
            is_admin: true,
            ..ctx_owner
        };
        let personal = key(ChatApiKeyScope::Personal, Some("user-1"), None);
        assert!(has_access(&personal, &ctx_owner));
        assert!(!has_access(&personal, &ctx_admin));
    }

    #[test]
    fn admin_sees_team_key_outside_own_team() {
        let a = agent("org-1", None);
        let ctx = CredentialContext {
            org_id: "org-1",
            user_id: Some("user-1"),
            user_team_ids: &[],
            provider: ProviderId::OpenAi,
            conversation: None,
            agent: &a,
            is_admin: true,
        };
        let team_key = key(ChatApiKeyScope::Team, None, Some("team-9"));
        assert!(has_access(&team_key, &ctx));
    }

    #[test]
    fn non_admin_without_team_membership_denied() {
        let a = agent("org-1", None);
        let ctx = CredentialContext {
            org_id: "org-1",
            user_id: Some("user-1"),
            user_team_ids: &["team-1".to_string()],
            provider: ProviderId::OpenAi,
            conversation: None,
            agent: &a,
            is_admin: false,
        };
        let team_key = key(ChatApiKeyScope::Team, None, Some("team-9"));
        assert!(!has_access(&team_key, &ctx));
    }
}
