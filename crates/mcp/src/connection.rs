//! Connection-key grammar and per-client state machine (§4.3).

use shared::error::CommonError;

/// `"{catalogId}:{serverId}[:{agentId}:{conversationId}][:ext:{extIdpUserId}]"`.
/// Identifies one cached MCP client: the optional middle suffix isolates
/// per-conversation browser contexts, the optional trailing suffix isolates
/// per-user JWT propagation for external-IdP callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn build(
        catalog_id: &str,
        server_id: &str,
        conversation_scope: Option<(&str, &str)>,
        ext_idp_user_id: Option<&str>,
    ) -> Self {
        let mut key = format!("{catalog_id}:{server_id}");
        if let Some((agent_id, conversation_id)) = conversation_scope {
            key.push_str(&format!(":{agent_id}:{conversation_id}"));
        }
        if let Some(ext_idp_user_id) = ext_idp_user_id {
            key.push_str(&format!(":ext:{ext_idp_user_id}"));
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse back into its parts; used by tests and by diagnostics that need
    /// the `catalogId`/`serverId` without re-deriving the grammar by hand.
    pub fn parse(raw: &str) -> Result<ParsedConnectionKey, CommonError> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() < 2 {
            return Err(CommonError::invalid_request(format!(
                "malformed connection key: {raw}"
            )));
        }
        let catalog_id = parts[0].to_string();
        let server_id = parts[1].to_string();
        let mut rest = &parts[2..];

        let conversation_scope = if rest.len() >= 2 && rest[0] != "ext" {
            let scope = (rest[0].to_string(), rest[1].to_string());
            rest = &rest[2..];
            Some(scope)
        } else {
            None
        };

        let ext_idp_user_id = if rest.len() >= 2 && rest[0] == "ext" {
            Some(rest[1].to_string())
        } else {
            None
        };

        Ok(ParsedConnectionKey {
            catalog_id,
            server_id,
            conversation_scope,
            ext_idp_user_id,
        })
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedConnectionKey {
    pub catalog_id: String,
    pub server_id: String,
    pub conversation_scope: Option<(String, String)>,
    pub ext_idp_user_id: Option<String>,
}

/// Per-client lifecycle (§4.3 "State machine per client").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    New,
    Connecting,
    Ready,
    InUse,
    Closing,
    Closed,
}

impl ClientState {
    pub fn can_dispatch(self) -> bool {
        matches!(self, ClientState::Ready | ClientState::InUse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_minimal_key() {
        let key = ConnectionKey::build("cat-1", "srv-1", None, None);
        assert_eq!(key.as_str(), "cat-1:srv-1");
    }

    #[test]
    fn builds_conversation_scoped_key() {
        let key = ConnectionKey::build("cat-1", "srv-1", Some(("agent-1", "conv-1")), None);
        assert_eq!(key.as_str(), "cat-1:srv-1:agent-1:conv-1");
    }

    #[test]
    fn builds_fully_scoped_key() {
        let key = ConnectionKey::build("cat-1", "srv-1", Some(("agent-1", "conv-1")), Some("ext-user-9"));
        assert_eq!(key.as_str(), "cat-1:srv-1:agent-1:conv-1:ext:ext-user-9");
    }

    #[test]
    fn round_trips_through_parse() {
        let key = ConnectionKey::build("cat-1", "srv-1", Some(("agent-1", "conv-1")), Some("ext-user-9"));
        let parsed = ConnectionKey::parse(key.as_str()).unwrap();
        assert_eq!(parsed.catalog_id, "cat-1");
        assert_eq!(parsed.server_id, "srv-1");
        assert_eq!(
            parsed.conversation_scope,
            Some(("agent-1".to_string(), "conv-1".to_string()))
        );
        assert_eq!(parsed.ext_idp_user_id, Some("ext-user-9".to_string()));
    }

    #[test]
    fn parses_ext_only_key() {
        let parsed = ConnectionKey::parse("cat-1:srv-1:ext:ext-user-9").unwrap();
        assert_eq!(parsed.conversation_scope, None);
        assert_eq!(parsed.ext_idp_user_id, Some("ext-user-9".to_string()));
    }

    #[test]
    fn rejects_malformed_key() {
        assert!(ConnectionKey::parse("just-one-part").is_err());
    }
}
