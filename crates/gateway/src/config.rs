//! Process-level configuration, assembled once at startup from environment
//! variables (§6) and handed down by reference — no ad-hoc `std::env::var`
//! calls scattered through the request path.

use std::collections::HashMap;
use std::time::Duration;

use shared::domain::ModelPrice;
use shared::error::CommonError;

use crate::logic::retry::RetryPolicy;
use crate::providers::ProviderId;

#[derive(Debug, Clone)]
pub struct GeminiVertexConfig {
    pub enabled: bool,
    pub project: Option<String>,
    pub location: Option<String>,
    pub credentials_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub providers: HashMap<ProviderId, ProviderConfig>,
    pub gemini_vertex: GeminiVertexConfig,
    pub bedrock_inference_profile_prefix: Option<String>,
    pub retry_policy: RetryPolicy,
    pub usage_limit_cleanup_interval: Duration,
    pub mcp_http_concurrency_limit: usize,
    pub mcp_connect_timeout: Duration,
    pub mcp_list_tools_timeout: Duration,
    pub oauth_refresh_timeout: Duration,
    pub model_prices: HashMap<String, ModelPrice>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_duration_secs(name: &str, default_secs: u64) -> Duration {
    let secs = env_var(name)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

/// `ARCHESTRA_MODEL_PRICES` carries a JSON array of [`ModelPrice`], keyed by
/// `model` once loaded. Absent means no model has a price, so cost-based
/// admission in usage metering treats every request as free — present but
/// malformed is a startup-time misconfiguration, not a silent empty table.
fn parse_model_prices(raw: &str) -> Result<HashMap<String, ModelPrice>, CommonError> {
    let prices: Vec<ModelPrice> = serde_json::from_str(raw).map_err(|e| {
        CommonError::misconfigured(format!("ARCHESTRA_MODEL_PRICES is not valid JSON: {e}"))
    })?;
    Ok(prices
        .into_iter()
        .map(|price| (price.model.clone(), price))
        .collect())
}

fn model_prices_from_env() -> Result<HashMap<String, ModelPrice>, CommonError> {
    match env_var("ARCHESTRA_MODEL_PRICES") {
        Some(raw) => parse_model_prices(&raw),
        None => Ok(HashMap::new()),
    }
}

impl Config {
    /// Load every provider/env var named in §6, validating the required ones
    /// eagerly so a misconfigured deployment fails at startup, not at request
    /// time (§7 "Fatal").
    pub fn from_env() -> Result<Self, CommonError> {
        let mut providers = HashMap::new();
        for provider in ProviderId::ALL {
            let prefix = provider.env_prefix();
            let api_key = env_var(&format!("ARCHESTRA_CHAT_{prefix}_API_KEY"));
            let base_url = env_var(&format!("ARCHESTRA_{prefix}_BASE_URL"));
            providers.insert(*provider, ProviderConfig { api_key, base_url });
        }

        let gemini_vertex = GeminiVertexConfig {
            enabled: env_var("ARCHESTRA_GEMINI_VERTEX_AI_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            project: env_var("ARCHESTRA_GEMINI_VERTEX_AI_PROJECT"),
            location: env_var("ARCHESTRA_GEMINI_VERTEX_AI_LOCATION"),
            credentials_file: env_var("ARCHESTRA_GEMINI_VERTEX_AI_CREDENTIALS_FILE"),
        };

        if gemini_vertex.enabled && gemini_vertex.project.is_none() {
            return Err(CommonError::misconfigured(
                "ARCHESTRA_GEMINI_VERTEX_AI_ENABLED=true requires ARCHESTRA_GEMINI_VERTEX_AI_PROJECT",
            ));
        }

        let bind_addr = env_var("BIND_ADDR")
            .or_else(|| env_var("PORT").map(|p| format!("0.0.0.0:{p}")))
            .unwrap_or_else(|| "0.0.0.0:8787".to_string());

        let mcp_http_concurrency_limit = env_var("MCP_HTTP_CONCURRENCY_LIMIT")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(4);

        Ok(Self {
            bind_addr,
            providers,
            gemini_vertex,
            bedrock_inference_profile_prefix: env_var("ARCHESTRA_BEDROCK_INFERENCE_PROFILE_PREFIX"),
            retry_policy: RetryPolicy::default(),
            usage_limit_cleanup_interval: env_duration_secs(
                "USAGE_LIMIT_CLEANUP_INTERVAL_SECS",
                3600,
            ),
            mcp_http_concurrency_limit,
            mcp_connect_timeout: env_duration_secs("MCP_CONNECT_TIMEOUT_SECS", 30),
            mcp_list_tools_timeout: env_duration_secs("MCP_LIST_TOOLS_TIMEOUT_SECS", 30),
            oauth_refresh_timeout: env_duration_secs("OAUTH_REFRESH_TIMEOUT_SECS", 10),
            model_prices: model_prices_from_env()?,
        })
    }

    pub fn provider_config(&self, provider: ProviderId) -> ProviderConfig {
        self.providers.get(&provider).cloned().unwrap_or(ProviderConfig {
            api_key: None,
            base_url: None,
        })
    }

    pub fn model_price(&self, model: &str) -> Option<&ModelPrice> {
        self.model_prices.get(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_model_price_table() {
        let raw = r#"[
            {"model": "gpt-4o", "input_price_per_million": 5.0, "output_price_per_million": 15.0},
            {"model": "claude-3-opus", "input_price_per_million": 15.0, "output_price_per_million": 75.0}
        ]"#;
        let prices = parse_model_prices(raw).unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices["gpt-4o"].output_price_per_million, 15.0);
    }

    #[test]
    fn rejects_malformed_price_table() {
        let err = parse_model_prices("not json").unwrap_err();
        assert!(matches!(err.kind(), shared::error::ChatErrorKind::Misconfigured));
    }
}
