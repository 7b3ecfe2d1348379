//! CLI + environment configuration and the declarative provider catalog file.
//!
//! Mirrors the two-layer shape used throughout this codebase: a
//! `clap::Parser` struct binds CLI flags to environment variables via
//! `#[arg(env = "...")]`, and a separate JSON file (pointed to by
//! `PROVIDER_CONFIG_PATH`) holds the larger, rarely-changing provider
//! catalog.

use std::collections::HashMap;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::types::Category;

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_open_ms() -> u64 {
    60_000
}

fn default_cache_max_entries() -> u64 {
    10_000
}

#[derive(Debug, Parser)]
#[command(name = "crypto-gateway", version, about = "Crypto market-data aggregation gateway")]
pub struct Cli {
    /// Address to bind the HTTP server to, e.g. 0.0.0.0:8080.
    #[arg(long, env = "LISTEN_ADDR", default_value_t = default_listen_addr())]
    pub listen_addr: String,

    /// Path to the declarative provider catalog (JSON array of ProviderSpec).
    #[arg(long, env = "PROVIDER_CONFIG_PATH", default_value = "~/.crypto-gateway/providers.json")]
    pub provider_config_path: String,

    /// Default per-provider upstream timeout, in milliseconds.
    #[arg(long, env = "UPSTREAM_TIMEOUT_MS", default_value_t = default_upstream_timeout_ms())]
    pub upstream_timeout_ms: u64,

    /// Default max retry attempts (including the initial attempt) per provider.
    #[arg(long, env = "MAX_RETRIES", default_value_t = default_max_retries())]
    pub max_retries: u32,

    /// Consecutive failures before a provider's breaker opens.
    #[arg(long, env = "BREAKER_FAILURE_THRESHOLD", default_value_t = default_breaker_failure_threshold())]
    pub breaker_failure_threshold: u32,

    /// Duration a breaker stays open before probing again, in milliseconds.
    #[arg(long, env = "BREAKER_OPEN_MS", default_value_t = default_breaker_open_ms())]
    pub breaker_open_ms: u64,

    /// Maximum number of entries held in the response cache.
    #[arg(long, env = "CACHE_MAX_ENTRIES", default_value_t = default_cache_max_entries())]
    pub cache_max_entries: u64,
}

/// How a provider's API key (if any) is attached to an outbound request.
///
/// `env` names an environment variable the gateway reads at startup; the
/// resolved value is never stored back into a loggable field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthSpec {
    None,
    Header { name: String, env: String },
    Query { name: String, env: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub max_tokens: f64,
    pub refill_per_window: f64,
    pub window_ms: u64,
}

/// Static, declaratively-loaded description of one upstream provider.
///
/// Everything here is immutable after startup; the mutable counterpart is
/// `ProviderRuntimeState` owned by the dispatcher's registry of runtimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub id: String,
    pub category: Category,
    pub base_url: String,
    #[serde(default = "default_auth")]
    pub auth: AuthSpec,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub priority: i32,
    pub rate_limit: RateLimitSpec,
    pub parser_id: String,
    /// Path appended to `base_url` for the default fetch of this category
    /// (e.g. `/v1/cryptocurrency/listings/latest`). Individual aggregator
    /// operations may override this per call.
    #[serde(default)]
    pub default_path: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_auth() -> AuthSpec {
    AuthSpec::None
}

impl ProviderSpec {
    /// Resolves the auth secret from its referenced environment variable.
    /// Returns `Ok(None)` for `AuthSpec::None`, `Err` if the variable is
    /// unset or empty for an auth-requiring provider.
    pub fn resolve_auth(&self) -> Result<Option<(String, String)>, GatewayError> {
        match &self.auth {
            AuthSpec::None => Ok(None),
            AuthSpec::Header { name, env } | AuthSpec::Query { name, env } => {
                match std::env::var(env) {
                    Ok(v) if !v.is_empty() => Ok(Some((name.clone(), v))),
                    _ => Err(GatewayError::Config(format!(
                        "provider {} references unset/empty env var {}",
                        self.id, env
                    ))),
                }
            }
        }
    }

    pub fn is_query_auth(&self) -> bool {
        matches!(self.auth, AuthSpec::Query { .. })
    }

    pub fn effective_timeout_ms(&self, default_ms: u64) -> u64 {
        self.timeout_ms.unwrap_or(default_ms)
    }

    pub fn effective_max_retries(&self, default_retries: u32) -> u32 {
        self.max_retries.unwrap_or(default_retries)
    }
}

/// Aggregated, process-wide tunables resolved from CLI/env, shared behind
/// an `Arc` the way the rest of this codebase threads its `Config`.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub upstream_timeout_ms: u64,
    pub max_retries: u32,
    pub breaker_failure_threshold: u32,
    pub breaker_open_ms: u64,
    pub cache_max_entries: u64,
}

impl From<&Cli> for GatewayConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            listen_addr: cli.listen_addr.clone(),
            upstream_timeout_ms: cli.upstream_timeout_ms,
            max_retries: cli.max_retries,
            breaker_failure_threshold: cli.breaker_failure_threshold,
            breaker_open_ms: cli.breaker_open_ms,
            cache_max_entries: cli.cache_max_entries,
        }
    }
}

/// Loads and validates the provider catalog from disk.
///
/// The file is a flat JSON array of `ProviderSpec`. Validation duplicates
/// none of the Registry's own invariant checks; it only handles the I/O +
/// JSON-shape concerns. Duplicate-priority and unknown-parser_id checks live
/// in `registry::Registry::load`.
pub fn load_provider_file(path: &str) -> Result<Vec<ProviderSpec>, GatewayError> {
    let expanded = shellexpand::tilde(path).into_owned();
    let text = std::fs::read_to_string(&expanded).map_err(|e| {
        GatewayError::Config(format!("failed to read provider config {}: {}", expanded, e))
    })?;
    serde_json::from_str(&text).map_err(|e| {
        GatewayError::Config(format!("failed to parse provider config {}: {}", expanded, e))
    })
}

/// Grouping helper used by tests and by the registry loader.
pub fn group_by_category(specs: &[ProviderSpec]) -> HashMap<Category, Vec<ProviderSpec>> {
    let mut map: HashMap<Category, Vec<ProviderSpec>> = HashMap::new();
    for spec in specs {
        map.entry(spec.category).or_default().push(spec.clone());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, priority: i32) -> ProviderSpec {
        ProviderSpec {
            id: id.to_string(),
            category: Category::Market,
            base_url: "https://example.com".to_string(),
            auth: AuthSpec::None,
            timeout_ms: None,
            priority,
            rate_limit: RateLimitSpec {
                max_tokens: 10.0,
                refill_per_window: 10.0,
                window_ms: 1000,
            },
            parser_id: "identity".to_string(),
            default_path: None,
            max_retries: None,
        }
    }

    #[test]
    fn resolve_auth_none_is_ok() {
        let s = spec("p1", 0);
        assert!(s.resolve_auth().unwrap().is_none());
    }

    #[test]
    fn resolve_auth_missing_env_errors() {
        let mut s = spec("p1", 0);
        s.auth = AuthSpec::Header {
            name: "X-Api-Key".into(),
            env: "CRYPTO_GATEWAY_TEST_UNSET_VAR_XYZ".into(),
        };
        assert!(s.resolve_auth().is_err());
    }

    #[test]
    fn group_by_category_groups_correctly() {
        let specs = vec![spec("p1", 0), spec("p2", 1)];
        let grouped = group_by_category(&specs);
        assert_eq!(grouped.get(&Category::Market).unwrap().len(), 2);
    }

    #[test]
    fn load_provider_file_reads_a_flat_json_array() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("crypto-gateway-test-providers-{:?}.json", std::thread::current().id()));
        std::fs::write(
            &path,
            r#"[{"id":"p1","category":"market","base_url":"https://example.com","priority":0,"rate_limit":{"max_tokens":10.0,"refill_per_window":10.0,"window_ms":1000},"parser_id":"identity"}]"#,
        )
        .unwrap();

        let specs = load_provider_file(path.to_str().unwrap()).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].id, "p1");

        std::fs::remove_file(&path).ok();
    }
}
