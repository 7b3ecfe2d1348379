//! Shared fixtures for the integration tests in this directory: provider
//! specs pointing at wiremock servers, a test-sized `GatewayConfig`, and the
//! JSON bodies the normalizers in `normalize.rs` expect.

use std::sync::Arc;

use crypto_gateway::config::{AuthSpec, GatewayConfig, ProviderSpec, RateLimitSpec};
use crypto_gateway::normalize::KNOWN_PARSER_IDS;
use crypto_gateway::registry::Registry;
use crypto_gateway::types::Category;
use crypto_gateway::{build_router, AppState};

pub fn unlimited_rate_limit() -> RateLimitSpec {
    RateLimitSpec { max_tokens: 1000.0, refill_per_window: 1000.0, window_ms: 1000 }
}

pub fn market_provider(id: &str, base_url: &str, priority: i32, max_retries: u32, rate_limit: RateLimitSpec) -> ProviderSpec {
    ProviderSpec {
        id: id.to_string(),
        category: Category::Market,
        base_url: base_url.to_string(),
        auth: AuthSpec::None,
        timeout_ms: Some(2_000),
        priority,
        rate_limit,
        parser_id: "coingecko_markets".to_string(),
        default_path: Some("/markets".to_string()),
        max_retries: Some(max_retries),
    }
}

pub fn sentiment_provider(id: &str, base_url: &str, priority: i32) -> ProviderSpec {
    ProviderSpec {
        id: id.to_string(),
        category: Category::Sentiment,
        base_url: base_url.to_string(),
        auth: AuthSpec::None,
        timeout_ms: Some(2_000),
        priority,
        rate_limit: unlimited_rate_limit(),
        parser_id: "alternativeme_fng".to_string(),
        default_path: Some("/fng".to_string()),
        max_retries: Some(1),
    }
}

pub fn gateway_config(breaker_failure_threshold: u32) -> GatewayConfig {
    GatewayConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        upstream_timeout_ms: 2_000,
        max_retries: 1,
        breaker_failure_threshold,
        breaker_open_ms: 60_000,
        cache_max_entries: 10_000,
    }
}

pub fn build_test_state(specs: Vec<ProviderSpec>, config: GatewayConfig) -> AppState {
    let registry = Arc::new(Registry::load(specs, KNOWN_PARSER_IDS).expect("valid registry in test fixture"));
    AppState::new(registry, config)
}

pub fn build_test_app(specs: Vec<ProviderSpec>, config: GatewayConfig) -> axum::Router {
    build_router(build_test_state(specs, config))
}

pub fn coingecko_body(symbols: &[(&str, f64)]) -> serde_json::Value {
    serde_json::json!(symbols
        .iter()
        .map(|(symbol, price)| serde_json::json!({
            "symbol": symbol,
            "name": symbol,
            "current_price": price,
            "price_change_percentage_24h": 1.5,
            "total_volume": 1_000_000.0,
            "market_cap": 10_000_000.0,
        }))
        .collect::<Vec<_>>())
}

pub fn candles_body() -> serde_json::Value {
    serde_json::json!({
        "candles": [
            [1_700_000_000_000i64, 100.0, 110.0, 90.0, 105.0, 5_000.0],
            [1_700_000_060_000i64, 105.0, 108.0, 95.0, 100.0, 4_500.0],
        ]
    })
}

pub fn fng_body(value: u8) -> serde_json::Value {
    serde_json::json!({ "data": [{ "value": value.to_string(), "value_classification": "Neutral" }] })
}
