//! HTTP API Surface (I): thin handlers mapping REST requests onto the
//! aggregator, per §6. Handlers parse/validate query params into a
//! `ClientError` and otherwise just wrap the aggregator's result in the
//! `{ok, data, source, degraded, fetched_at}` envelope.

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::aggregator::AggregateResult;
use crate::breaker::BreakerState;
use crate::error::GatewayError;
use crate::types::Category;
use crate::AppState;

fn is_false(b: &bool) -> bool {
    !b
}

#[derive(Serialize)]
struct SuccessEnvelope<T: Serialize> {
    ok: bool,
    data: T,
    source: String,
    #[serde(skip_serializing_if = "is_false")]
    degraded: bool,
    fetched_at: i64,
}

impl<T: Serialize> From<AggregateResult<T>> for SuccessEnvelope<T> {
    fn from(r: AggregateResult<T>) -> Self {
        Self { ok: true, data: r.data, source: r.source, degraded: r.degraded, fetched_at: r.fetched_at }
    }
}

fn envelope<T: Serialize>(result: AggregateResult<T>) -> Json<SuccessEnvelope<T>> {
    Json(result.into())
}

pub async fn fear_greed_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, GatewayError> {
    let result = state.aggregator.get_fear_greed(false).await?;
    Ok(envelope(result))
}

#[derive(Deserialize)]
pub struct ListingsParams {
    #[serde(default)]
    limit: Option<u32>,
}

pub async fn market_listings_handler(
    State(state): State<AppState>,
    Query(params): Query<ListingsParams>,
) -> Result<impl IntoResponse, GatewayError> {
    let limit = params.limit.unwrap_or(20);
    if !(1..=500).contains(&limit) {
        return Err(GatewayError::ClientError("limit must be between 1 and 500".to_string()));
    }
    let result = state.aggregator.get_market_listings(limit as usize, false).await?;
    Ok(envelope(result))
}

#[derive(Deserialize)]
pub struct QuotesParams {
    symbols: Option<String>,
}

pub async fn market_quotes_handler(
    State(state): State<AppState>,
    Query(params): Query<QuotesParams>,
) -> Result<impl IntoResponse, GatewayError> {
    let symbols_csv = params
        .symbols
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| GatewayError::ClientError("symbols is required".to_string()))?;
    let symbols: Vec<String> = symbols_csv.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    if symbols.is_empty() {
        return Err(GatewayError::ClientError("symbols must contain at least one value".to_string()));
    }
    let result = state.aggregator.get_market_data(&symbols, false).await?;
    Ok(envelope(result))
}

#[derive(Deserialize)]
pub struct HistoricalParams {
    symbol: Option<String>,
    days: Option<u32>,
}

pub async fn market_historical_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoricalParams>,
) -> Result<impl IntoResponse, GatewayError> {
    let symbol = params.symbol.filter(|s| !s.trim().is_empty()).ok_or_else(|| {
        GatewayError::ClientError("symbol is required".to_string())
    })?;
    let days = params.days.unwrap_or(30);
    if !(1..=365).contains(&days) {
        return Err(GatewayError::ClientError("days must be between 1 and 365".to_string()));
    }
    let result = state.aggregator.get_historical(&symbol, days, false).await?;
    Ok(envelope(result))
}

#[derive(Deserialize)]
pub struct NewsParams {
    query: Option<String>,
    limit: Option<u32>,
}

pub async fn news_handler(
    State(state): State<AppState>,
    Query(params): Query<NewsParams>,
) -> Result<impl IntoResponse, GatewayError> {
    let limit = params.limit.unwrap_or(20);
    if !(1..=100).contains(&limit) {
        return Err(GatewayError::ClientError("limit must be between 1 and 100".to_string()));
    }
    let result = state.aggregator.get_news(params.query.as_deref(), limit as usize, false).await?;
    Ok(envelope(result))
}

#[derive(Deserialize)]
pub struct WhalesParams {
    min_value_usd: Option<f64>,
    limit: Option<u32>,
}

pub async fn whales_handler(
    State(state): State<AppState>,
    Query(params): Query<WhalesParams>,
) -> Result<impl IntoResponse, GatewayError> {
    let min_value_usd = params.min_value_usd.unwrap_or(0.0);
    if !min_value_usd.is_finite() || min_value_usd < 0.0 {
        return Err(GatewayError::ClientError("min_value_usd must be a nonnegative number".to_string()));
    }
    let limit = params.limit.unwrap_or(50);
    if !(1..=500).contains(&limit) {
        return Err(GatewayError::ClientError("limit must be between 1 and 500".to_string()));
    }
    let result = state.aggregator.get_whales(min_value_usd, limit as usize, false).await?;
    Ok(envelope(result))
}

pub async fn overview_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, GatewayError> {
    let result = state.aggregator.get_market_overview(true).await?;
    Ok(envelope(result))
}

#[derive(Serialize)]
struct ProviderHealthView {
    breaker: &'static str,
    recent_success_rate: f64,
    last_ok_age_ms: Option<u128>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    providers: std::collections::HashMap<String, ProviderHealthView>,
}

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut providers = std::collections::HashMap::new();
    let mut any_category_ok = false;
    let mut any_category_down = true;

    for category in [Category::Market, Category::Sentiment, Category::News, Category::Whales, Category::Explorer] {
        let snapshot = state.dispatcher.health_snapshot(category);
        if snapshot.is_empty() {
            continue;
        }
        let mut category_ok = false;
        let mut category_alive = false;
        for (id, breaker_state, success_rate, last_ok_age) in snapshot {
            let ok_recently = last_ok_age.map(|age| age < std::time::Duration::from_secs(300)).unwrap_or(false);
            let alive_recently = last_ok_age.map(|age| age < std::time::Duration::from_secs(900)).unwrap_or(false);
            if breaker_state == BreakerState::Closed && ok_recently {
                category_ok = true;
            }
            if alive_recently {
                category_alive = true;
            }
            providers.insert(
                id,
                ProviderHealthView {
                    breaker: breaker_state.as_label(),
                    recent_success_rate: success_rate,
                    last_ok_age_ms: last_ok_age.map(|d| d.as_millis()),
                },
            );
        }
        any_category_ok |= category_ok;
        any_category_down &= !category_alive;
    }

    let status = if any_category_down && !providers.is_empty() {
        "down"
    } else if any_category_ok {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse { status, providers })
}

pub async fn metrics_handler() -> impl IntoResponse {
    match crate::metrics::encode() {
        Ok(body) => (axum::http::StatusCode::OK, body),
        Err(e) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, format!("failed to encode metrics: {}", e)),
    }
}
