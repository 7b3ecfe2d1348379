//! Metrics & Health (K): per-provider counters/histograms plus the
//! `/health` and `/metrics` handlers' supporting state.
//!
//! Same `lazy_static!` + `prometheus::register_*_vec!` shape used
//! throughout this codebase, trimmed to exactly the metric set this
//! gateway needs instead of an LLM proxy's token/frontend counters.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, GaugeVec, HistogramVec, TextEncoder,
};

use crate::error::Outcome;

lazy_static! {
    static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "gateway_requests_total",
        "Total outbound provider requests by outcome",
        &["provider", "outcome"]
    )
    .unwrap();

    static ref LATENCY_MS: HistogramVec = register_histogram_vec!(
        "gateway_latency_ms",
        "Upstream provider latency in milliseconds",
        &["provider"],
        vec![10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]
    )
    .unwrap();

    static ref BREAKER_STATE: GaugeVec = register_gauge_vec!(
        "gateway_breaker_state",
        "Circuit breaker state per provider (0=closed, 1=half_open, 2=open)",
        &["provider"]
    )
    .unwrap();

    static ref BUCKET_TOKENS: GaugeVec = register_gauge_vec!(
        "gateway_bucket_tokens",
        "Current token bucket level per provider",
        &["provider"]
    )
    .unwrap();

    static ref CACHE_HITS: Counter =
        register_counter!("gateway_cache_hits_total", "Response cache hits").unwrap();
    static ref CACHE_MISSES: Counter =
        register_counter!("gateway_cache_misses_total", "Response cache misses").unwrap();

    static ref INFLIGHT_COALESCED: Counter = register_counter!(
        "gateway_inflight_coalesced_total",
        "Requests that coalesced onto an in-flight single-flight fetch"
    )
    .unwrap();

    static ref ACTIVE_SUBSCRIPTIONS: prometheus::Gauge = register_gauge!(
        "gateway_active_subscriptions",
        "Currently open streaming subscription connections"
    )
    .unwrap();

    static ref FANOUT_MESSAGES_SENT: Counter = register_counter!(
        "gateway_fanout_messages_sent_total",
        "Data messages sent to streaming subscribers"
    )
    .unwrap();

    static ref QUEUE_DROPS: CounterVec = register_counter_vec!(
        "gateway_queue_drops_total",
        "Outbound subscriber messages dropped due to backpressure",
        &["client"]
    )
    .unwrap();

    static ref STREAM_BACKPRESSURE: Counter = register_counter!(
        "gateway_stream_backpressure_total",
        "Times a subscriber's outbound queue was found full on send"
    )
    .unwrap();
}

pub fn record_request(provider_id: &str, outcome: Outcome) {
    REQUESTS_TOTAL.with_label_values(&[provider_id, outcome.as_label()]).inc();
}

pub fn observe_latency(provider_id: &str, latency_ms: f64) {
    LATENCY_MS.with_label_values(&[provider_id]).observe(latency_ms);
}

pub fn set_breaker_state(provider_id: &str, state: crate::breaker::BreakerState) {
    let v = match state {
        crate::breaker::BreakerState::Closed => 0.0,
        crate::breaker::BreakerState::HalfOpen => 1.0,
        crate::breaker::BreakerState::Open => 2.0,
    };
    BREAKER_STATE.with_label_values(&[provider_id]).set(v);
}

pub fn set_bucket_tokens(provider_id: &str, tokens: f64) {
    BUCKET_TOKENS.with_label_values(&[provider_id]).set(tokens);
}

pub fn record_cache_hit() {
    CACHE_HITS.inc();
}

pub fn record_cache_miss() {
    CACHE_MISSES.inc();
}

pub fn record_inflight_coalesced() {
    INFLIGHT_COALESCED.inc();
}

pub fn set_active_subscriptions(n: i64) {
    ACTIVE_SUBSCRIPTIONS.set(n as f64);
}

pub fn record_fanout_message_sent() {
    FANOUT_MESSAGES_SENT.inc();
}

pub fn record_queue_drop(client_id: &str) {
    QUEUE_DROPS.with_label_values(&[client_id]).inc();
}

pub fn record_stream_backpressure() {
    STREAM_BACKPRESSURE.inc();
}

/// Renders the process-wide registry in Prometheus text exposition format
/// for the `/metrics` handler.
pub fn encode() -> Result<String, prometheus::Error> {
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_encode_round_trips() {
        record_request("p1", Outcome::Ok);
        observe_latency("p1", 42.0);
        set_breaker_state("p1", crate::breaker::BreakerState::Open);
        let body = encode().unwrap();
        assert!(body.contains("gateway_requests_total"));
        assert!(body.contains("gateway_breaker_state"));
    }
}
