//! Fallback-chain integration tests against a real `axum::Router`, backed by
//! `wiremock` providers in place of the real upstreams. Mirrors the
//! `HttpClient` tests in `src/http_client.rs` but drives the whole stack
//! (registry -> dispatcher -> aggregator -> HTTP API) instead of one client
//! call.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;
use crypto_gateway::breaker::BreakerState;
use crypto_gateway::build_router;
use crypto_gateway::types::Category;

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, body)
}

#[tokio::test]
async fn s1_primary_success_serves_from_first_provider_and_never_calls_secondary() {
    let p1 = MockServer::start().await;
    let p2 = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/markets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(coingecko_body(&[
            ("BTC", 50_000.0),
            ("ETH", 3_000.0),
            ("BNB", 400.0),
        ])))
        .mount(&p1)
        .await;
    Mock::given(method("GET"))
        .and(path("/markets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(coingecko_body(&[("BTC", 1.0)])))
        .mount(&p2)
        .await;

    let specs = vec![
        market_provider("s1-p1", &p1.uri(), 0, 1, unlimited_rate_limit()),
        market_provider("s1-p2", &p2.uri(), 1, 1, unlimited_rate_limit()),
    ];
    let app = build_test_app(specs, gateway_config(5));

    let (status, body) = get_json(app, "/market/quotes?symbols=BTC,ETH,BNB").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "s1-p1");
    let data = body["data"].as_object().expect("data is an object keyed by symbol");
    assert_eq!(data.len(), 3);
    for symbol in ["BTC", "ETH", "BNB"] {
        assert!(data.contains_key(symbol), "missing {symbol} in response");
    }

    assert!(p2.received_requests().await.unwrap().is_empty(), "secondary provider must not be called when the primary succeeds");
}

#[tokio::test]
async fn s2_primary_failures_fall_through_to_secondary_without_tripping_the_breaker() {
    let p1 = MockServer::start().await;
    let p2 = MockServer::start().await;

    Mock::given(method("GET")).and(path("/historical")).respond_with(ResponseTemplate::new(503)).mount(&p1).await;
    Mock::given(method("GET"))
        .and(path("/historical"))
        .respond_with(ResponseTemplate::new(200).set_body_json(candles_body()))
        .mount(&p2)
        .await;

    // max_retries=1: one attempt per provider per call, so three distinct
    // cache-miss calls below produce exactly three consecutive P1 failures.
    let specs = vec![
        market_provider("s2-p1", &p1.uri(), 0, 1, unlimited_rate_limit()),
        market_provider("s2-p2", &p2.uri(), 1, 1, unlimited_rate_limit()),
    ];
    let state = build_test_state(specs, gateway_config(5));
    let app = build_router(state.clone());

    for symbol in ["BTC", "ETH", "BNB"] {
        let (status, body) = get_json(app.clone(), &format!("/market/historical?symbol={symbol}&days=1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "s2-p2");
    }

    assert_eq!(p1.received_requests().await.unwrap().len(), 3, "each distinct-key call must still try the primary first");
    assert_eq!(p2.received_requests().await.unwrap().len(), 3);

    let snapshot = state.dispatcher.health_snapshot(Category::Market);
    let (_, p1_breaker, _, _) = snapshot.iter().find(|(id, ..)| id == "s2-p1").unwrap();
    assert_eq!(*p1_breaker, BreakerState::Closed, "three failures must not reach the five-failure trip threshold");
}

#[tokio::test]
async fn s3_breaker_trip_skips_primary_entirely_once_open() {
    let p1 = MockServer::start().await;
    let p2 = MockServer::start().await;

    Mock::given(method("GET")).and(path("/historical")).respond_with(ResponseTemplate::new(503)).mount(&p1).await;
    Mock::given(method("GET"))
        .and(path("/historical"))
        .respond_with(ResponseTemplate::new(200).set_body_json(candles_body()))
        .mount(&p2)
        .await;

    let specs = vec![
        market_provider("s3-p1", &p1.uri(), 0, 1, unlimited_rate_limit()),
        market_provider("s3-p2", &p2.uri(), 1, 1, unlimited_rate_limit()),
    ];
    let state = build_test_state(specs, gateway_config(5));
    let app = build_router(state.clone());

    // Five distinct-key calls, each a fresh cache-miss, so each one reaches
    // the primary and records a failure.
    for i in 0..5 {
        let (status, body) = get_json(app.clone(), &format!("/market/historical?symbol=SYM{i}&days=1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "s3-p2");
    }

    let snapshot = state.dispatcher.health_snapshot(Category::Market);
    let (_, p1_breaker, ..) = snapshot.iter().find(|(id, ..)| id == "s3-p1").unwrap();
    assert_eq!(*p1_breaker, BreakerState::Open, "fifth consecutive failure must trip the breaker");

    let calls_before = p1.received_requests().await.unwrap().len();
    assert_eq!(calls_before, 5);

    let (status, body) = get_json(app.clone(), "/market/historical?symbol=SYM5&days=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "s3-p2");

    let calls_after = p1.received_requests().await.unwrap().len();
    assert_eq!(calls_after, calls_before, "an open breaker must skip the primary without an HTTP attempt");
}
