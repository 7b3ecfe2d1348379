use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod aggregator;
pub mod api;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod http_client;
pub mod metrics;
pub mod normalize;
pub mod ratelimit;
pub mod registry;
pub mod types;

use aggregator::Aggregator;
use config::GatewayConfig;
use dispatcher::Dispatcher;
use hub::Hub;
use registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    pub dispatcher: Arc<Dispatcher>,
    pub hub: Arc<Hub>,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, gateway_config: GatewayConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(registry, gateway_config));
        let aggregator = Arc::new(Aggregator::new(Arc::clone(&dispatcher)));
        let hub = Hub::new(Arc::clone(&aggregator));
        Self { aggregator, dispatcher, hub }
    }
}

/// Wires every route named in the HTTP API surface and Subscription Hub
/// onto one router, with the same CORS + tracing layering the teacher
/// applies to its own proxy routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health_handler))
        .route("/metrics", get(api::metrics_handler))
        .route("/fear-greed", get(api::fear_greed_handler))
        .route("/market/listings", get(api::market_listings_handler))
        .route("/market/quotes", get(api::market_quotes_handler))
        .route("/market/historical", get(api::market_historical_handler))
        .route("/news", get(api::news_handler))
        .route("/whales", get(api::whales_handler))
        .route("/overview", get(api::overview_handler))
        .route("/stream", get(hub::stream_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
