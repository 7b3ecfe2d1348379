use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crypto_gateway::config::{self, Cli, GatewayConfig};
use crypto_gateway::normalize;
use crypto_gateway::registry::Registry;
use crypto_gateway::types::Category;
use crypto_gateway::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crypto_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let gateway_config = GatewayConfig::from(&cli);

    let specs = config::load_provider_file(&cli.provider_config_path)
        .with_context(|| format!("loading provider config from {}", cli.provider_config_path))?;
    let registry = Arc::new(
        Registry::load(specs, normalize::KNOWN_PARSER_IDS).context("validating provider registry")?,
    );

    for category in [Category::Market, Category::Sentiment, Category::News, Category::Whales, Category::Explorer] {
        tracing::info!(
            category = %category,
            provider_count = registry.chain_for(category).len(),
            "registry loaded"
        );
    }

    let state = AppState::new(Arc::clone(&registry), gateway_config.clone());
    let app = build_router(state);

    let addr: std::net::SocketAddr = gateway_config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid LISTEN_ADDR {}", gateway_config.listen_addr))?;

    tracing::info!(
        listen_addr = %addr,
        provider_config_path = %cli.provider_config_path,
        git_branch = env!("GIT_BRANCH"),
        "crypto gateway starting"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
