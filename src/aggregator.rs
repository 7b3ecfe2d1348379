//! Aggregator (H): the high-level operations the HTTP API and Subscription
//! Hub actually call. Each composes one or more `Dispatcher::dispatch`
//! calls and applies the permissive/strict degraded-default policy (§9).

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::ttl;
use crate::dispatcher::{Dispatcher, LogicalRequest};
use crate::error::GatewayError;
use crate::normalize;
use crate::types::{Candle, CanonicalNewsArticle, CanonicalPrice, CanonicalSentiment, CanonicalWhaleTx, Category};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Envelope matching the `{data, source, degraded?, fetched_at}` half of
/// §6's response shape; handlers in `api.rs` add `ok:true` around this.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AggregateResult<T> {
    pub data: T,
    pub source: String,
    pub degraded: bool,
    pub fetched_at: i64,
}

impl<T> AggregateResult<T> {
    fn live(data: T, source: String) -> Self {
        Self { data, source, degraded: false, fetched_at: now_ms() }
    }

    fn degraded(data: T) -> Self {
        Self { data, source: "default".to_string(), degraded: true, fetched_at: now_ms() }
    }
}

pub struct Aggregator {
    dispatcher: Arc<Dispatcher>,
}

impl Aggregator {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub async fn get_fear_greed(&self, degraded_ok: bool) -> Result<AggregateResult<CanonicalSentiment>, GatewayError> {
        let req = LogicalRequest {
            category: Category::Sentiment,
            cache_method: "fear_greed".to_string(),
            cache_params: vec![],
            path_override: String::new(),
            fetch_params: vec![],
        };
        match self.dispatcher.dispatch(req, ttl::SENTIMENT, normalize::parse_sentiment).await {
            Ok((value, source)) => Ok(AggregateResult::live(value, source)),
            Err(e) if degraded_ok && is_terminal(&e) => Ok(AggregateResult::degraded(CanonicalSentiment::default_degraded())),
            Err(e) => Err(e),
        }
    }

    pub async fn get_market_data(
        &self,
        symbols: &[String],
        degraded_ok: bool,
    ) -> Result<AggregateResult<HashMap<String, CanonicalPrice>>, GatewayError> {
        let listings = self.get_market_listings(usize::MAX, degraded_ok).await?;
        let wanted: std::collections::HashSet<String> = symbols.iter().map(|s| s.to_uppercase()).collect();
        let data = listings
            .data
            .into_iter()
            .filter(|p| wanted.contains(&p.symbol))
            .map(|p| (p.symbol.clone(), p))
            .collect();
        Ok(AggregateResult { data, source: listings.source, degraded: listings.degraded, fetched_at: listings.fetched_at })
    }

    pub async fn get_market_listings(
        &self,
        limit: usize,
        degraded_ok: bool,
    ) -> Result<AggregateResult<Vec<CanonicalPrice>>, GatewayError> {
        let req = LogicalRequest {
            category: Category::Market,
            cache_method: "listings".to_string(),
            cache_params: vec![],
            path_override: String::new(),
            fetch_params: vec![],
        };
        match self.dispatcher.dispatch(req, ttl::PRICES, normalize::parse_market).await {
            Ok((mut value, source)) => {
                if limit != usize::MAX {
                    value.truncate(limit);
                }
                Ok(AggregateResult::live(value, source))
            }
            Err(e) if degraded_ok && is_terminal(&e) => Ok(AggregateResult::degraded(Vec::new())),
            Err(e) => Err(e),
        }
    }

    /// Candles are fetched from the market chain via a dedicated
    /// historical path, independent of each provider's `default_path`.
    pub async fn get_historical(
        &self,
        symbol: &str,
        days: u32,
        degraded_ok: bool,
    ) -> Result<AggregateResult<Vec<Candle>>, GatewayError> {
        let req = LogicalRequest {
            category: Category::Market,
            cache_method: "historical".to_string(),
            cache_params: vec![("symbol".to_string(), symbol.to_string()), ("days".to_string(), days.to_string())],
            path_override: "/historical".to_string(),
            fetch_params: vec![("symbol".to_string(), symbol.to_string()), ("days".to_string(), days.to_string())],
        };
        match self
            .dispatcher
            .dispatch(req, ttl::PRICES, |_parser_id, body, _provider_id| normalize::parse_candles(body))
            .await
        {
            Ok((value, source)) => Ok(AggregateResult::live(value, source)),
            Err(e) if degraded_ok && is_terminal(&e) => Ok(AggregateResult::degraded(Vec::new())),
            Err(e) => Err(e),
        }
    }

    pub async fn get_news(
        &self,
        query: Option<&str>,
        limit: usize,
        degraded_ok: bool,
    ) -> Result<AggregateResult<Vec<CanonicalNewsArticle>>, GatewayError> {
        let mut fetch_params = Vec::new();
        if let Some(q) = query {
            fetch_params.push(("query".to_string(), q.to_string()));
        }
        let req = LogicalRequest {
            category: Category::News,
            cache_method: "news".to_string(),
            cache_params: fetch_params.clone(),
            path_override: String::new(),
            fetch_params,
        };
        match self.dispatcher.dispatch(req, ttl::NEWS, normalize::parse_news).await {
            Ok((mut value, source)) => {
                value.truncate(limit);
                Ok(AggregateResult::live(value, source))
            }
            Err(e) if degraded_ok && is_terminal(&e) => Ok(AggregateResult::degraded(Vec::new())),
            Err(e) => Err(e),
        }
    }

    pub async fn get_whales(
        &self,
        min_value_usd: f64,
        limit: usize,
        degraded_ok: bool,
    ) -> Result<AggregateResult<Vec<CanonicalWhaleTx>>, GatewayError> {
        let req = LogicalRequest {
            category: Category::Whales,
            cache_method: "whales".to_string(),
            cache_params: vec![],
            path_override: String::new(),
            fetch_params: vec![],
        };
        match self.dispatcher.dispatch(req, ttl::WHALES, normalize::parse_whales).await {
            Ok((value, source)) => {
                let mut data: Vec<CanonicalWhaleTx> =
                    value.into_iter().filter(|tx| tx.amount_usd >= min_value_usd).collect();
                data.truncate(limit);
                Ok(AggregateResult::live(data, source))
            }
            Err(e) if degraded_ok && is_terminal(&e) => Ok(AggregateResult::degraded(Vec::new())),
            Err(e) => Err(e),
        }
    }

    /// Fans out fear-greed, top 10 listings, and top 10 news in parallel.
    /// Partial success is allowed: the overview is only an error if every
    /// sub-call failed terminally (degraded_ok=false and all three error).
    pub async fn get_market_overview(&self, degraded_ok: bool) -> Result<AggregateResult<MarketOverview>, GatewayError> {
        let (fear_greed, top_coins, news) = tokio::join!(
            self.get_fear_greed(degraded_ok),
            self.get_market_listings(10, degraded_ok),
            self.get_news(None, 10, degraded_ok),
        );

        let mut errors = HashMap::new();
        let fear_greed_ok = fear_greed.is_ok();
        let top_coins_ok = top_coins.is_ok();
        let news_ok = news.is_ok();

        if let Err(e) = &fear_greed {
            errors.insert("fear_greed".to_string(), e.to_string());
        }
        if let Err(e) = &top_coins {
            errors.insert("top_coins".to_string(), e.to_string());
        }
        if let Err(e) = &news {
            errors.insert("news".to_string(), e.to_string());
        }

        if !fear_greed_ok && !top_coins_ok && !news_ok {
            return Err(fear_greed.err().unwrap());
        }

        let degraded = fear_greed.as_ref().map(|r| r.degraded).unwrap_or(false)
            || top_coins.as_ref().map(|r| r.degraded).unwrap_or(false)
            || news.as_ref().map(|r| r.degraded).unwrap_or(false);

        let overview = MarketOverview {
            fear_greed: fear_greed.ok().map(|r| r.data),
            top_coins: top_coins.ok().map(|r| r.data).unwrap_or_default(),
            news: news.ok().map(|r| r.data).unwrap_or_default(),
            errors: if errors.is_empty() { None } else { Some(errors) },
        };

        Ok(AggregateResult {
            data: overview,
            source: "aggregate".to_string(),
            degraded,
            fetched_at: now_ms(),
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MarketOverview {
    pub fear_greed: Option<CanonicalSentiment>,
    pub top_coins: Vec<CanonicalPrice>,
    pub news: Vec<CanonicalNewsArticle>,
    pub errors: Option<HashMap<String, String>>,
}

fn is_terminal(e: &GatewayError) -> bool {
    matches!(e, GatewayError::AllProvidersFailed { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::registry::Registry;

    fn empty_dispatcher() -> Arc<Dispatcher> {
        let registry = Arc::new(Registry::load(vec![], normalize::KNOWN_PARSER_IDS).unwrap());
        let config = GatewayConfig {
            listen_addr: "127.0.0.1:0".into(),
            upstream_timeout_ms: 1000,
            max_retries: 1,
            breaker_failure_threshold: 5,
            breaker_open_ms: 60_000,
            cache_max_entries: 100,
        };
        Arc::new(Dispatcher::new(registry, config))
    }

    #[tokio::test]
    async fn strict_mode_propagates_all_providers_failed_on_empty_chain() {
        let agg = Aggregator::new(empty_dispatcher());
        let res = agg.get_fear_greed(false).await;
        assert!(matches!(res, Err(GatewayError::AllProvidersFailed { .. })));
    }

    #[tokio::test]
    async fn permissive_mode_substitutes_static_default() {
        let agg = Aggregator::new(empty_dispatcher());
        let res = agg.get_fear_greed(true).await.unwrap();
        assert!(res.degraded);
        assert_eq!(res.data.fear_greed_value, 50);
    }

    #[tokio::test]
    async fn empty_market_chain_permissive_yields_empty_map() {
        let agg = Aggregator::new(empty_dispatcher());
        let res = agg.get_market_data(&["BTC".to_string()], true).await.unwrap();
        assert!(res.degraded);
        assert!(res.data.is_empty());
    }

    #[tokio::test]
    async fn overview_is_degraded_and_carries_errors_when_permissive() {
        let agg = Aggregator::new(empty_dispatcher());
        let res = agg.get_market_overview(true).await.unwrap();
        assert!(res.degraded);
        assert!(res.data.errors.is_none(), "permissive mode should not surface errors, only defaults");
    }
}
