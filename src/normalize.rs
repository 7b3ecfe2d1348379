//! Normalizers (F): per-category, per-provider adapters to canonical shapes.
//!
//! Each `parser_id` maps to exactly one function below. A normalizer's only
//! job is `upstream_json -> canonical`; it never reaches back into the
//! dispatcher or touches provider runtime state. New providers add a new
//! `parser_id` and match arm here, never a runtime plugin.

use chrono::{TimeZone, Utc};

use crate::error::GatewayError;
use crate::types::{Candle, CanonicalNewsArticle, CanonicalPrice, CanonicalSentiment, CanonicalWhaleTx, Chain, NewsSentiment};

/// Every `parser_id` the registry will accept. Kept as one flat list so
/// `Registry::load` can validate `ProviderSpec.parser_id` against it at
/// startup instead of discovering a typo at request time.
pub const KNOWN_PARSER_IDS: &[&str] = &[
    "coingecko_markets",
    "coinmarketcap_listings",
    "alternativeme_fng",
    "cryptopanic_news",
    "newsapi_news",
    "whalealert_tx",
];

fn num(v: &serde_json::Value) -> Result<f64, GatewayError> {
    v.as_f64()
        .filter(|x| x.is_finite())
        .ok_or_else(|| GatewayError::ParseError("expected finite number".into()))
}

fn opt_num(v: Option<&serde_json::Value>) -> Result<f64, GatewayError> {
    match v {
        Some(v) if !v.is_null() => num(v),
        _ => Ok(0.0),
    }
}

fn str_field<'a>(v: &'a serde_json::Value, key: &str) -> Result<&'a str, GatewayError> {
    v.get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| GatewayError::ParseError(format!("missing or non-string field {}", key)))
}

/// `coingecko_markets`: an array of `{symbol, name, current_price,
/// price_change_percentage_24h, total_volume, market_cap}`.
fn parse_coingecko_markets(
    body: &serde_json::Value,
    provider_id: &str,
) -> Result<Vec<CanonicalPrice>, GatewayError> {
    let arr = body
        .as_array()
        .ok_or_else(|| GatewayError::ParseError("expected array body".into()))?;
    arr.iter()
        .map(|row| {
            CanonicalPrice::new(
                str_field(row, "symbol")?.to_uppercase(),
                str_field(row, "name")?,
                num(row.get("current_price").ok_or_else(|| {
                    GatewayError::ParseError("missing current_price".into())
                })?)?,
                opt_num(row.get("price_change_percentage_24h"))?,
                opt_num(row.get("total_volume"))?,
                opt_num(row.get("market_cap"))?,
                provider_id,
            )
        })
        .collect()
}

/// `coinmarketcap_listings`: `{data: [{symbol, name, quote: {USD: {price,
/// percent_change_24h, volume_24h, market_cap}}}]}`.
fn parse_coinmarketcap_listings(
    body: &serde_json::Value,
    provider_id: &str,
) -> Result<Vec<CanonicalPrice>, GatewayError> {
    let arr = body
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| GatewayError::ParseError("expected data array".into()))?;
    arr.iter()
        .map(|row| {
            let usd = row
                .get("quote")
                .and_then(|q| q.get("USD"))
                .ok_or_else(|| GatewayError::ParseError("missing quote.USD".into()))?;
            CanonicalPrice::new(
                str_field(row, "symbol")?.to_uppercase(),
                str_field(row, "name")?,
                num(usd
                    .get("price")
                    .ok_or_else(|| GatewayError::ParseError("missing price".into()))?)?,
                opt_num(usd.get("percent_change_24h"))?,
                opt_num(usd.get("volume_24h"))?,
                opt_num(usd.get("market_cap"))?,
                provider_id,
            )
        })
        .collect()
}

pub fn parse_market(
    parser_id: &str,
    body: &serde_json::Value,
    provider_id: &str,
) -> Result<Vec<CanonicalPrice>, GatewayError> {
    match parser_id {
        "coingecko_markets" => parse_coingecko_markets(body, provider_id),
        "coinmarketcap_listings" => parse_coinmarketcap_listings(body, provider_id),
        other => Err(GatewayError::ParseError(format!(
            "parser_id {} is not a market normalizer",
            other
        ))),
    }
}

/// `alternativeme_fng`: `{data: [{value, value_classification}]}`. Only the
/// label's numeric value is trusted; the label itself is recomputed from
/// fixed thresholds (§3), never taken from upstream.
fn parse_alternativeme_fng(
    body: &serde_json::Value,
    provider_id: &str,
) -> Result<CanonicalSentiment, GatewayError> {
    let entry = body
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| GatewayError::ParseError("missing data[0]".into()))?;
    let value_str = str_field(entry, "value")?;
    let value: u8 = value_str
        .parse()
        .map_err(|_| GatewayError::ParseError("fear/greed value not an integer".into()))?;
    CanonicalSentiment::new(value, 0.0, provider_id)
}

pub fn parse_sentiment(
    parser_id: &str,
    body: &serde_json::Value,
    provider_id: &str,
) -> Result<CanonicalSentiment, GatewayError> {
    match parser_id {
        "alternativeme_fng" => parse_alternativeme_fng(body, provider_id),
        other => Err(GatewayError::ParseError(format!(
            "parser_id {} is not a sentiment normalizer",
            other
        ))),
    }
}

fn parse_published_at(raw: &str) -> Result<chrono::DateTime<Utc>, GatewayError> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| GatewayError::ParseError(format!("unparseable timestamp: {}", raw)))
}

/// `cryptopanic_news`: `{results: [{title, url, source: {title}, published_at}]}`.
fn parse_cryptopanic_news(
    body: &serde_json::Value,
    provider_id: &str,
) -> Result<Vec<CanonicalNewsArticle>, GatewayError> {
    let arr = body
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| GatewayError::ParseError("missing results array".into()))?;
    arr.iter()
        .map(|row| {
            let url = str_field(row, "url")?.to_string();
            Ok(CanonicalNewsArticle {
                id: CanonicalNewsArticle::id_for_url(&url),
                title: str_field(row, "title")?.to_string(),
                description: row
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_string(),
                url,
                source_name: row
                    .get("source")
                    .and_then(|s| s.get("title"))
                    .and_then(|t| t.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                published_at: parse_published_at(str_field(row, "published_at")?)?,
                sentiment: NewsSentiment::Unknown,
                source_provider_id: provider_id.to_string(),
            })
        })
        .collect()
}

/// `newsapi_news`: `{articles: [{title, description, url, source: {name},
/// publishedAt}]}`.
fn parse_newsapi_news(
    body: &serde_json::Value,
    provider_id: &str,
) -> Result<Vec<CanonicalNewsArticle>, GatewayError> {
    let arr = body
        .get("articles")
        .and_then(|r| r.as_array())
        .ok_or_else(|| GatewayError::ParseError("missing articles array".into()))?;
    arr.iter()
        .map(|row| {
            let url = str_field(row, "url")?.to_string();
            Ok(CanonicalNewsArticle {
                id: CanonicalNewsArticle::id_for_url(&url),
                title: str_field(row, "title")?.to_string(),
                description: row
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_string(),
                url,
                source_name: row
                    .get("source")
                    .and_then(|s| s.get("name"))
                    .and_then(|n| n.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                published_at: parse_published_at(str_field(row, "publishedAt")?)?,
                sentiment: NewsSentiment::Unknown,
                source_provider_id: provider_id.to_string(),
            })
        })
        .collect()
}

pub fn parse_news(
    parser_id: &str,
    body: &serde_json::Value,
    provider_id: &str,
) -> Result<Vec<CanonicalNewsArticle>, GatewayError> {
    match parser_id {
        "cryptopanic_news" => parse_cryptopanic_news(body, provider_id),
        "newsapi_news" => parse_newsapi_news(body, provider_id),
        other => Err(GatewayError::ParseError(format!(
            "parser_id {} is not a news normalizer",
            other
        ))),
    }
}

fn parse_chain(raw: &str) -> Result<Chain, GatewayError> {
    match raw.to_lowercase().as_str() {
        "ethereum" | "eth" => Ok(Chain::Ethereum),
        "bsc" | "binance-smart-chain" => Ok(Chain::Bsc),
        "tron" | "trx" => Ok(Chain::Tron),
        "bitcoin" | "btc" => Ok(Chain::Bitcoin),
        "polygon" | "matic" => Ok(Chain::Polygon),
        other => Err(GatewayError::ParseError(format!("unknown chain: {}", other))),
    }
}

/// `whalealert_tx`: `{transactions: [{hash, blockchain, from: {address}, to:
/// {address}, amount, amount_usd, timestamp}]}` (`timestamp` is unix
/// seconds).
fn parse_whalealert_tx(
    body: &serde_json::Value,
    provider_id: &str,
) -> Result<Vec<CanonicalWhaleTx>, GatewayError> {
    let arr = body
        .get("transactions")
        .and_then(|t| t.as_array())
        .ok_or_else(|| GatewayError::ParseError("missing transactions array".into()))?;
    arr.iter()
        .map(|row| {
            let ts = row
                .get("timestamp")
                .and_then(|t| t.as_i64())
                .ok_or_else(|| GatewayError::ParseError("missing timestamp".into()))?;
            Ok(CanonicalWhaleTx {
                tx_hash: str_field(row, "hash")?.to_string(),
                chain: parse_chain(str_field(row, "blockchain")?)?,
                from: row
                    .get("from")
                    .and_then(|f| f.get("address"))
                    .and_then(|a| a.as_str())
                    .unwrap_or_default()
                    .to_string(),
                to: row
                    .get("to")
                    .and_then(|t| t.get("address"))
                    .and_then(|a| a.as_str())
                    .unwrap_or_default()
                    .to_string(),
                amount_native: opt_num(row.get("amount"))?,
                amount_usd: opt_num(row.get("amount_usd"))?,
                timestamp: Utc
                    .timestamp_opt(ts, 0)
                    .single()
                    .ok_or_else(|| GatewayError::ParseError("invalid timestamp".into()))?,
                source_provider_id: provider_id.to_string(),
            })
        })
        .collect()
}

pub fn parse_whales(
    parser_id: &str,
    body: &serde_json::Value,
    provider_id: &str,
) -> Result<Vec<CanonicalWhaleTx>, GatewayError> {
    match parser_id {
        "whalealert_tx" => parse_whalealert_tx(body, provider_id),
        other => Err(GatewayError::ParseError(format!(
            "parser_id {} is not a whales normalizer",
            other
        ))),
    }
}

/// Historical candles reuse the market category's provider chain but a
/// distinct response shape: `{candles: [[t,o,h,l,c,v], ...]}`
/// (`coingecko_markets`-style OHLCV arrays).
pub fn parse_candles(body: &serde_json::Value) -> Result<Vec<Candle>, GatewayError> {
    let arr = body
        .get("candles")
        .and_then(|c| c.as_array())
        .ok_or_else(|| GatewayError::ParseError("missing candles array".into()))?;
    arr.iter()
        .map(|row| {
            let row = row
                .as_array()
                .ok_or_else(|| GatewayError::ParseError("candle row is not an array".into()))?;
            if row.len() < 6 {
                return Err(GatewayError::ParseError("candle row too short".into()));
            }
            Ok(Candle {
                t: row[0]
                    .as_i64()
                    .ok_or_else(|| GatewayError::ParseError("candle t not an integer".into()))?,
                open: num(&row[1])?,
                high: num(&row[2])?,
                low: num(&row[3])?,
                close: num(&row[4])?,
                volume: num(&row[5])?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coingecko_markets_parses_and_rejects_nan() {
        let body = json!([{"symbol":"btc","name":"Bitcoin","current_price":50000.0,"price_change_percentage_24h":1.5,"total_volume":1e9,"market_cap":1e12}]);
        let prices = parse_market("coingecko_markets", &body, "cg").unwrap();
        assert_eq!(prices[0].symbol, "BTC");
        assert_eq!(prices[0].price_usd, 50000.0);

        let bad = json!([{"symbol":"btc","name":"Bitcoin","current_price":"nan"}]);
        assert!(parse_market("coingecko_markets", &bad, "cg").is_err());
    }

    #[test]
    fn coinmarketcap_listings_parses_nested_quote() {
        let body = json!({"data":[{"symbol":"ETH","name":"Ethereum","quote":{"USD":{"price":3000.0,"percent_change_24h":-2.0,"volume_24h":5e8,"market_cap":4e11}}}]});
        let prices = parse_market("coinmarketcap_listings", &body, "cmc").unwrap();
        assert_eq!(prices[0].symbol, "ETH");
        assert_eq!(prices[0].change_24h_pct, -2.0);
    }

    #[test]
    fn alternativeme_fng_derives_label_from_value() {
        let body = json!({"data":[{"value":"18","value_classification":"Extreme Fear"}]});
        let s = parse_sentiment("alternativeme_fng", &body, "altme").unwrap();
        assert_eq!(s.fear_greed_value, 18);
        assert_eq!(s.fear_greed_label, crate::types::FearGreedLabel::ExtremeFear);
    }

    #[test]
    fn newsapi_news_parses_articles() {
        let body = json!({"articles":[{"title":"t","description":"d","url":"https://x/1","source":{"name":"X"},"publishedAt":"2024-01-01T00:00:00Z"}]});
        let articles = parse_news("newsapi_news", &body, "newsapi").unwrap();
        assert_eq!(articles[0].source_name, "X");
        assert_eq!(articles[0].id, CanonicalNewsArticle::id_for_url("https://x/1"));
    }

    #[test]
    fn whalealert_tx_parses_chain_and_timestamp() {
        let body = json!({"transactions":[{"hash":"0xabc","blockchain":"ethereum","from":{"address":"0x1"},"to":{"address":"0x2"},"amount":100.0,"amount_usd":50000.0,"timestamp":1700000000}]});
        let txs = parse_whales("whalealert_tx", &body, "whalealert").unwrap();
        assert_eq!(txs[0].chain, Chain::Ethereum);
    }

    #[test]
    fn unknown_chain_is_a_parse_error() {
        let body = json!({"transactions":[{"hash":"0xabc","blockchain":"dogecoin","from":{"address":"0x1"},"to":{"address":"0x2"},"amount":1.0,"amount_usd":1.0,"timestamp":1700000000}]});
        assert!(parse_whales("whalealert_tx", &body, "whalealert").is_err());
    }

    #[test]
    fn candles_parse_ohlcv_rows() {
        let body = json!({"candles":[[1700000000000i64,1.0,2.0,0.5,1.5,1000.0]]});
        let candles = parse_candles(&body).unwrap();
        assert_eq!(candles[0].close, 1.5);
    }
}
