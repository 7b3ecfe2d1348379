//! Canonical data shapes shared across every provider in a category.
//!
//! A normalizer's only job is `upstream_json -> one of these`. Nothing
//! downstream of a normalizer ever sees a provider-specific field name
//! again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Market,
    Sentiment,
    News,
    Whales,
    Explorer,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Market => "market",
            Category::Sentiment => "sentiment",
            Category::News => "news",
            Category::Whales => "whales",
            Category::Explorer => "explorer",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPrice {
    pub symbol: String,
    pub name: String,
    pub price_usd: f64,
    pub change_24h_pct: f64,
    pub volume_24h_usd: f64,
    pub market_cap_usd: f64,
    pub source_provider_id: String,
    pub fetched_at: i64,
}

impl CanonicalPrice {
    /// Builds a price record, rejecting NaN/infinite inputs per the
    /// numeric-cleanliness invariant rather than letting a sentinel through.
    pub fn new(
        symbol: impl Into<String>,
        name: impl Into<String>,
        price_usd: f64,
        change_24h_pct: f64,
        volume_24h_usd: f64,
        market_cap_usd: f64,
        source_provider_id: impl Into<String>,
    ) -> Result<Self, crate::error::GatewayError> {
        for v in [price_usd, change_24h_pct, volume_24h_usd, market_cap_usd] {
            if !v.is_finite() {
                return Err(crate::error::GatewayError::ParseError(
                    "non-finite numeric field in price payload".into(),
                ));
            }
        }
        if price_usd < 0.0 || volume_24h_usd < 0.0 || market_cap_usd < 0.0 {
            return Err(crate::error::GatewayError::ParseError(
                "negative value in field expected to be nonnegative".into(),
            ));
        }
        Ok(Self {
            symbol: symbol.into(),
            name: name.into(),
            price_usd,
            change_24h_pct,
            volume_24h_usd,
            market_cap_usd,
            source_provider_id: source_provider_id.into(),
            fetched_at: now_ms(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FearGreedLabel {
    ExtremeFear,
    Fear,
    Neutral,
    Greed,
    ExtremeGreed,
}

impl FearGreedLabel {
    /// Fixed-threshold derivation from the 0-100 value: the label is never
    /// taken verbatim from upstream, always recomputed here.
    pub fn from_value(value: u8) -> Self {
        match value {
            0..=24 => FearGreedLabel::ExtremeFear,
            25..=44 => FearGreedLabel::Fear,
            45..=55 => FearGreedLabel::Neutral,
            56..=74 => FearGreedLabel::Greed,
            _ => FearGreedLabel::ExtremeGreed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSentiment {
    pub fear_greed_value: u8,
    pub fear_greed_label: FearGreedLabel,
    pub social_score: f64,
    pub source_provider_id: String,
    pub fetched_at: i64,
}

impl CanonicalSentiment {
    pub fn new(
        fear_greed_value: u8,
        social_score: f64,
        source_provider_id: impl Into<String>,
    ) -> Result<Self, crate::error::GatewayError> {
        if !social_score.is_finite() || !(-1.0..=1.0).contains(&social_score) {
            return Err(crate::error::GatewayError::ParseError(
                "social_score out of range or non-finite".into(),
            ));
        }
        let value = fear_greed_value.min(100);
        Ok(Self {
            fear_greed_value: value,
            fear_greed_label: FearGreedLabel::from_value(value),
            social_score,
            source_provider_id: source_provider_id.into(),
            fetched_at: now_ms(),
        })
    }

    /// The static permissive-mode default: value 50, label Neutral (§7).
    pub fn default_degraded() -> Self {
        Self {
            fear_greed_value: 50,
            fear_greed_label: FearGreedLabel::Neutral,
            social_score: 0.0,
            source_provider_id: "default".into(),
            fetched_at: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NewsSentiment {
    Positive,
    Neutral,
    Negative,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalNewsArticle {
    pub id: String,
    pub title: String,
    pub description: String,
    pub url: String,
    pub source_name: String,
    pub published_at: DateTime<Utc>,
    pub sentiment: NewsSentiment,
    pub source_provider_id: String,
}

impl CanonicalNewsArticle {
    /// `id` is a stable hash of the article URL so the same story from the
    /// same provider dedupes across polls.
    pub fn id_for_url(url: &str) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        url.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Bsc,
    Tron,
    Bitcoin,
    Polygon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalWhaleTx {
    pub tx_hash: String,
    pub chain: Chain,
    pub from: String,
    pub to: String,
    pub amount_native: f64,
    pub amount_usd: f64,
    pub timestamp: DateTime<Utc>,
    pub source_provider_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub t: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}
