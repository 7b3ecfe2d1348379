//! Response Cache (D): per-key TTL with single-flight coalescing and LRU
//! eviction at a size bound.
//!
//! Built on `moka::future::Cache`, the same way `borsa-middleware`'s
//! `MokaStore` wraps moka for its own response cache: moka's
//! `get_with`/`try_get_with` already implement single-flight (concurrent
//! callers for the same key share one in-flight future) and size-bounded
//! LRU-ish (TinyLFU) eviction, so the coalescing/eviction contract of §4.4
//! falls out of the library rather than being hand-rolled.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use moka::Expiry;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::GatewayError;

#[derive(Clone)]
struct Entry {
    value: serde_json::Value,
    ttl: Duration,
}

struct PerEntryExpiry;

impl Expiry<String, Entry> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub struct ResponseCache {
    inner: Cache<String, Entry>,
    /// Keys with a fetch currently in flight, tracked only so `get_or_fetch`
    /// can tell a genuinely coalesced caller (key already in this set when it
    /// arrives) apart from the caller that actually misses and fetches.
    inflight: Mutex<HashSet<String>>,
}

impl ResponseCache {
    pub fn new(max_entries: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryExpiry)
            .build();
        Self { inner, inflight: Mutex::new(HashSet::new()) }
    }

    /// Builds a stable fingerprint for a logical request: category + method
    /// + sorted params, matching the cache-key contract of §4.4.
    pub fn fingerprint(category: &str, method: &str, params: &[(&str, &str)]) -> String {
        let mut sorted: Vec<&(&str, &str)> = params.iter().collect();
        sorted.sort_by_key(|(k, _)| *k);
        let joined = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}:{}:{}", category, method, joined)
    }

    /// `get_or_fetch` from §4.4: return a live entry, wait on an in-flight
    /// fetch for the same key, or run `fetcher` exactly once and populate
    /// the entry. Fetch failures are not cached and propagate to every
    /// coalesced caller.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        key: String,
        ttl: Duration,
        fetcher: F,
    ) -> Result<T, GatewayError>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        // If another caller is already fetching this key, this call is a
        // coalesced wait rather than a fresh miss.
        let already_inflight = !self.inflight.lock().insert(key.clone());
        if already_inflight {
            crate::metrics::record_inflight_coalesced();
        }

        let fetched = Arc::new(AtomicBool::new(false));
        let fetched_marker = Arc::clone(&fetched);
        let result = self
            .inner
            .try_get_with(key.clone(), async move {
                fetched_marker.store(true, Ordering::Relaxed);
                let value = fetcher().await?;
                let json = serde_json::to_value(&value)
                    .map_err(|e| GatewayError::ParseError(e.to_string()))?;
                Ok::<Entry, GatewayError>(Entry { value: json, ttl })
            })
            .await;

        self.inflight.lock().remove(&key);
        if fetched.load(Ordering::Relaxed) {
            crate::metrics::record_cache_miss();
        } else if !already_inflight {
            crate::metrics::record_cache_hit();
        }

        match result {
            Ok(entry) => serde_json::from_value(entry.value)
                .map_err(|e| GatewayError::ParseError(e.to_string())),
            Err(shared) => Err(Arc::try_unwrap(shared).unwrap_or_else(|arc| match &*arc {
                GatewayError::AllProvidersFailed { category, attempts } => {
                    GatewayError::AllProvidersFailed {
                        category: category.clone(),
                        attempts: attempts.clone(),
                    }
                }
                other => GatewayError::Transient(other.to_string()),
            })),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }
}

/// Default per-category TTLs (§4.4).
pub mod ttl {
    use std::time::Duration;

    pub const PRICES: Duration = Duration::from_secs(10);
    pub const SENTIMENT: Duration = Duration::from_secs(300);
    pub const NEWS: Duration = Duration::from_secs(300);
    pub const WHALES: Duration = Duration::from_secs(30);

    /// Overview combines all four categories; its freshness window is the
    /// tightest of its constituents.
    pub fn overview() -> Duration {
        [PRICES, SENTIMENT, NEWS, WHALES].into_iter().min().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fingerprint_is_stable_regardless_of_param_order() {
        let a = ResponseCache::fingerprint("market", "quotes", &[("symbols", "BTC,ETH"), ("limit", "5")]);
        let b = ResponseCache::fingerprint("market", "quotes", &[("limit", "5"), ("symbols", "BTC,ETH")]);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_fetches() {
        let cache = Arc::new(ResponseCache::new(100));
        let calls = Arc::new(AtomicU32::new(0));
        let key = "k".to_string();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(key, Duration::from_secs(10), || {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<i32, GatewayError>(42)
                        }
                    })
                    .await
                    .unwrap()
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_hit_returns_live_entry() {
        let cache = ResponseCache::new(100);
        let v = cache
            .get_or_fetch("k".to_string(), Duration::from_secs(10), || async {
                Ok::<i32, GatewayError>(7)
            })
            .await
            .unwrap();
        assert_eq!(v, 7);
        let v2 = cache
            .get_or_fetch("k".to_string(), Duration::from_secs(10), || async {
                Ok::<i32, GatewayError>(999)
            })
            .await
            .unwrap();
        assert_eq!(v2, 7, "second call must hit the cached value, not re-fetch");
    }
}
