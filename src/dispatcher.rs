//! Dispatcher (G) — the heart. Orchestrates the registry, rate limiter,
//! circuit breaker, cache, HTTP client, and normalizers to execute one
//! logical request across a category's fallback chain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::breaker::{Admission, BreakerRegistry, BreakerState};
use crate::cache::ResponseCache;
use crate::config::GatewayConfig;
use crate::error::{AttemptRecord, GatewayError, Outcome};
use crate::http_client::{FetchOutcome, HttpClient};
use crate::metrics;
use crate::ratelimit::RateLimiterRegistry;
use crate::registry::Registry;
use crate::types::Category;

/// Rolling success bookkeeping for `/health`, per provider. Kept
/// deliberately simple: a cumulative counter plus last-success timestamp is
/// enough to answer "has this provider succeeded recently" without a
/// time-bucketed histogram.
struct ProviderHealth {
    total: AtomicU64,
    success: AtomicU64,
    last_ok_at: Mutex<Option<Instant>>,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            last_ok_at: Mutex::new(None),
        }
    }

    fn record(&self, ok: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.success.fetch_add(1, Ordering::Relaxed);
            *self.last_ok_at.lock() = Some(Instant::now());
        }
    }

    fn success_rate(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        self.success.load(Ordering::Relaxed) as f64 / total as f64
    }

    fn last_ok_age(&self) -> Option<Duration> {
        self.last_ok_at.lock().as_ref().map(|t| t.elapsed())
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    breakers: BreakerRegistry,
    rate_limiters: RateLimiterRegistry,
    cache: ResponseCache,
    http: HttpClient,
    config: GatewayConfig,
    health: HashMap<String, ProviderHealth>,
}

/// A logical request: which category, which upstream params to use once a
/// provider is chosen, and the parser to run on success. Owns its strings so
/// it can be moved whole into the cache's single-flight future.
///
/// `path_override` is used when every provider in the chain must hit the
/// same literal path regardless of its own `default_path` (e.g. a
/// category-specific sub-resource); leave empty to use each provider's own
/// `default_path`.
pub struct LogicalRequest {
    pub category: Category,
    pub cache_method: String,
    pub cache_params: Vec<(String, String)>,
    pub path_override: String,
    pub fetch_params: Vec<(String, String)>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, config: GatewayConfig) -> Self {
        let all_ids: Vec<String> = registry
            .all_categories()
            .flat_map(|c| registry.chain_for(c).iter().map(|s| s.id.clone()).collect::<Vec<_>>())
            .collect();
        let specs: Vec<_> = all_ids
            .iter()
            .filter_map(|id| registry.get(id).cloned())
            .collect();
        let breakers = BreakerRegistry::new(
            all_ids.iter().cloned(),
            config.breaker_failure_threshold,
            Duration::from_millis(config.breaker_open_ms),
        );
        let rate_limiters = RateLimiterRegistry::new(&specs);
        let health = all_ids.into_iter().map(|id| (id, ProviderHealth::new())).collect();
        let cache = ResponseCache::new(config.cache_max_entries);
        let http = HttpClient::new(config.upstream_timeout_ms);

        Self {
            registry,
            breakers,
            rate_limiters,
            cache,
            http,
            config,
            health,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn health_snapshot(&self, category: Category) -> Vec<(String, BreakerState, f64, Option<Duration>)> {
        self.registry
            .chain_for(category)
            .iter()
            .map(|spec| {
                let breaker_state = self
                    .breakers
                    .get(&spec.id)
                    .map(|b| b.state())
                    .unwrap_or(BreakerState::Closed);
                let h = self.health.get(&spec.id);
                let rate = h.map(|h| h.success_rate()).unwrap_or(1.0);
                let age = h.and_then(|h| h.last_ok_age());
                (spec.id.clone(), breaker_state, rate, age)
            })
            .collect()
    }

    pub fn bucket_tokens(&self, provider_id: &str) -> Option<f64> {
        self.rate_limiters.current_tokens(provider_id)
    }

    /// Runs a logical request through the cache (single-flight) and, on a
    /// miss, through the fallback chain (§4.6).
    ///
    /// Takes `self` behind an `Arc` so the cache's single-flight future,
    /// which may outlive the calling coalesced request, can hold its own
    /// owned handle to the dispatcher rather than borrowing across the
    /// `.await`.
    pub async fn dispatch<T>(
        self: &Arc<Self>,
        req: LogicalRequest,
        ttl: Duration,
        parse: impl Fn(&str, &serde_json::Value, &str) -> Result<T, GatewayError> + Send + Sync + 'static,
    ) -> Result<(T, String), GatewayError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let key = ResponseCache::fingerprint(req.category.as_str(), &req.cache_method, &as_str_pairs(&req.cache_params));
        // source_provider_id travels alongside T via a tagged envelope so the
        // single-flight cache can still hand back who ultimately answered.
        #[derive(serde::Serialize, serde::Deserialize, Clone)]
        struct Tagged<T> {
            value: T,
            source: String,
        }

        let dispatcher = Arc::clone(self);
        let tagged = self
            .cache
            .get_or_fetch(key, ttl, move || async move {
                let (value, source) = dispatcher.run_chain(&req, &parse).await?;
                Ok(Tagged { value, source })
            })
            .await?;
        Ok((tagged.value, tagged.source))
    }

    async fn run_chain<T>(
        &self,
        req: &LogicalRequest,
        parse: &(impl Fn(&str, &serde_json::Value, &str) -> Result<T, GatewayError> + Send + Sync),
    ) -> Result<(T, String), GatewayError> {
        let chain = self.registry.chain_for(req.category);
        let mut attempts = Vec::new();

        for (idx, provider) in chain.iter().enumerate() {
            let is_last = idx + 1 == chain.len();
            let breaker = self.breakers.get(&provider.id);

            let admission = breaker.map(|b| b.admit()).unwrap_or(Admission::Allowed);
            if admission == Admission::Rejected {
                metrics::record_request(&provider.id, Outcome::SkippedOpen);
                attempts.push(AttemptRecord {
                    provider_id: provider.id.clone(),
                    outcome: Outcome::SkippedOpen.as_label(),
                });
                continue;
            }

            let max_retries = provider.effective_max_retries(self.config.max_retries);
            let path = if req.path_override.is_empty() {
                provider.default_path.clone().unwrap_or_default()
            } else {
                req.path_override.clone()
            };
            let start = Instant::now();
            let fetch_params = as_str_pairs(&req.fetch_params);
            // Every attempt, including retries, draws one token: a retry
            // that finds the bucket empty is a rate-limit skip, not a
            // further HTTP call.
            let fetch_result = self
                .http
                .fetch(
                    provider,
                    &path,
                    &fetch_params,
                    max_retries,
                    || self.rate_limiters.try_acquire(&provider.id, 1.0).ok,
                    |attempt, outcome| {
                        tracing::debug!(
                            provider_id = %provider.id,
                            category = %req.category,
                            outcome = %outcome_label(outcome),
                            latency_ms = start.elapsed().as_millis() as u64,
                            attempt,
                            "provider attempt"
                        );
                    },
                )
                .await;

            let latency_ms = start.elapsed().as_millis() as f64;
            metrics::observe_latency(&provider.id, latency_ms);

            let outcome = match fetch_result {
                Err(e) => {
                    // build_request-level failure (e.g. unresolved auth): treat
                    // as permanent for this provider, not a breaker penalty.
                    attempts.push(AttemptRecord {
                        provider_id: provider.id.clone(),
                        outcome: "config_err",
                    });
                    tracing::debug!(provider_id = %provider.id, error = %e, "provider request could not be built");
                    continue;
                }
                Ok(o) => o,
            };

            match outcome {
                FetchOutcome::RateLimited => {
                    metrics::record_request(&provider.id, Outcome::SkippedRate);
                    attempts.push(AttemptRecord {
                        provider_id: provider.id.clone(),
                        outcome: Outcome::SkippedRate.as_label(),
                    });
                }
                FetchOutcome::Ok(body) => match parse(&provider.parser_id, &body, &provider.id) {
                    Ok(value) => {
                        if let Some(b) = breaker {
                            b.record_success(&provider.id);
                        }
                        if let Some(h) = self.health.get(&provider.id) {
                            h.record(true);
                        }
                        metrics::record_request(&provider.id, Outcome::Ok);
                        return Ok((value, provider.id.clone()));
                    }
                    Err(e) => {
                        if let Some(b) = breaker {
                            b.record_failure(&provider.id);
                        }
                        if let Some(h) = self.health.get(&provider.id) {
                            h.record(false);
                        }
                        metrics::record_request(&provider.id, Outcome::ParseErr);
                        attempts.push(AttemptRecord {
                            provider_id: provider.id.clone(),
                            outcome: Outcome::ParseErr.as_label(),
                        });
                        tracing::debug!(provider_id = %provider.id, error = %e, "parse error");
                    }
                },
                FetchOutcome::Http4xx(status) => {
                    // permanent for this provider, no breaker penalty
                    metrics::record_request(&provider.id, Outcome::Http4xx);
                    attempts.push(AttemptRecord {
                        provider_id: provider.id.clone(),
                        outcome: Outcome::Http4xx.as_label(),
                    });
                    tracing::debug!(provider_id = %provider.id, %status, "permanent upstream error");
                }
                FetchOutcome::Http429 { .. } => {
                    self.rate_limiters.force_empty(&provider.id);
                    metrics::record_request(&provider.id, Outcome::Http429);
                    attempts.push(AttemptRecord {
                        provider_id: provider.id.clone(),
                        outcome: Outcome::Http429.as_label(),
                    });
                    // Counts toward consecutive failures only if this is the
                    // last provider in the chain (§4.6 step 2.d).
                    if is_last {
                        if let Some(b) = breaker {
                            b.record_failure(&provider.id);
                        }
                    }
                    if let Some(h) = self.health.get(&provider.id) {
                        h.record(false);
                    }
                }
                FetchOutcome::Http5xx(_) | FetchOutcome::NetworkErr(_) | FetchOutcome::Timeout => {
                    let label = match outcome {
                        FetchOutcome::Http5xx(_) => Outcome::Http5xx,
                        FetchOutcome::NetworkErr(_) => Outcome::NetworkErr,
                        _ => Outcome::Timeout,
                    };
                    if let Some(b) = breaker {
                        b.record_failure(&provider.id);
                    }
                    if let Some(h) = self.health.get(&provider.id) {
                        h.record(false);
                    }
                    metrics::record_request(&provider.id, label);
                    attempts.push(AttemptRecord {
                        provider_id: provider.id.clone(),
                        outcome: label.as_label(),
                    });
                }
            }
        }

        Err(GatewayError::AllProvidersFailed {
            category: req.category.as_str().to_string(),
            attempts,
        })
    }
}

fn as_str_pairs(pairs: &[(String, String)]) -> Vec<(&str, &str)> {
    pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
}

fn outcome_label(outcome: &FetchOutcome) -> &'static str {
    match outcome {
        FetchOutcome::Ok(_) => "ok",
        FetchOutcome::Http4xx(_) => "http_4xx",
        FetchOutcome::Http429 { .. } => "http_429",
        FetchOutcome::Http5xx(_) => "http_5xx",
        FetchOutcome::NetworkErr(_) => "network_err",
        FetchOutcome::Timeout => "timeout",
        FetchOutcome::RateLimited => "rate_limited",
    }
}
