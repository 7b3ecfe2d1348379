//! Rate Limiter (B): one continuous-refill token bucket per provider.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::RateLimitSpec;

#[derive(Debug, Clone, Copy)]
pub struct AcquireResult {
    pub ok: bool,
    pub retry_after_ms: u64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single provider's token bucket, parameterized by `(max_tokens,
/// refill_per_window, window_ms)` from its `ProviderSpec`.
pub struct TokenBucket {
    spec: RateLimitSpec,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(spec: RateLimitSpec) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: spec.max_tokens,
                last_refill: Instant::now(),
            }),
            spec,
        }
    }

    fn refill_locked(&self, state: &mut BucketState) {
        let elapsed_ms = state.last_refill.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms <= 0.0 {
            return;
        }
        let refill = elapsed_ms / self.spec.window_ms as f64 * self.spec.refill_per_window;
        state.tokens = (state.tokens + refill).min(self.spec.max_tokens);
        state.last_refill = Instant::now();
    }

    /// Atomically refills then attempts to withdraw `n` tokens. Non-ok is a
    /// "skip this provider now" signal, never a hard failure.
    pub fn try_acquire(&self, n: f64) -> AcquireResult {
        let mut state = self.state.lock();
        self.refill_locked(&mut state);
        if state.tokens >= n {
            state.tokens -= n;
            AcquireResult {
                ok: true,
                retry_after_ms: 0,
            }
        } else {
            let deficit = n - state.tokens;
            let retry_after_ms =
                (deficit * self.spec.window_ms as f64 / self.spec.refill_per_window).ceil() as u64;
            AcquireResult {
                ok: false,
                retry_after_ms,
            }
        }
    }

    /// Drains the bucket to zero. Used when a provider responds 429, to
    /// avoid hammering it again before the breaker or caller moves on.
    pub fn force_empty(&self) {
        let mut state = self.state.lock();
        self.refill_locked(&mut state);
        state.tokens = 0.0;
    }

    pub fn current_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill_locked(&mut state);
        state.tokens
    }
}

/// Registry of token buckets keyed by provider id, built once at startup
/// alongside the breaker registry and shared by the dispatcher.
pub struct RateLimiterRegistry {
    buckets: HashMap<String, TokenBucket>,
}

impl RateLimiterRegistry {
    pub fn new(specs: &[crate::config::ProviderSpec]) -> Self {
        let buckets = specs
            .iter()
            .map(|s| (s.id.clone(), TokenBucket::new(s.rate_limit.clone())))
            .collect();
        Self { buckets }
    }

    pub fn try_acquire(&self, provider_id: &str, n: f64) -> AcquireResult {
        match self.buckets.get(provider_id) {
            Some(bucket) => {
                let result = bucket.try_acquire(n);
                crate::metrics::set_bucket_tokens(provider_id, bucket.current_tokens());
                result
            }
            None => AcquireResult {
                ok: true,
                retry_after_ms: 0,
            },
        }
    }

    pub fn force_empty(&self, provider_id: &str) {
        if let Some(bucket) = self.buckets.get(provider_id) {
            bucket.force_empty();
            crate::metrics::set_bucket_tokens(provider_id, bucket.current_tokens());
        }
    }

    pub fn current_tokens(&self, provider_id: &str) -> Option<f64> {
        self.buckets.get(provider_id).map(|b| b.current_tokens())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(max_tokens: f64, refill_per_window: f64, window_ms: u64) -> RateLimitSpec {
        RateLimitSpec {
            max_tokens,
            refill_per_window,
            window_ms,
        }
    }

    #[test]
    fn starts_full() {
        let bucket = TokenBucket::new(spec(5.0, 5.0, 1000));
        assert_eq!(bucket.current_tokens(), 5.0);
    }

    #[test]
    fn acquire_drains_and_blocks_at_zero() {
        let bucket = TokenBucket::new(spec(2.0, 1.0, 1000));
        assert!(bucket.try_acquire(1.0).ok);
        assert!(bucket.try_acquire(1.0).ok);
        let third = bucket.try_acquire(1.0);
        assert!(!third.ok);
        assert!(third.retry_after_ms > 0);
    }

    #[test]
    fn never_exceeds_max_tokens() {
        let bucket = TokenBucket::new(spec(2.0, 100.0, 1000));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(bucket.current_tokens() <= 2.0);
    }

    #[test]
    fn force_empty_drains_to_zero() {
        let bucket = TokenBucket::new(spec(5.0, 5.0, 1000));
        bucket.force_empty();
        assert_eq!(bucket.current_tokens(), 0.0);
    }

    #[test]
    fn two_concurrent_acquires_both_succeed_iff_two_tokens_available() {
        let bucket = TokenBucket::new(spec(2.0, 0.0, 1000));
        assert!(bucket.try_acquire(1.0).ok);
        assert!(bucket.try_acquire(1.0).ok);
        assert!(!bucket.try_acquire(1.0).ok);
    }

    #[test]
    fn unknown_provider_in_registry_defaults_to_ok() {
        let registry = RateLimiterRegistry::new(&[]);
        assert!(registry.try_acquire("ghost", 1.0).ok);
    }
}
