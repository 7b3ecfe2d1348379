//! HTTP Client with Timeout + Retry (E).
//!
//! A single pooled `reqwest::Client` shared across every provider, the way
//! this codebase's proxy layer holds one client instead of one per
//! destination. Retry/backoff policy lives entirely here; call sites (the
//! dispatcher) never retry themselves.

use std::time::Duration;

use reqwest::StatusCode;

use crate::config::{AuthSpec, ProviderSpec};

/// Outcome of one upstream HTTP attempt, already classified per §4.6 so the
/// dispatcher doesn't need to look at status codes itself.
pub enum FetchOutcome {
    Ok(serde_json::Value),
    Http4xx(StatusCode),
    Http429 { retry_after_ms: Option<u64> },
    Http5xx(StatusCode),
    NetworkErr(String),
    Timeout,
    /// No token available for this attempt. Distinct from `Http429`: the
    /// provider was never actually called.
    RateLimited,
}

pub struct HttpClient {
    client: reqwest::Client,
    default_timeout_ms: u64,
    base_backoff_ms: u64,
}

impl HttpClient {
    pub fn new(default_timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("reqwest client builds with default TLS backend");
        Self {
            client,
            default_timeout_ms,
            base_backoff_ms: 1000,
        }
    }

    fn build_request(
        &self,
        provider: &ProviderSpec,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<reqwest::RequestBuilder, crate::error::GatewayError> {
        let url = format!(
            "{}{}",
            provider.base_url.trim_end_matches('/'),
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{}", path)
            }
        );
        let timeout = Duration::from_millis(provider.effective_timeout_ms(self.default_timeout_ms));
        let mut builder = self.client.get(&url).timeout(timeout).query(params);

        if let Some((name, value)) = provider.resolve_auth()? {
            builder = match provider.auth {
                AuthSpec::Header { .. } => builder.header(name, value),
                AuthSpec::Query { .. } => builder.query(&[(name, value)]),
                AuthSpec::None => builder,
            };
        }
        Ok(builder)
    }

    /// A single attempt, no retry. Callers that want retry use `fetch`.
    async fn attempt(
        &self,
        provider: &ProviderSpec,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<FetchOutcome, crate::error::GatewayError> {
        let request = self.build_request(provider, path, params)?;
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Ok(FetchOutcome::Timeout),
            Err(e) => return Ok(FetchOutcome::NetworkErr(e.to_string())),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Ok(FetchOutcome::Http429 { retry_after_ms });
        }
        if status.is_server_error() {
            return Ok(FetchOutcome::Http5xx(status));
        }
        if status.is_client_error() {
            return Ok(FetchOutcome::Http4xx(status));
        }
        match response.json::<serde_json::Value>().await {
            Ok(body) => Ok(FetchOutcome::Ok(body)),
            Err(e) => Ok(FetchOutcome::NetworkErr(format!("invalid json body: {}", e))),
        }
    }

    /// `fetch` from §4.5: up to `max_retries` attempts, exponential backoff
    /// `base * 2^(attempt-1)`, retrying only network error/timeout/5xx.
    /// 429 is returned immediately without an inner retry; the caller
    /// (dispatcher) decides whether to move to the next provider.
    ///
    /// `try_acquire` is called before every attempt, including retries, so a
    /// provider configured for `max_retries > 1` can never issue more HTTP
    /// attempts than tokens it actually drained from its bucket: a retry
    /// that finds the bucket empty stops the chain for this provider with
    /// `FetchOutcome::RateLimited` instead of calling out anyway.
    pub async fn fetch(
        &self,
        provider: &ProviderSpec,
        path: &str,
        params: &[(&str, &str)],
        max_retries: u32,
        mut try_acquire: impl FnMut() -> bool,
        mut on_attempt: impl FnMut(u32, &FetchOutcome),
    ) -> Result<FetchOutcome, crate::error::GatewayError> {
        let mut attempt = 1;
        loop {
            if !try_acquire() {
                let outcome = FetchOutcome::RateLimited;
                on_attempt(attempt, &outcome);
                return Ok(outcome);
            }

            let outcome = self.attempt(provider, path, params).await?;
            on_attempt(attempt, &outcome);

            let retryable = matches!(
                outcome,
                FetchOutcome::NetworkErr(_) | FetchOutcome::Timeout | FetchOutcome::Http5xx(_)
            );
            if !retryable || attempt >= max_retries {
                return Ok(outcome);
            }
            let backoff_ms = self.base_backoff_ms * 2u64.pow(attempt - 1);
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            attempt += 1;
        }
    }
}
