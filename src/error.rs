//! Central error taxonomy for the gateway.
//!
//! Internal components return narrow `Result` types where it helps the
//! caller branch; everything that can reach the HTTP edge converges on
//! [`GatewayError`], which knows how to render itself as the `{ok:false,
//! error:{...}}` envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Outcome classification for a single outbound attempt to a provider.
///
/// Matches the `outcome` label set of `requests_total{provider,outcome}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Timeout,
    Http4xx,
    Http429,
    Http5xx,
    NetworkErr,
    SkippedOpen,
    SkippedRate,
    ParseErr,
}

impl Outcome {
    pub fn as_label(self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Timeout => "timeout",
            Outcome::Http4xx => "http_4xx",
            Outcome::Http429 => "http_429",
            Outcome::Http5xx => "http_5xx",
            Outcome::NetworkErr => "network_err",
            Outcome::SkippedOpen => "skipped_open",
            Outcome::SkippedRate => "skipped_rate",
            Outcome::ParseErr => "parse_err",
        }
    }
}

/// One entry in an `AllProvidersFailed` attempt log.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub provider_id: String,
    pub outcome: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Network error, timeout, or 5xx from a single provider attempt. Callers
    /// that see this for every provider in a chain escalate to
    /// `AllProvidersFailed`; it should rarely cross the HTTP boundary on its
    /// own.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// Upstream responded 429. Carries a retry-after hint when the provider
    /// supplied one.
    #[error("rate limited by upstream")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Upstream responded with a non-429 4xx. Permanent for this request;
    /// does not penalize the breaker.
    #[error("permanent upstream error: {status}")]
    Permanent { status: u16 },

    /// The provider's breaker is open.
    #[error("circuit breaker open for provider {provider_id}")]
    BreakerOpen { provider_id: String },

    /// The upstream body failed to parse into the canonical shape.
    #[error("failed to parse upstream response: {0}")]
    ParseError(String),

    /// Every provider in the category's fallback chain failed.
    #[error("all providers failed for category {category}")]
    AllProvidersFailed {
        category: String,
        attempts: Vec<AttemptRecord>,
    },

    /// Malformed or out-of-range client input at the HTTP edge.
    #[error("invalid request: {0}")]
    ClientError(String),

    /// Startup/config-time failure (duplicate priority, unknown parser_id,
    /// unreadable provider file). Fatal: the process exits before serving
    /// traffic.
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts: Option<Vec<AttemptRecord>>,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    ok: bool,
    error: ErrorBody,
}

impl GatewayError {
    fn code(&self) -> &'static str {
        match self {
            GatewayError::Transient(_) => "transient_upstream",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Permanent { .. } => "permanent_upstream",
            GatewayError::BreakerOpen { .. } => "breaker_open",
            GatewayError::ParseError(_) => "parse_error",
            GatewayError::AllProvidersFailed { .. } => "all_providers_failed",
            GatewayError::ClientError(_) => "client_error",
            GatewayError::Config(_) => "config_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::ClientError(_) => StatusCode::BAD_REQUEST,
            GatewayError::AllProvidersFailed { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let attempts = match &self {
            GatewayError::AllProvidersFailed { attempts, .. } => Some(attempts.clone()),
            _ => None,
        };
        let body = ErrorEnvelope {
            ok: false,
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
                attempts,
            },
        };
        (status, Json(body)).into_response()
    }
}
