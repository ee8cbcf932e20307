//! Provider clients and error classification.
//!
//! A [`ProviderClient`] is the uniform interface to one upstream
//! text-generation backend. Expected failure modes are typed
//! ([`ProviderError`]) and never surface as panics; the fallback chain
//! turns them into retry or chain-advancement decisions.

mod openai_compat;
mod scripted;

pub use openai_compat::OpenAiCompatClient;
pub use scripted::{ScriptedProvider, ScriptedStep};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::{Event, EventSink};
use crate::request::Budget;

/// Error from one provider attempt.
///
/// `RateLimited`, `Timeout`, and `Unavailable` are retryable within a link;
/// `Unauthorized` and `InvalidResponse` immediately advance the chain.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited: {message}")]
    RateLimited {
        /// Suggested delay from the Retry-After header, if present.
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("provider attempt timed out")]
    Timeout,

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl ProviderError {
    /// Whether retrying the same provider can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::RateLimited { .. } | Self::Timeout
        )
    }

    /// Short stable identifier for events, journal records, and logs.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout => "timeout",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Unauthorized(_) => "unauthorized",
        }
    }

    /// Delay before the next attempt.
    ///
    /// Uses `retry_after` when the provider supplied one, otherwise
    /// exponential backoff with deterministic jitter, capped at 60 seconds.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Self::RateLimited {
            retry_after: Some(retry_after),
            ..
        } = self
        {
            return *retry_after;
        }

        let base_secs: u64 = match self {
            Self::RateLimited { .. } => 5,
            Self::Unavailable(_) => 2,
            _ => 1,
        };

        let multiplier = 2u64.saturating_pow(attempt);
        let delay_secs = base_secs.saturating_mul(multiplier);

        // Deterministic jitter keeps fallback behavior reproducible.
        let jitter_range = delay_secs / 4;
        let jitter = if jitter_range > 0 {
            (attempt as u64 * 7) % jitter_range
        } else {
            0
        };

        Duration::from_secs(delay_secs.saturating_add(jitter).min(60))
    }
}

/// Map an HTTP status code to a provider error.
pub fn classify_http_status(status: u16, body: &str, retry_after: Option<Duration>) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited {
            retry_after,
            message: body.to_string(),
        },
        401 | 403 => ProviderError::Unauthorized(body.to_string()),
        408 | 504 => ProviderError::Timeout,
        400..=499 => ProviderError::InvalidResponse(format!("HTTP {status}: {body}")),
        _ => ProviderError::Unavailable(format!("HTTP {status}: {body}")),
    }
}

/// Uniform interface to one upstream text-generation backend.
///
/// Implementations must be safe to invoke concurrently from independent
/// requests: either no shared mutable state, or internally synchronized.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Single-shot generation.
    async fn generate(&self, prompt: &str, budget: &Budget) -> Result<String, ProviderError>;

    /// Streaming generation: ordered `Token` events flow into `sink` as they
    /// become available; the accumulated text is returned on success.
    ///
    /// The default implementation degrades to a single-shot call followed by
    /// one token event, for backends without a streaming surface.
    async fn generate_stream(
        &self,
        prompt: &str,
        budget: &Budget,
        sink: &dyn EventSink,
    ) -> Result<String, ProviderError> {
        let text = self.generate(prompt, budget).await?;
        sink.emit(Event::Token { text: text.clone() });
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Unavailable("503".into()).is_retryable());
        assert!(ProviderError::RateLimited {
            retry_after: None,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Unauthorized("bad key".into()).is_retryable());
        assert!(!ProviderError::InvalidResponse("garbage".into()).is_retryable());
    }

    #[test]
    fn http_status_classification() {
        assert_eq!(classify_http_status(429, "", None).kind_str(), "rate_limited");
        assert_eq!(classify_http_status(401, "", None).kind_str(), "unauthorized");
        assert_eq!(classify_http_status(403, "", None).kind_str(), "unauthorized");
        assert_eq!(classify_http_status(500, "", None).kind_str(), "unavailable");
        assert_eq!(classify_http_status(503, "", None).kind_str(), "unavailable");
        assert_eq!(classify_http_status(504, "", None).kind_str(), "timeout");
        assert_eq!(
            classify_http_status(400, "", None).kind_str(),
            "invalid_response"
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        let err = ProviderError::Unavailable("down".into());
        let d0 = err.suggested_delay(0);
        let d1 = err.suggested_delay(1);
        let d2 = err.suggested_delay(2);
        assert!(d1 > d0);
        assert!(d2 > d1);
        assert!(err.suggested_delay(12) <= Duration::from_secs(60));
    }

    #[test]
    fn backoff_saturates_at_extreme_attempt_counts() {
        // 2^62 and beyond must saturate, not overflow; the cap still applies.
        let err = ProviderError::RateLimited {
            retry_after: None,
            message: String::new(),
        };
        assert_eq!(err.suggested_delay(62), Duration::from_secs(60));
        assert_eq!(err.suggested_delay(u32::MAX), Duration::from_secs(60));

        let err = ProviderError::Unavailable("down".into());
        assert_eq!(err.suggested_delay(64), Duration::from_secs(60));
    }

    #[test]
    fn retry_after_wins_over_backoff() {
        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
            message: String::new(),
        };
        assert_eq!(err.suggested_delay(0), Duration::from_secs(30));
        assert_eq!(err.suggested_delay(5), Duration::from_secs(30));
    }
}
