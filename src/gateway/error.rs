//! Failures from a single provider call, classified for the retry policy.

use std::time::Duration;
use thiserror::Error;

/// Which side imposed a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitSource {
    /// No token was free in the in-process limiter within the attempt deadline.
    Local,
    /// HTTP 429 from the provider.
    Remote,
}

/// Diagnostics lifted from a failed HTTP response.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// `error.code` from the response body, e.g. "rate_limit_exceeded".
    pub provider_code: Option<String>,
    /// `x-request-id` header.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(self, status: u16) -> Self {
        Self {
            http_status: Some(status),
            ..self
        }
    }

    pub fn with_code(self, code: impl Into<String>) -> Self {
        Self {
            provider_code: Some(code.into()),
            ..self
        }
    }

    pub fn with_request_id(self, id: impl Into<String>) -> Self {
        Self {
            request_id: Some(id.into()),
            ..self
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited ({limit_source:?}), retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        limit_source: RateLimitSource,
        context: Option<ErrorContext>,
    },

    /// The request could not be built or sent as given.
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Model refusal or content-policy block. Retrying the same prompt will not help.
    #[error("refused: {message}")]
    Refused {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Non-success response or unusable body. `retryable` is set for 5xx.
    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Missing key, unknown provider, rejected credentials.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn rate_limited_local(retry_after: Duration) -> Self {
        Self::RateLimited {
            retry_after,
            limit_source: RateLimitSource::Local,
            context: None,
        }
    }

    pub fn rate_limited_remote(retry_after: Duration, context: ErrorContext) -> Self {
        Self::RateLimited {
            retry_after,
            limit_source: RateLimitSource::Remote,
            context: Some(context),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: None,
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::Refused {
            message: message.into(),
            context: None,
        }
    }

    pub fn provider(provider: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: None,
        }
    }

    pub fn provider_with_context(
        provider: &'static str,
        message: impl Into<String>,
        retryable: bool,
        context: ErrorContext,
    ) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: Some(context),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::Timeout(after)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Transient failures worth another attempt: rate limits, timeouts, 5xx and
    /// connection-level transport errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::InvalidRequest { .. } | Self::Refused { .. } | Self::Config(_) => false,
        }
    }

    /// Minimum wait before the next attempt, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Stable snake_case tag written to usage records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { limit_source, .. } => match limit_source {
                RateLimitSource::Local => "rate_limited_local",
                RateLimitSource::Remote => "rate_limited_remote",
            },
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Refused { .. } => "refused",
            Self::Provider { .. } => "provider_error",
            Self::Timeout(_) => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::InvalidRequest { context, .. }
            | Self::Refused { context, .. }
            | Self::Provider { context, .. } => context.as_ref(),
            Self::Timeout(_) | Self::Http(_) | Self::Config(_) => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context()?.request_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_by_kind() {
        assert!(ProviderError::timeout(Duration::from_secs(1)).is_retryable());
        assert!(ProviderError::rate_limited_local(Duration::from_millis(5)).is_retryable());
        assert!(ProviderError::provider("openai", "502", true).is_retryable());
        assert!(!ProviderError::provider("openai", "bad json", false).is_retryable());
        assert!(!ProviderError::refused("no").is_retryable());
        assert!(!ProviderError::config("missing key").is_retryable());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let err = ProviderError::rate_limited_remote(Duration::from_secs(3), ErrorContext::new());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(err.code(), "rate_limited_remote");
        assert_eq!(ProviderError::timeout(Duration::from_secs(1)).retry_after(), None);
    }

    #[test]
    fn request_id_comes_from_response_context() {
        let ctx = ErrorContext::new().with_status(502).with_request_id("req-9");
        let err = ProviderError::provider_with_context("fireworks", "bad gateway", true, ctx);
        assert_eq!(err.request_id(), Some("req-9"));
        assert_eq!(err.code(), "provider_error");
        assert_eq!(ProviderError::timeout(Duration::from_secs(1)).request_id(), None);
    }
}
