//! Provider gateway for chat completions.
//!
//! One call through [`ProviderGateway`] is one attempt: it waits for the
//! provider's rate-limit token, enforces the per-attempt deadline, and records
//! usage. Retrying is the structured-call layer's job (see [`RetryPolicy`]).

pub mod error;
pub mod provider;
pub mod rate_limit;
pub mod retry;
pub mod types;
pub mod usage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use provider::{ChatProvider, HttpChatAdapter};
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError, RateLimitSource};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Deadline for a single attempt; also the longest wait for a local rate-limit token.
    pub call_timeout: Duration,
    /// Per-provider request budget; `None` disables local rate limiting.
    pub requests_per_minute: Option<u32>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(120),
            requests_per_minute: None,
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    adapters: HashMap<Provider, Arc<dyn ChatProvider>>,
    limiter: Option<RateLimiter>,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    /// Build adapters for `providers` from their environment variables.
    pub fn from_env(
        providers: &[Provider],
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Result<Self, ProviderError> {
        let mut gateway = Self::new(usage_sink, config);
        for provider in providers {
            let adapter = HttpChatAdapter::from_env(*provider)?;
            gateway = gateway.with_adapter(*provider, Arc::new(adapter));
        }
        Ok(gateway)
    }

    pub fn new(usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        let limiter = config.requests_per_minute.map(RateLimiter::per_minute);
        Self {
            adapters: HashMap::new(),
            limiter,
            usage_sink,
            config,
        }
    }

    pub fn with_adapter(mut self, provider: Provider, adapter: Arc<dyn ChatProvider>) -> Self {
        self.adapters.insert(provider, adapter);
        self
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let provider = req.model.provider();
        let adapter = self.adapters.get(&provider).ok_or_else(|| {
            ProviderError::config(format!("no adapter configured for provider {provider}"))
        })?;

        let start = Instant::now();
        let deadline = self.config.call_timeout;
        let admitted = match &self.limiter {
            Some(limiter) => limiter.acquire(provider, deadline).await,
            None => Ok(()),
        };

        let result = match admitted {
            Err(err) => Err(err),
            Ok(()) => match tokio::time::timeout(deadline, adapter.chat(&req)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(deadline)),
            },
        };

        self.record_usage(&req, &result, start.elapsed()).await;
        result
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        result: &Result<ChatResponse, ProviderError>,
        elapsed: Duration,
    ) {
        let record = ProviderCallRecord::new(
            req.model.provider(),
            req.model.model_id(),
            req.attribution.caller,
        )
        .run(req.attribution.run_id)
        .question(req.attribution.question_id.clone())
        .latency(elapsed.as_millis() as u64);

        let record = match result {
            Ok(resp) => record.tokens(resp.input_tokens, resp.output_tokens),
            Err(err) => record
                .error(err.code())
                .request_id(err.request_id().map(str::to_string)),
        };

        self.usage_sink.record(record).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct SlowProvider(Duration);

    #[async_trait]
    impl ChatProvider for SlowProvider {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            tokio::time::sleep(self.0).await;
            Ok(ChatResponse::text("late"))
        }
    }

    fn request(provider: Provider) -> ChatRequest {
        ChatRequest::new(
            ChatModel::new(provider, "m"),
            vec![Message::user("hi")],
            Attribution::new("test"),
        )
    }

    #[tokio::test]
    async fn per_attempt_deadline_is_a_timeout_error() {
        let gateway = ProviderGateway::new(
            Arc::new(NoopUsageSink),
            GatewayConfig {
                call_timeout: Duration::from_millis(10),
                requests_per_minute: None,
            },
        )
        .with_adapter(
            Provider::OpenAi,
            Arc::new(SlowProvider(Duration::from_millis(200))),
        );

        let err = gateway.chat(request(Provider::OpenAi)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn exhausted_local_budget_fails_fast_as_retryable() {
        let gateway = ProviderGateway::new(
            Arc::new(NoopUsageSink),
            GatewayConfig {
                call_timeout: Duration::from_millis(50),
                requests_per_minute: Some(1),
            },
        )
        .with_adapter(Provider::OpenAi, Arc::new(SlowProvider(Duration::ZERO)));

        assert!(gateway.chat(request(Provider::OpenAi)).await.is_ok());
        let err = gateway.chat(request(Provider::OpenAi)).await.unwrap_err();
        assert_eq!(err.code(), "rate_limited_local");
        assert!(err.is_retryable());
        assert!(err.retry_after().unwrap() > Duration::from_millis(50));
    }

    #[tokio::test]
    async fn unknown_provider_is_config_error() {
        let gateway = ProviderGateway::new(Arc::new(NoopUsageSink), GatewayConfig::default());
        let err = gateway.chat(request(Provider::Anthropic)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }
}
