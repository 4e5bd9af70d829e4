//! Per-provider token-bucket rate limiter.
//!
//! The only mutable state shared between pipeline workers. Buckets are keyed by
//! provider so a slow provider never throttles calls to another one.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::error::ProviderError;
use super::types::Provider;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    capacity: f64,
    /// Tokens per second.
    refill_rate: f64,
}

impl TokenBucket {
    fn new(capacity: u32, period: Duration) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
            capacity,
            refill_rate: capacity / period.as_secs_f64().max(f64::EPSILON),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let needed = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(needed / self.refill_rate))
        }
    }
}

/// Token-bucket limiter with one bucket per provider.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<Provider, TokenBucket>>,
    requests_per_period: u32,
    period: Duration,
}

impl RateLimiter {
    pub fn new(requests_per_period: u32, period: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            requests_per_period,
            period,
        }
    }

    pub fn per_minute(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(60))
    }

    /// Take one token for `provider`, or report how long until one is available.
    pub fn try_acquire(&self, provider: Provider) -> Result<(), Duration> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry(provider)
            .or_insert_with(|| TokenBucket::new(self.requests_per_period, self.period));
        bucket.try_consume(Instant::now())
    }

    /// Wait for a token for `provider` and take it. Fails with a local rate-limit
    /// error, without waiting, when the next token is further away than `max_wait`.
    pub async fn acquire(
        &self,
        provider: Provider,
        max_wait: Duration,
    ) -> Result<(), ProviderError> {
        let mut waited = Duration::ZERO;
        loop {
            match self.try_acquire(provider) {
                Ok(()) => return Ok(()),
                Err(wait) if waited + wait > max_wait => {
                    tracing::debug!(
                        provider = %provider,
                        wait_ms = wait.as_millis() as u64,
                        "local rate limit exceeds attempt deadline"
                    );
                    return Err(ProviderError::rate_limited_local(wait));
                }
                Err(wait) => {
                    tracing::debug!(
                        provider = %provider,
                        wait_ms = wait.as_millis() as u64,
                        "rate limited locally"
                    );
                    tokio::time::sleep(wait).await;
                    waited += wait;
                }
            }
        }
    }
}
