//! Retry policy shared by every structured call.

use std::time::Duration;

use rand::Rng;

use super::error::ProviderError;

/// How many attempts a logical call gets, how long to wait between them, and
/// which failures are worth another attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a call makes at most `max_retries + 1` attempts.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter in `[0, 1]` applied to each backoff delay.
    pub jitter: f64,
    /// Answer invalid model output with a corrective re-prompt instead of failing at once.
    pub correct_invalid_output: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
            correct_invalid_output: true,
        }
    }
}

impl RetryPolicy {
    /// Policy without waits, for tests and offline fakes.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            correct_invalid_output: true,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether a provider failure on `attempt` (0-based) should be retried.
    pub fn retries_provider_error(&self, err: &ProviderError, attempt: u32) -> bool {
        err.is_retryable() && attempt < self.max_retries
    }

    /// Whether invalid output on `attempt` (0-based) earns a corrective re-prompt.
    pub fn corrects_invalid_output(&self, attempt: u32) -> bool {
        self.correct_invalid_output && attempt < self.max_retries
    }

    /// Exponential backoff for the wait after `attempt` (0-based), without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.pow(attempt.min(5));
        (self.base_delay * multiplier).min(self.max_delay)
    }

    /// Backoff with jitter, never shorter than a provider-requested wait (capped at `max_delay`).
    pub fn backoff<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        err: Option<&ProviderError>,
        rng: &mut R,
    ) -> Duration {
        let base = self.base_backoff(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 && !base.is_zero() {
            let factor = 1.0 + rng.gen_range(-jitter..=jitter);
            base.mul_f64(factor.max(0.0))
        } else {
            base
        };

        let floor = err
            .and_then(ProviderError::retry_after)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(Duration::ZERO);

        delay.max(floor)
    }
}
