use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::Set;
use crate::config::RetryConfig;
use crate::provider::{ProviderError, ProviderResult};

/// Retries provider calls that fail with a transient error.
///
/// The delay before attempt `n` is drawn uniformly from
/// `[min_delay, min(max_delay, base_delay * 2^n)]`. When the sum of the delays exceeds
/// `max_elapsed`, one final attempt is made and its result is returned as is.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    min_delay: Duration,
    max_delay: Duration,
    base_delay: Duration,
    max_elapsed: Duration,
    transient_codes: Set<String>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            min_delay: config.min_delay,
            max_delay: config.max_delay,
            base_delay: config.base_delay,
            max_elapsed: config.max_elapsed,
            transient_codes: config.transient_error_codes.iter().cloned().collect(),
        }
    }

    pub fn is_transient(&self, error: &ProviderError) -> bool {
        error
            .code()
            .map(|code| self.transient_codes.contains(code))
            .unwrap_or(false)
    }

    pub fn delay_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let upper = exponential.min(self.max_delay).max(self.min_delay);
        (self.min_delay, upper)
    }

    fn random_delay(&self, attempt: u32) -> Duration {
        let (lower, upper) = self.delay_bounds(attempt);
        let lower = lower.as_millis() as u64;
        let upper = upper.as_millis() as u64;
        if upper <= lower {
            return Duration::from_millis(lower);
        }
        Duration::from_millis(rand::rng().random_range(lower..=upper))
    }

    pub async fn run<T, F, Fut>(&self, description: &str, mut call: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut elapsed = Duration::ZERO;
        let mut attempt = 0;
        while elapsed <= self.max_elapsed {
            match call().await {
                Err(error) if self.is_transient(&error) => {
                    let delay = self.random_delay(attempt);
                    log::warn!(
                        "{description} failed with a transient error (attempt {}): {error}, retrying in {delay:?}",
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                    elapsed += delay;
                    attempt += 1;
                }
                result => return result,
            }
        }
        log::warn!(
            "{description}: retry budget of {:?} exhausted, making a final attempt",
            self.max_elapsed
        );
        call().await
    }
}
