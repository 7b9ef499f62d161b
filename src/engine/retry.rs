use std::{fmt::Display, future::Future, time::Duration};

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff.
///
/// Attempts are numbered from 1. After attempt `n` fails, the next attempt
/// waits `initial_backoff_ms * multiplier^(n-1)`, capped at `max_backoff_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 250,
            max_backoff_ms: 4000,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// How long to wait after attempt `attempt` fails, or `None` if no
    /// attempts remain.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let factor = u64::from(self.multiplier).saturating_pow(attempt - 1);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Some(Duration::from_millis(millis))
    }

    /// Every delay this policy will sleep for, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..).map_while(|attempt| self.delay_after(attempt)).collect()
    }

    /// Run `operation` until it succeeds, fails with an error `retryable`
    /// rejects, or the attempts run out. The operation is given the attempt
    /// number.
    pub async fn run<T, E, F, Fut, R>(&self, mut operation: F, retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let delay = match retryable(&err).then(|| self.delay_after(attempt)).flatten() {
                Some(delay) => delay,
                None => return Err(err),
            };
            warn!(
                "Attempt {attempt}/{} failed, retrying in {}ms: {err}",
                self.max_attempts,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
