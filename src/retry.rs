//! Retries of provider calls.
//!
//! Transient provider errors (timeouts, rate limits, server errors) are retried with exponential
//! backoff and jitter until the elapsed time budget is spent. Everything else fails immediately.

use crate::dns::ProviderError;
use rand::Rng;
use std::{
    future::Future,
    time::Duration,
};
use tokio::time::Instant;

const BACKOFF_MULTIPLIER: f64 = 2.0;

/// ±10% jitter so writers sharing a zone don't retry in lockstep.
const RANDOMIZATION_FACTOR: f64 = 0.1;

pub struct ExponentialBackoff {
    pub current_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed_time: Option<Duration>,
    pub multiplier: f64,
    pub randomization_factor: f64,
    start_time: Instant,
}

impl ExponentialBackoff {
    pub fn new(initial_interval: Duration, max_interval: Duration, max_elapsed_time: Option<Duration>) -> Self {
        Self {
            current_interval: initial_interval,
            max_interval,
            max_elapsed_time,
            multiplier: BACKOFF_MULTIPLIER,
            randomization_factor: RANDOMIZATION_FACTOR,
            start_time: Instant::now(),
        }
    }

    /// The next delay, or `None` once the elapsed time budget is spent.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if let Some(max_elapsed) = self.max_elapsed_time {
            if self.start_time.elapsed() >= max_elapsed {
                return None;
            }
        }

        let interval = self.current_interval;
        let next = interval.as_secs_f64() * self.multiplier;
        self.current_interval = Duration::from_secs_f64(next).min(self.max_interval);

        Some(self.apply_jitter(interval))
    }

    fn apply_jitter(&self, interval: Duration) -> Duration {
        if self.randomization_factor == 0.0 {
            return interval;
        }

        let secs = interval.as_secs_f64();
        let delta = secs * self.randomization_factor;
        let jittered = rand::thread_rng().gen_range((secs - delta)..=(secs + delta));

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Runs `operation` with a per-attempt `timeout`, retrying transient failures per `backoff`.
///
/// An attempt that exceeds the timeout counts as a transient failure.
pub async fn retry_provider_call<T, F, Fut>(
    backoff: ExponentialBackoff,
    timeout: Duration,
    operation_name: &str,
    operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    retry(backoff, Some(timeout), operation_name, operation).await
}

/// Retries a provider write without cutting attempts short. Dropping a write halfway leaves the
/// zone in an unknown state, so the provider's own per-request timeouts bound each attempt.
pub async fn retry_provider_write<T, F, Fut>(
    backoff: ExponentialBackoff,
    operation_name: &str,
    operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    retry(backoff, None, operation_name, operation).await
}

async fn retry<T, F, Fut>(
    mut backoff: ExponentialBackoff,
    timeout: Option<Duration>,
    operation_name: &str,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(timeout)),
            },
            None => operation().await,
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "provider call succeeded after retries");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_transient() {
            debug!(operation = operation_name, error = %err, "permanent provider error, not retrying");
            return Err(err);
        }

        match backoff.next_backoff() {
            Some(delay) => {
                warn!(
                    operation = operation_name,
                    attempt,
                    retry_after = ?delay,
                    error = %err,
                    "transient provider error, will retry"
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                error!(operation = operation_name, attempt, error = %err, "provider retries exhausted");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod retry_tests;
