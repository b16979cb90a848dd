//! Capped exponential backoff with jitter, shared by every backend call.
//!
//! One policy object serves both concurrency models: [`RetryPolicy::run`]
//! suspends between attempts (for the polling loop, which must not block
//! other scheduled work) and [`RetryPolicy::run_blocking`] sleeps the thread
//! (for synchronous call-sites). Classification lives on
//! [`BackendError::is_retryable`]; exhaustion returns the last error
//! unchanged so callers can record it.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use drumline_core::config::RetryConfig;

use crate::error::BackendError;

/// Tracks one retry loop. Not persisted — lives only for the duration of the
/// wrapped operation.
#[derive(Debug, Default)]
struct RetryContext {
    attempt: u32,
    total_wait: Duration,
    last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            base: 2.0,
            jitter: true,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            base: cfg.backoff_base,
            jitter: cfg.jitter,
        }
    }
}

impl RetryPolicy {
    /// Pre-jitter delay for a zero-based attempt. A server hint takes
    /// precedence over the exponential formula; either way the cap applies.
    pub fn backoff_delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let chosen = match hint {
            Some(h) => h.as_secs_f64(),
            None => self.initial_delay.as_secs_f64() * self.base.powi(attempt.min(63) as i32),
        };
        Duration::from_secs_f64(chosen.min(self.max_delay.as_secs_f64()))
    }

    /// Apply ±10% uniform jitter. Never negative; identity when disabled.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.9..=1.1);
        Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
    }

    fn next_delay(&self, ctx: &mut RetryContext, err: &BackendError) -> Duration {
        let delay = self.jittered(self.backoff_delay(ctx.attempt, err.retry_after()));
        ctx.total_wait += delay;
        ctx.last_error = Some(err.to_string());
        warn!(
            attempt = ctx.attempt,
            retry_in_ms = delay.as_millis() as u64,
            total_wait_ms = ctx.total_wait.as_millis() as u64,
            error = %err,
            "retrying backend call"
        );
        delay
    }

    /// Invoke `op` until it succeeds, fails permanently, or retries are
    /// exhausted. Suspends between attempts.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, BackendError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut ctx = RetryContext::default();
        loop {
            match op(ctx.attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if ctx.attempt < self.max_retries && err.is_retryable() => {
                    let delay = self.next_delay(&mut ctx, &err);
                    tokio::time::sleep(delay).await;
                    ctx.attempt += 1;
                }
                Err(err) => {
                    debug!(
                        attempts = ctx.attempt + 1,
                        retryable = err.is_retryable(),
                        "backend call gave up"
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Blocking twin of [`run`](Self::run): sleeps the calling thread between
    /// attempts. Same classification, delays, and exhaustion behaviour.
    pub fn run_blocking<T, F>(&self, mut op: F) -> Result<T, BackendError>
    where
        F: FnMut(u32) -> Result<T, BackendError>,
    {
        let mut ctx = RetryContext::default();
        loop {
            match op(ctx.attempt) {
                Ok(value) => return Ok(value),
                Err(err) if ctx.attempt < self.max_retries && err.is_retryable() => {
                    let delay = self.next_delay(&mut ctx, &err);
                    std::thread::sleep(delay);
                    ctx.attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
