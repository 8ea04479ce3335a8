//! # Retry Policy
//!
//! Runs an async operation with exponential backoff until it succeeds, fails
//! with a non-retryable error, runs out of attempts, or the context is done.
//!
//! ## Retry Strategy
//!
//! - **Exponential backoff**: `base_delay * multiplier^(attempt-1)`, capped at `max_delay`
//! - **Jitter**: ±`jitter` randomness on every delay
//! - **Classification**: [`BalancerError::is_retryable`] with the caller's idempotency flag
//! - **Cancellation**: the context is checked before every attempt and raced against
//!   every backoff sleep; once the context is done its error is returned as-is

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use tracing::debug;

use crate::core::config::RetryPolicyConfig;
use crate::core::context::Context;
use crate::core::error::{BalancerError, BalancerResult};
use crate::observability::metrics::RETRY_ATTEMPTS_TOTAL;

/// Per-call retry options
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryOptions {
    /// Repeating the operation has no side effects beyond its own result
    pub idempotent: bool,
}

impl RetryOptions {
    pub fn idempotent(idempotent: bool) -> Self {
        Self { idempotent }
    }
}

/// Execute `operation` under `policy`.
///
/// Each attempt receives a clone of `ctx`. The error of the last attempt is
/// returned when the attempt budget runs out, wrapped in `RetryExhausted`.
pub async fn retry<F, Fut>(
    ctx: &Context,
    policy: &RetryPolicyConfig,
    options: RetryOptions,
    mut operation: F,
) -> BalancerResult<()>
where
    F: FnMut(Context) -> Fut,
    Fut: Future<Output = BalancerResult<()>>,
{
    let mut attempt: u32 = 0;
    let mut delay = policy.base_delay;

    loop {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        attempt += 1;
        let err = match operation(ctx.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        // the caller gave up; whatever the attempt reported, its budget is gone
        if let Some(ctx_err) = ctx.err() {
            debug!(attempt = attempt, error = %err, "context done, stop retrying");
            return Err(ctx_err);
        }

        if !err.is_retryable(options.idempotent) {
            return Err(err);
        }

        if policy.max_attempts > 0 && attempt >= policy.max_attempts {
            return Err(BalancerError::RetryExhausted {
                attempts: attempt,
                last_error: Box::new(err),
            });
        }

        let backoff = apply_jitter(delay, policy.jitter);
        counter!(RETRY_ATTEMPTS_TOTAL, "error_type" => err.error_type()).increment(1);
        debug!(
            attempt = attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "retrying after backoff"
        );

        ctx.run(tokio::time::sleep(backoff)).await?;

        delay = next_delay(delay, policy);
    }
}

fn next_delay(delay: Duration, policy: &RetryPolicyConfig) -> Duration {
    let next = delay.as_secs_f64() * policy.backoff_multiplier;
    Duration::try_from_secs_f64(next)
        .unwrap_or(policy.max_delay)
        .min(policy.max_delay)
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
}
