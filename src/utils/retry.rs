//! Retry policy engine
//!
//! Status-classified retries with bounded backoff. Rate-limit responses
//! (429) use decorrelated jitter so a fleet of clients does not
//! resynchronize into retry storms; server errors use exponential backoff
//! with jitter. An explicit `Retry-After` hint from the upstream always
//! wins, capped at `backoff_max`.
//!
//! The policy itself is stateless; per-call state lives in `RetryContext`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

use crate::config::RetrySettings;
use crate::error::ClassifiedError;

/// Retry decision parameters, shared by every upstream call site.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retry attempts (not counting the initial attempt)
    pub max_retry: u32,
    /// Status codes eligible for retry
    pub retry_status_codes: Vec<u16>,
    /// Base backoff, seconds
    pub backoff_base: f64,
    /// Exponential growth factor for server-error backoff
    pub backoff_factor: f64,
    /// Upper bound on any single delay, seconds
    pub backoff_max: f64,
    /// Total sleep budget across one logical call, seconds
    pub budget: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retry: settings.max_retry,
            retry_status_codes: settings.retry_status_codes.clone(),
            backoff_base: settings.backoff_base,
            backoff_factor: settings.backoff_factor,
            backoff_max: settings.backoff_max,
            budget: settings.budget,
        }
    }

    fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }
}

/// Per-call retry state. Not persisted, not shared.
#[derive(Debug, Default)]
pub struct RetryContext {
    /// Retries performed so far
    pub attempt: u32,
    /// Cumulative sleep time, seconds
    pub total_delay: f64,
    /// Status code of the most recent failure
    pub last_status: Option<u16>,
    /// Rendered message of the most recent failure
    pub last_error: Option<String>,
    /// Previous delay, feeds the decorrelated-jitter recurrence
    prev_delay: f64,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether another attempt is allowed for `status`.
    ///
    /// False once the attempt ceiling or the sleep budget is reached,
    /// regardless of status.
    pub fn should_retry(&self, policy: &RetryPolicy, status: u16) -> bool {
        if self.attempt >= policy.max_retry {
            return false;
        }
        if self.total_delay >= policy.budget {
            return false;
        }
        policy.is_retryable_status(status)
    }

    /// Compute the next delay. Always within `[0, backoff_max]`.
    pub fn calculate_delay(
        &mut self,
        policy: &RetryPolicy,
        status: u16,
        retry_after: Option<f64>,
    ) -> Duration {
        let secs = if let Some(hint) = retry_after {
            hint.max(0.0).min(policy.backoff_max)
        } else if status == 429 {
            self.decorrelated_jitter(policy)
        } else {
            self.exponential_with_jitter(policy)
        };

        self.prev_delay = secs;
        Duration::from_secs_f64(secs)
    }

    /// Record a failed attempt.
    pub fn record_error(&mut self, status: u16, error: &dyn std::fmt::Display) {
        self.attempt += 1;
        self.last_status = Some(status);
        self.last_error = Some(error.to_string());
    }

    // sleep = min(cap, uniform(base, 3 * previous_sleep))
    fn decorrelated_jitter(&self, policy: &RetryPolicy) -> f64 {
        let base = policy.backoff_base.max(0.0);
        let upper = (self.prev_delay * 3.0).max(base);
        let secs = if upper > base {
            rand::thread_rng().gen_range(base..=upper)
        } else {
            base
        };
        secs.min(policy.backoff_max)
    }

    // base * factor^attempt, jittered into [exp/2, exp], capped
    fn exponential_with_jitter(&self, policy: &RetryPolicy) -> f64 {
        let exp = (policy.backoff_base * policy.backoff_factor.powi(self.attempt as i32))
            .min(policy.backoff_max);
        if exp <= 0.0 {
            return 0.0;
        }
        rand::thread_rng().gen_range(exp * 0.5..=exp)
    }
}

/// Numeric wait hint carried by a classified upstream error, if any.
///
/// Returns `None` for errors that are not classified upstream failures.
pub fn extract_retry_after<E: ClassifiedError>(error: &E) -> Option<f64> {
    error.retry_after_hint()
}

/// Run `operation` with status-based retries.
///
/// On a classified failure with a retryable status, sleeps the computed
/// delay and tries again; anything unclassified or non-retryable is
/// returned immediately. Callers that rotate credentials request a fresh
/// token inside `operation` on each invocation.
pub async fn retry_on_status<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ClassifiedError + std::fmt::Display,
{
    retry_on_status_with(policy, operation, |_, _, _, _| {}).await
}

/// `retry_on_status` with an observer invoked before each sleep, receiving
/// `(attempt, status, error, delay)`.
pub async fn retry_on_status_with<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    mut operation: F,
    mut on_retry: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ClassifiedError + std::fmt::Display,
    C: FnMut(u32, u16, &E, Duration),
{
    let mut ctx = RetryContext::new();

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let Some(status) = err.status() else {
                    // Not a classified upstream failure; nothing to reason about.
                    return Err(err);
                };
                if !ctx.should_retry(policy, status) {
                    return Err(err);
                }

                let hint = extract_retry_after(&err);
                ctx.record_error(status, &err);
                let delay = ctx.calculate_delay(policy, status, hint);
                ctx.total_delay += delay.as_secs_f64();

                tracing::debug!(
                    attempt = ctx.attempt,
                    status,
                    delay_ms = delay.as_millis() as u64,
                    "retrying upstream call"
                );
                on_retry(ctx.attempt, status, &err, delay);

                sleep(delay).await;
            }
        }
    }
}
