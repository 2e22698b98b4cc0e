//! Retrying operations with exponential backoff and jitter.
//!
//! The [`RetryPolicy`] struct defines the retry behavior: maximum attempts,
//! the delay ladder, jitter and the per-attempt timeout.
//! [`retry_with_backoff`] runs the given operation under that policy,
//! consulting the error taxonomy to decide retriability, honoring
//! server-provided `Retry-After` hints as a lower bound on the next delay,
//! and aborting promptly when the cancellation signal fires.

use std::cell::RefCell;
use std::future::Future;
use std::time::Duration;

use rand::{rngs, Rng, SeedableRng};
use revi::error::{AgentError, AgentResult};
use tracing::{debug, warn};

use crate::runtime::CancelToken;

/// Default maximum attempts (first call included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default first-retry delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Default delay ceiling.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
/// Default jitter fraction: each delay is scaled by a uniform factor in
/// `[1 - JITTER, 1 + JITTER]`.
pub const DEFAULT_JITTER: f64 = 0.2;
/// Default per-attempt timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each further retry.
    pub base_delay: Duration,
    /// Ceiling on the un-jittered delay.
    pub max_delay: Duration,
    /// Jitter fraction, `None` disables jitter.
    pub jitter: Option<f64>,
    /// Deadline for each individual attempt. An attempt that misses it is
    /// treated as a transport failure.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: Some(DEFAULT_JITTER),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// The un-jittered delay after `attempt` failed attempts (1-based).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

/// Retries `operation` under `policy`.
///
/// `idempotent` decides what happens to unclassified internal errors:
/// idempotent operations retry them, non-idempotent operations stop.
/// Cancellation — before an attempt, during an attempt or during a delay —
/// returns [`AgentError::Aborted`] without further attempts.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    operation_name: &str,
    idempotent: bool,
    mut operation: F,
) -> AgentResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AgentResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(AgentError::Aborted);
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Aborted),
            result = tokio::time::timeout(policy.attempt_timeout, operation()) => match result {
                Ok(settled) => settled,
                Err(_) => Err(AgentError::Transport(format!(
                    "attempt timed out after {:?}",
                    policy.attempt_timeout
                ))),
            },
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && err.is_retryable(idempotent) => {
                let mut delay = apply_jitter(policy.backoff_delay(attempt), policy.jitter);
                if let Some(floor) = err.retry_after() {
                    delay = delay.max(floor.min(Duration::from_secs(600)));
                }
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after failure"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AgentError::Aborted),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => {
                debug!(operation = operation_name, attempt, error = %err, "giving up");
                return Err(err);
            }
        }
    }
}

fn apply_jitter(delay: Duration, jitter: Option<f64>) -> Duration {
    match jitter {
        Some(fraction) if fraction > 0.0 => {
            let spread =
                RETRY_RNG.with(|rng| rng.borrow_mut().gen_range(-fraction..=fraction));
            delay.mul_f64((1.0 + spread).max(0.0))
        }
        _ => delay,
    }
}

thread_local! {
    static RETRY_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}
