//! Per-endpoint circuit breaker.
//!
//! Fails calls fast when a downstream endpoint is known to be unhealthy.
//! Three states: `Closed` passes all calls and watches a rolling outcome
//! window; `Open` rejects immediately until a cooldown elapses; `HalfOpen`
//! lets a bounded number of probes through and closes again only after
//! enough of them succeed. Cooldowns grow exponentially on repeated trips.
//!
//! Transport failures and retryable server statuses count against the
//! breaker. Terminal server statuses count as successes — the endpoint
//! answered, the payload was the problem. Aborts and refusals are not
//! recorded at all.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use revi::error::{AgentError, AgentResult};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Circuit breaker configuration.
///
/// The rolling window keeps the most recent `window_size` outcomes and at
/// most `window_age` of history; the failure-rate trip requires at least
/// `minimum_calls` outcomes in the window.
#[derive(Clone, Debug)]
pub struct CircuitConfig {
    /// Failure rate in the window that opens the circuit.
    pub failure_rate_threshold: f64,
    /// Minimum outcomes in the window before the rate trip applies.
    pub minimum_calls: usize,
    /// Maximum outcomes kept in the window.
    pub window_size: usize,
    /// Maximum age of outcomes kept in the window.
    pub window_age: Duration,
    /// Consecutive failures that open the circuit regardless of rate.
    pub consecutive_failure_threshold: u32,
    /// Cooldown before the first half-open transition.
    pub cooldown: Duration,
    /// Ceiling for grown cooldowns.
    pub max_cooldown: Duration,
    /// Concurrent probes allowed while half-open.
    pub half_open_max_probes: u32,
    /// Probe successes required to close.
    pub half_open_success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        CircuitConfig {
            failure_rate_threshold: 0.5,
            minimum_calls: 10,
            window_size: 20,
            window_age: Duration::from_secs(10),
            consecutive_failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            half_open_max_probes: 2,
            half_open_success_threshold: 2,
        }
    }
}

/// The observable state of a breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// All calls pass.
    Closed,
    /// Calls fail fast.
    Open,
    /// A bounded number of probes pass.
    HalfOpen,
}

/// A point-in-time view of a breaker, for observability.
#[derive(Clone, Debug)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures observed while closed.
    pub consecutive_failures: u32,
    /// Outcomes currently in the rolling window.
    pub recent_calls: usize,
    /// Failure rate over the rolling window, 0 when empty.
    pub recent_failure_rate: f64,
    /// Time spent in the current state.
    pub in_state_for: Duration,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    window: VecDeque<(Instant, bool)>,
    consecutive_failures: u32,
    changed_at: Instant,
    // Grows with each trip; reset when the circuit closes cleanly.
    trips: u32,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

/// A per-endpoint three-state circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// A closed breaker for `endpoint`.
    pub fn new(endpoint: impl Into<String>, config: CircuitConfig) -> Self {
        CircuitBreaker {
            endpoint: endpoint.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                consecutive_failures: 0,
                changed_at: Instant::now(),
                trips: 0,
                half_open_in_flight: 0,
                half_open_successes: 0,
            }),
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Returns [`AgentError::CircuitOpen`] in O(1), without invoking `op`,
    /// when the breaker is open or the half-open probe budget is exhausted.
    pub async fn call<T, F, Fut>(&self, op: F) -> AgentResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AgentResult<T>>,
    {
        let probing = self.try_acquire()?;
        let outcome = op().await;
        self.record(&outcome, probing);
        outcome
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.snapshot().state
    }

    /// Observable snapshot of the breaker.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        let failures = inner.window.iter().filter(|(_, ok)| !ok).count();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            recent_calls: inner.window.len(),
            recent_failure_rate: if inner.window.is_empty() {
                0.0
            } else {
                failures as f64 / inner.window.len() as f64
            },
            in_state_for: inner.changed_at.elapsed(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Inner never panics while locked; recover the guard if it ever does.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cooldown_for(&self, trips: u32) -> Duration {
        let factor = 1u32.checked_shl(trips.saturating_sub(1)).unwrap_or(u32::MAX);
        self.config
            .cooldown
            .checked_mul(factor)
            .map(|d| d.min(self.config.max_cooldown))
            .unwrap_or(self.config.max_cooldown)
    }

    // Open → HalfOpen once the cooldown for the current trip count elapsed.
    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && inner.changed_at.elapsed() >= self.cooldown_for(inner.trips)
        {
            debug!(endpoint = %self.endpoint, "circuit half-open, probing");
            inner.state = CircuitState::HalfOpen;
            inner.changed_at = Instant::now();
            inner.half_open_in_flight = 0;
            inner.half_open_successes = 0;
        }
    }

    fn try_acquire(&self) -> Result<bool, AgentError> {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => Err(AgentError::CircuitOpen {
                endpoint: self.endpoint.clone(),
            }),
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_probes {
                    inner.half_open_in_flight += 1;
                    Ok(true)
                } else {
                    Err(AgentError::CircuitOpen {
                        endpoint: self.endpoint.clone(),
                    })
                }
            }
        }
    }

    fn record<T>(&self, outcome: &AgentResult<T>, probing: bool) {
        let counted = match outcome {
            Ok(_) => Some(true),
            // The endpoint answered; the payload was rejected.
            Err(AgentError::ServerTerminal { .. }) => Some(true),
            Err(AgentError::Transport(_)) | Err(AgentError::ServerRetryable { .. }) => Some(false),
            Err(_) => None,
        };

        let mut inner = self.lock();
        if probing {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        let Some(success) = counted else { return };

        match inner.state {
            CircuitState::Closed => {
                let now = Instant::now();
                inner.window.push_back((now, success));
                while inner.window.len() > self.config.window_size {
                    inner.window.pop_front();
                }
                while inner
                    .window
                    .front()
                    .is_some_and(|(at, _)| now.duration_since(*at) > self.config.window_age)
                {
                    inner.window.pop_front();
                }

                if success {
                    inner.consecutive_failures = 0;
                    return;
                }
                inner.consecutive_failures += 1;

                let failures = inner.window.iter().filter(|(_, ok)| !ok).count();
                let rate_tripped = inner.window.len() >= self.config.minimum_calls
                    && failures as f64 / inner.window.len() as f64
                        >= self.config.failure_rate_threshold;
                if rate_tripped
                    || inner.consecutive_failures >= self.config.consecutive_failure_threshold
                {
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_success_threshold {
                        debug!(endpoint = %self.endpoint, "circuit closed");
                        inner.state = CircuitState::Closed;
                        inner.changed_at = Instant::now();
                        inner.window.clear();
                        inner.consecutive_failures = 0;
                        inner.trips = 0;
                    }
                } else {
                    self.trip(&mut inner);
                }
            }
            // Stragglers from calls admitted before the trip.
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.trips += 1;
        warn!(
            endpoint = %self.endpoint,
            trips = inner.trips,
            cooldown_ms = self.cooldown_for(inner.trips).as_millis() as u64,
            "circuit opened"
        );
        inner.state = CircuitState::Open;
        inner.changed_at = Instant::now();
        inner.half_open_in_flight = 0;
        inner.half_open_successes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> CircuitConfig {
        CircuitConfig {
            consecutive_failure_threshold: 3,
            cooldown: Duration::from_secs(1),
            half_open_success_threshold: 2,
            half_open_max_probes: 2,
            ..CircuitConfig::default()
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _: AgentResult<()> = breaker
            .call(|| async { Err(AgentError::Transport("down".into())) })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Ok::<_, AgentError>(()) }).await;
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_consecutive_failures_and_fails_fast() {
        let breaker = CircuitBreaker::new("error", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Rejected without invoking the operation.
        let invoked = AtomicUsize::new(0);
        let result: AgentResult<()> = breaker
            .call(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(AgentError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_through_half_open() {
        let breaker = CircuitBreaker::new("error", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_with_longer_cooldown() {
        let breaker = CircuitBreaker::new("error", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // First cooldown was 1s; after the second trip it is 2s.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_rate_trips_with_minimum_calls() {
        let breaker = CircuitBreaker::new("error", CircuitConfig {
            consecutive_failure_threshold: 100,
            minimum_calls: 10,
            ..config()
        });

        // Alternate success/failure: never 3 consecutive, but 50% rate.
        for _ in 0..5 {
            succeed(&breaker).await;
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_limits_concurrent_probes() {
        let breaker = std::sync::Arc::new(CircuitBreaker::new("error", config()));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Two probes may be in flight; the third is refused.
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = breaker.clone();
        let hold = tokio::spawn(async move {
            let _ = slow
                .call(|| async move {
                    let _ = gate_rx.await;
                    Ok::<_, AgentError>(())
                })
                .await;
        });
        tokio::task::yield_now().await;

        let second = breaker.try_acquire();
        assert!(second.is_ok());
        let third = breaker.try_acquire();
        assert!(matches!(third, Err(AgentError::CircuitOpen { .. })));

        let _ = gate_tx.send(());
        hold.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_server_errors_do_not_trip() {
        let breaker = CircuitBreaker::new("error", config());
        for _ in 0..10 {
            let _: AgentResult<()> = breaker
                .call(|| async { Err(AgentError::ServerTerminal { status: 400 }) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_window_statistics() {
        let breaker = CircuitBreaker::new("error", config());
        succeed(&breaker).await;
        fail(&breaker).await;

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.recent_calls, 2);
        assert!((snapshot.recent_failure_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.consecutive_failures, 1);
    }
}
