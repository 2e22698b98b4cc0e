//! Admission control for captured events.
//!
//! Sampling keeps the agent's overhead and upload volume proportional to the
//! configured rates rather than to how busy (or broken) the page is. Each
//! event kind has an independent rate in [0, 1]; on top of the probabilistic
//! draw a token bucket caps bursts per kind, so an error storm cannot flood
//! the pipeline even at rate 1.0.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::{rngs, Rng, SeedableRng};
use revi::event::{EventKind, Severity};
use tokio::time::Instant;

/// Default burst cap: events admitted per kind per window.
pub const DEFAULT_RATE_LIMIT_EVENTS: u32 = 100;
/// Default burst window.
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);

/// Sampler configuration.
#[derive(Clone, Debug)]
pub struct SamplerConfig {
    /// Admission probability for error events.
    pub error_rate: f64,
    /// Admission probability for session/replay events.
    pub session_rate: f64,
    /// Admission probability for performance events.
    pub performance_rate: f64,
    /// Admission probability for network events. The admission *filter* is
    /// separate; this only thins volume.
    pub network_rate: f64,
    /// Burst cap per kind.
    pub rate_limit_events: u32,
    /// Burst window per kind.
    pub rate_limit_window: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            error_rate: 1.0,
            session_rate: 1.0,
            performance_rate: 1.0,
            network_rate: 1.0,
            rate_limit_events: DEFAULT_RATE_LIMIT_EVENTS,
            rate_limit_window: DEFAULT_RATE_LIMIT_WINDOW,
        }
    }
}

/// Per-kind probabilistic + rate-limit admission.
///
/// Stateless across events except for the rate-limiter buckets. Severity
/// `Error`/`Critical` events bypass the probabilistic draw but still consume
/// rate-limit tokens.
#[derive(Debug)]
pub struct Sampler {
    config: SamplerConfig,
    buckets: Mutex<HashMap<EventKind, TokenBucket>>,
    // Rate multiplier in per-mille, adjusted by the coordinator when network
    // quality degrades. 1000 = no scaling.
    rate_scale_mille: AtomicU64,
}

impl Sampler {
    /// A sampler with the given rates.
    pub fn new(config: SamplerConfig) -> Self {
        Sampler {
            config,
            buckets: Mutex::new(HashMap::new()),
            rate_scale_mille: AtomicU64::new(1000),
        }
    }

    /// Decide admission for one event.
    pub fn should_capture(&self, kind: EventKind, severity: Option<Severity>) -> bool {
        let forced = matches!(severity, Some(Severity::Error) | Some(Severity::Critical));
        if !forced && !self.draw(kind) {
            return false;
        }
        self.take_token(kind)
    }

    /// Scale all rates by `scale` (clamped to [0, 1]) until reset. Used
    /// under degraded network conditions.
    pub fn set_rate_scale(&self, scale: f64) {
        let mille = (scale.clamp(0.0, 1.0) * 1000.0) as u64;
        self.rate_scale_mille.store(mille, Ordering::Relaxed);
    }

    fn rate_for(&self, kind: EventKind) -> f64 {
        let base = match kind {
            EventKind::Error => self.config.error_rate,
            EventKind::Session => self.config.session_rate,
            EventKind::Performance => self.config.performance_rate,
            EventKind::Network => self.config.network_rate,
        };
        let scale = self.rate_scale_mille.load(Ordering::Relaxed) as f64 / 1000.0;
        base * scale
    }

    fn draw(&self, kind: EventKind) -> bool {
        let rate = self.rate_for(kind);
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        SAMPLER_RNG.with(|rng| rng.borrow_mut().gen::<f64>() < rate)
    }

    fn take_token(&self, kind: EventKind) -> bool {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            // Poisoned bucket map admits; the limiter is advisory.
            Err(_) => return true,
        };
        buckets
            .entry(kind)
            .or_insert_with(|| {
                TokenBucket::new(self.config.rate_limit_events, self.config.rate_limit_window)
            })
            .try_take()
    }
}

thread_local! {
    static SAMPLER_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, window: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        TokenBucket {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / window.as_secs_f64().max(0.001),
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rate: f64) -> SamplerConfig {
        SamplerConfig {
            error_rate: rate,
            session_rate: rate,
            performance_rate: rate,
            network_rate: rate,
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn zero_rate_rejects_and_full_rate_admits() {
        let off = Sampler::new(config(0.0));
        assert!(!off.should_capture(EventKind::Session, None));

        let on = Sampler::new(config(1.0));
        assert!(on.should_capture(EventKind::Session, None));
    }

    #[test]
    fn critical_severity_overrides_rate() {
        let sampler = Sampler::new(config(0.0));
        assert!(sampler.should_capture(EventKind::Error, Some(Severity::Critical)));
        assert!(sampler.should_capture(EventKind::Error, Some(Severity::Error)));
        assert!(!sampler.should_capture(EventKind::Error, Some(Severity::Warning)));
    }

    #[test]
    fn rate_limiter_caps_bursts_per_kind() {
        let sampler = Sampler::new(SamplerConfig {
            rate_limit_events: 5,
            rate_limit_window: Duration::from_secs(3600),
            ..config(1.0)
        });

        let admitted = (0..20)
            .filter(|_| sampler.should_capture(EventKind::Error, Some(Severity::Critical)))
            .count();
        assert_eq!(admitted, 5);

        // Other kinds have their own bucket.
        assert!(sampler.should_capture(EventKind::Session, None));
    }

    #[test]
    fn rate_scale_reduces_admission() {
        let sampler = Sampler::new(config(1.0));
        sampler.set_rate_scale(0.0);
        assert!(!sampler.should_capture(EventKind::Session, None));
        sampler.set_rate_scale(1.0);
        assert!(sampler.should_capture(EventKind::Session, None));
    }

    #[test]
    fn probabilistic_rate_is_roughly_respected() {
        let sampler = Sampler::new(SamplerConfig {
            rate_limit_events: 100_000,
            ..config(0.3)
        });
        let admitted = (0..10_000)
            .filter(|_| sampler.should_capture(EventKind::Performance, None))
            .count();
        // Loose bound: binomial(10k, 0.3) stays well inside ±5 points.
        assert!((2_500..=3_500).contains(&admitted), "admitted {}", admitted);
    }
}
