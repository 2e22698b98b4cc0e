//! Periodic endpoint health probing and quality classification.
//!
//! The monitor probes each configured region on an interval, keeps a rolling
//! window of response times and outcomes, and classifies connection quality.
//! The coordinator reads the classification to shed load; the sync manager
//! reads it to size batches. The region with the best current health is the
//! "primary" and is reported in every snapshot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::Request;
use revi_http::HttpClient;
use tokio::time::Instant;
use tracing::debug;

use crate::runtime::CancelToken;

/// Default interval between probe rounds.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
/// Default hard per-probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Probes kept per region.
const PROBE_WINDOW: usize = 20;

/// Connection quality classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkQuality {
    /// Fast and reliable: success > 95%, responses under 1 s.
    Excellent,
    /// Usable: success > 80%, responses under 3 s.
    Good,
    /// Mostly failing: success < 50%.
    Poor,
    /// Not enough signal, or between the bands above.
    Unknown,
}

impl NetworkQuality {
    fn rank(self) -> u8 {
        match self {
            NetworkQuality::Excellent => 3,
            NetworkQuality::Good => 2,
            NetworkQuality::Unknown => 1,
            NetworkQuality::Poor => 0,
        }
    }
}

/// One probed ingestion region.
#[derive(Clone, Debug)]
pub struct RegionEndpoint {
    /// Region name, also the key in snapshots.
    pub name: String,
    /// Base URL probed with a lightweight GET.
    pub url: String,
}

/// Health monitor configuration.
#[derive(Clone, Debug)]
pub struct HealthConfig {
    /// Interval between probe rounds.
    pub probe_interval: Duration,
    /// Hard timeout per probe.
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Point-in-time health of one region.
#[derive(Clone, Debug)]
pub struct RegionHealth {
    /// Region name.
    pub name: String,
    /// Quality classification over the probe window.
    pub quality: NetworkQuality,
    /// Fraction of recent probes that succeeded.
    pub success_rate: f64,
    /// Mean response time of recent successful probes.
    pub avg_response: Duration,
    /// Probes currently in the window.
    pub probes: usize,
}

/// Health of every region plus the current primary.
#[derive(Clone, Debug)]
pub struct HealthSnapshot {
    /// Regions in configured preference order.
    pub regions: Vec<RegionHealth>,
    /// Best-health region name, configured order breaking ties.
    pub primary: Option<String>,
}

#[derive(Debug)]
struct ProbeOutcome {
    ok: bool,
    rtt: Duration,
}

#[derive(Debug)]
struct RegionState {
    endpoint: RegionEndpoint,
    window: VecDeque<ProbeOutcome>,
}

/// Periodically probes each configured endpoint and classifies quality.
#[derive(Debug)]
pub struct HealthMonitor {
    client: Arc<dyn HttpClient>,
    config: HealthConfig,
    regions: Mutex<Vec<RegionState>>,
    cancel: CancelToken,
}

impl HealthMonitor {
    /// A monitor probing `endpoints` in the given preference order.
    pub fn new(
        client: Arc<dyn HttpClient>,
        endpoints: Vec<RegionEndpoint>,
        config: HealthConfig,
    ) -> Arc<Self> {
        Arc::new(HealthMonitor {
            client,
            config,
            regions: Mutex::new(
                endpoints
                    .into_iter()
                    .map(|endpoint| RegionState {
                        endpoint,
                        window: VecDeque::new(),
                    })
                    .collect(),
            ),
            cancel: CancelToken::new(),
        })
    }

    /// Spawn the periodic probe loop. Runs until [`HealthMonitor::shutdown`].
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = ticker.tick() => monitor.probe_all().await,
                }
            }
        })
    }

    /// Stop the probe loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run one probe round against every region.
    pub async fn probe_all(&self) {
        let endpoints: Vec<RegionEndpoint> = match self.regions.lock() {
            Ok(regions) => regions.iter().map(|r| r.endpoint.clone()).collect(),
            Err(_) => return,
        };

        for endpoint in endpoints {
            let outcome = self.probe(&endpoint).await;
            debug!(
                region = %endpoint.name,
                ok = outcome.ok,
                rtt_ms = outcome.rtt.as_millis() as u64,
                "health probe"
            );
            if let Ok(mut regions) = self.regions.lock() {
                if let Some(state) = regions.iter_mut().find(|r| r.endpoint.name == endpoint.name)
                {
                    state.window.push_back(outcome);
                    while state.window.len() > PROBE_WINDOW {
                        state.window.pop_front();
                    }
                }
            }
        }
    }

    async fn probe(&self, endpoint: &RegionEndpoint) -> ProbeOutcome {
        let started = Instant::now();
        let request = Request::builder()
            .method(http::Method::GET)
            .uri(endpoint.url.as_str())
            .body(Vec::new());

        let ok = match request {
            Err(_) => false,
            Ok(request) => {
                match tokio::time::timeout(self.config.probe_timeout, self.client.send(request))
                    .await
                {
                    Ok(Ok(response)) => response.status().as_u16() < 500,
                    Ok(Err(_)) | Err(_) => false,
                }
            }
        };

        ProbeOutcome {
            ok,
            rtt: started.elapsed(),
        }
    }

    /// Quality of a single region.
    pub fn quality(&self, region: &str) -> NetworkQuality {
        self.snapshot()
            .regions
            .into_iter()
            .find(|r| r.name == region)
            .map(|r| r.quality)
            .unwrap_or(NetworkQuality::Unknown)
    }

    /// Quality of the current primary region.
    pub fn overall_quality(&self) -> NetworkQuality {
        let snapshot = self.snapshot();
        snapshot
            .primary
            .and_then(|primary| {
                snapshot
                    .regions
                    .into_iter()
                    .find(|r| r.name == primary)
                    .map(|r| r.quality)
            })
            .unwrap_or(NetworkQuality::Unknown)
    }

    /// Current health of every region and the primary choice.
    pub fn snapshot(&self) -> HealthSnapshot {
        let regions = match self.regions.lock() {
            Ok(regions) => regions
                .iter()
                .map(|state| classify(&state.endpoint.name, &state.window))
                .collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };

        // Configured order wins ties, so a stable primary needs a strictly
        // better candidate to displace it.
        let primary = regions
            .iter()
            .rev()
            .max_by(|a, b| {
                (a.quality.rank(), a.success_rate, std::cmp::Reverse(a.avg_response))
                    .partial_cmp(&(b.quality.rank(), b.success_rate, std::cmp::Reverse(b.avg_response)))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|r| r.name.clone());

        HealthSnapshot { regions, primary }
    }
}

fn classify(name: &str, window: &VecDeque<ProbeOutcome>) -> RegionHealth {
    if window.is_empty() {
        return RegionHealth {
            name: name.to_string(),
            quality: NetworkQuality::Unknown,
            success_rate: 0.0,
            avg_response: Duration::ZERO,
            probes: 0,
        };
    }

    let successes: Vec<&ProbeOutcome> = window.iter().filter(|p| p.ok).collect();
    let success_rate = successes.len() as f64 / window.len() as f64;
    let avg_response = if successes.is_empty() {
        Duration::ZERO
    } else {
        successes.iter().map(|p| p.rtt).sum::<Duration>() / successes.len() as u32
    };

    let quality = if success_rate > 0.95 && avg_response < Duration::from_secs(1) {
        NetworkQuality::Excellent
    } else if success_rate > 0.80 && avg_response < Duration::from_secs(3) {
        NetworkQuality::Good
    } else if success_rate < 0.50 {
        NetworkQuality::Poor
    } else {
        NetworkQuality::Unknown
    };

    RegionHealth {
        name: name.to_string(),
        quality,
        success_rate,
        avg_response,
        probes: window.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHttpClient;

    fn monitor_with(client: MockHttpClient, names: &[&str]) -> Arc<HealthMonitor> {
        HealthMonitor::new(
            Arc::new(client),
            names
                .iter()
                .map(|name| RegionEndpoint {
                    name: name.to_string(),
                    url: format!("https://{}.ingest.test", name),
                })
                .collect(),
            HealthConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_endpoint_classifies_excellent() {
        let monitor = monitor_with(MockHttpClient::new(), &["us"]);
        for _ in 0..5 {
            monitor.probe_all().await;
        }

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.regions[0].quality, NetworkQuality::Excellent);
        assert_eq!(snapshot.primary.as_deref(), Some("us"));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_endpoint_classifies_poor() {
        let client = MockHttpClient::new();
        for _ in 0..5 {
            client.enqueue_transport_error("refused");
        }
        let monitor = monitor_with(client, &["us"]);
        for _ in 0..5 {
            monitor.probe_all().await;
        }

        assert_eq!(monitor.quality("us"), NetworkQuality::Poor);
    }

    #[tokio::test(start_paused = true)]
    async fn primary_prefers_the_healthier_region() {
        let client = MockHttpClient::new();
        // Round-robin probe order is us, eu: fail every "us" probe.
        for _ in 0..5 {
            client.enqueue_transport_error("refused");
            client.enqueue_ok_with_ids(&[]);
        }
        let monitor = monitor_with(client, &["us", "eu"]);
        for _ in 0..5 {
            monitor.probe_all().await;
        }

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.primary.as_deref(), Some("eu"));
        assert_eq!(monitor.overall_quality(), NetworkQuality::Excellent);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_counts_as_failure() {
        let client = MockHttpClient::new();
        client.enqueue_timeout(Duration::from_secs(60));
        let monitor = monitor_with(client, &["us"]);
        monitor.probe_all().await;

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.regions[0].probes, 1);
        assert_eq!(snapshot.regions[0].success_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_window_is_unknown() {
        let monitor = monitor_with(MockHttpClient::new(), &["us"]);
        assert_eq!(monitor.quality("us"), NetworkQuality::Unknown);
    }
}
