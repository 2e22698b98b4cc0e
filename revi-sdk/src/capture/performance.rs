//! Performance capture: web vitals, marks/measures and timing records.
//!
//! The host reports vitals and timing entries as it observes them; the
//! recorder keeps the latest vitals for [`crate::capture::Monitor::web_vitals`]
//! and turns entries into session-event envelopes for upload.

use std::collections::HashMap;

use revi::common::now_millis;
use revi::config::PerformanceConfig;
use revi::event::Envelope;
use serde::{Deserialize, Serialize};

/// The web vitals snapshot exposed to the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebVitals {
    /// Largest contentful paint, ms.
    pub lcp: Option<f64>,
    /// First input delay, ms.
    pub fid: Option<f64>,
    /// Cumulative layout shift score.
    pub cls: Option<f64>,
    /// First contentful paint, ms.
    pub fcp: Option<f64>,
    /// Time to first byte, ms.
    pub ttfb: Option<f64>,
}

/// One web-vital kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VitalKind {
    /// Largest contentful paint.
    Lcp,
    /// First input delay.
    Fid,
    /// Cumulative layout shift.
    Cls,
    /// First contentful paint.
    Fcp,
    /// Time to first byte.
    Ttfb,
}

/// A resource-timing entry as the host reports it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTiming {
    /// Resource URL.
    pub name: String,
    /// Initiator type (`img`, `script`, `fetch`, ...).
    pub initiator: String,
    /// Start offset from navigation, ms.
    pub start: f64,
    /// Total duration, ms.
    pub duration: f64,
    /// Bytes transferred.
    pub transfer_size: u64,
}

/// A navigation-timing entry as the host reports it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationTiming {
    /// DNS lookup time, ms.
    pub dns: f64,
    /// Connection establishment, ms.
    pub connect: f64,
    /// Time to first byte, ms.
    pub ttfb: f64,
    /// DOMContentLoaded offset, ms.
    pub dom_content_loaded: f64,
    /// Load event offset, ms.
    pub load: f64,
}

/// Collects marks, measures, vitals and timing envelopes.
#[derive(Debug)]
pub struct PerformanceRecorder {
    config: PerformanceConfig,
    marks: HashMap<String, u64>,
    vitals: WebVitals,
    pending: Vec<Envelope>,
}

impl PerformanceRecorder {
    /// A recorder honoring `config`'s capture toggles.
    pub fn new(config: PerformanceConfig) -> Self {
        PerformanceRecorder {
            config,
            marks: HashMap::new(),
            vitals: WebVitals::default(),
            pending: Vec::new(),
        }
    }

    /// Record a named point in time.
    pub fn mark(&mut self, name: &str) {
        self.marks.insert(name.to_string(), now_millis());
    }

    /// Milliseconds between two marks. `end` defaults to now; a missing
    /// `start` yields `None`.
    pub fn measure(&mut self, name: &str, start: Option<&str>, end: Option<&str>) -> Option<f64> {
        let start_at = *self.marks.get(start?)?;
        let end_at = match end {
            Some(mark) => *self.marks.get(mark)?,
            None => now_millis(),
        };
        let elapsed = end_at.saturating_sub(start_at) as f64;
        self.pending.push(Envelope::new(
            "performance_measure",
            &serde_json::json!({
                "name": name,
                "durationMs": elapsed,
            }),
        ));
        Some(elapsed)
    }

    /// Record one web vital observation.
    pub fn record_vital(&mut self, kind: VitalKind, value: f64) {
        if !self.config.capture_web_vitals {
            return;
        }
        match kind {
            VitalKind::Lcp => self.vitals.lcp = Some(value),
            VitalKind::Fid => self.vitals.fid = Some(value),
            VitalKind::Cls => self.vitals.cls = Some(value),
            VitalKind::Fcp => self.vitals.fcp = Some(value),
            VitalKind::Ttfb => self.vitals.ttfb = Some(value),
        }
        self.pending.push(Envelope::new("web_vitals", &self.vitals));
    }

    /// Record a resource-timing entry.
    pub fn record_resource(&mut self, timing: ResourceTiming) {
        if !self.config.capture_resource_timing {
            return;
        }
        self.pending.push(Envelope::new("resource_timing", &timing));
    }

    /// Record a navigation-timing entry.
    pub fn record_navigation_timing(&mut self, timing: NavigationTiming) {
        if !self.config.capture_navigation_timing {
            return;
        }
        self.pending.push(Envelope::new("navigation_timing", &timing));
    }

    /// The latest vitals.
    pub fn web_vitals(&self) -> WebVitals {
        self.vitals
    }

    /// Take the envelopes accumulated since the last call.
    pub fn take_pending(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.pending)
    }
}
