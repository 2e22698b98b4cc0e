//! Agent configuration.
//!
//! A single init record owns every recognized option. Configs deserialize
//! from host-provided JSON (unknown fields are ignored) or are built in code
//! with the `with_*` methods. Validation happens once, at init: a bad config
//! turns the whole agent into a logged no-op rather than an error the host
//! has to handle.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Deployment environment reported with every event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development.
    Development,
    /// Pre-production.
    Staging,
    /// Production.
    #[default]
    Production,
}

/// Privacy controls applied during capture, before anything is buffered.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrivacyConfig {
    /// Mask values of text-like inputs in replay snapshots.
    pub mask_inputs: bool,
    /// Mask password inputs. Always honored; disabling only widens masking
    /// of non-password fields.
    pub mask_passwords: bool,
    /// Mask values that look like credit card numbers.
    pub mask_credit_cards: bool,
    /// When non-empty, only URLs matching one of these patterns are
    /// monitored.
    pub allow_urls: Vec<String>,
    /// URLs matching any of these patterns are never monitored.
    pub deny_urls: Vec<String>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        PrivacyConfig {
            mask_inputs: false,
            mask_passwords: true,
            mask_credit_cards: true,
            allow_urls: Vec::new(),
            deny_urls: Vec::new(),
        }
    }
}

/// Which performance signals the agent records.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceConfig {
    /// Record web vitals (LCP, FID, CLS, FCP, TTFB).
    pub capture_web_vitals: bool,
    /// Record per-resource load timings.
    pub capture_resource_timing: bool,
    /// Record navigation timing.
    pub capture_navigation_timing: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        PerformanceConfig {
            capture_web_vitals: true,
            capture_resource_timing: true,
            capture_navigation_timing: true,
        }
    }
}

/// Session replay capture controls.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplayConfig {
    /// Capture DOM snapshots and the mutation stream.
    pub enabled: bool,
    /// Mask every input value regardless of sensitivity markers.
    pub mask_all_inputs: bool,
    /// Mask every text node.
    pub mask_all_text: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        ReplayConfig {
            enabled: true,
            mask_all_inputs: false,
            mask_all_text: false,
        }
    }
}

/// The init record. `api_key` is the only required field.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    /// Project key sent as `X-API-Key` with every submission.
    pub api_key: String,
    /// Base URL of the ingestion service.
    pub api_url: String,
    /// Deployment environment tag.
    pub environment: Environment,
    /// Emit verbose internal diagnostics.
    pub debug: bool,
    /// Admission probability for error and performance events, in [0, 1].
    pub sample_rate: f64,
    /// Admission probability for session/replay events, in [0, 1].
    pub session_sample_rate: f64,
    /// Capacity of the breadcrumb ring.
    pub max_breadcrumbs: usize,
    /// Privacy controls.
    pub privacy: PrivacyConfig,
    /// Performance capture controls.
    pub performance: PerformanceConfig,
    /// Replay capture controls.
    pub replay: ReplayConfig,
    /// Requests matching any of these regexes are never monitored.
    pub exclude_urls: Vec<String>,
    /// Directory holding the embedded offline database. `None` keeps the
    /// queue in memory only.
    pub storage_dir: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            api_key: String::new(),
            api_url: "https://api.revi.dev".to_string(),
            environment: Environment::default(),
            debug: false,
            sample_rate: 1.0,
            session_sample_rate: 1.0,
            max_breadcrumbs: DEFAULT_MAX_BREADCRUMBS,
            privacy: PrivacyConfig::default(),
            performance: PerformanceConfig::default(),
            replay: ReplayConfig::default(),
            exclude_urls: Vec::new(),
            storage_dir: None,
        }
    }
}

/// Default capacity of the breadcrumb ring.
pub const DEFAULT_MAX_BREADCRUMBS: usize = 50;

impl MonitorConfig {
    /// A config with the given project key and defaults everywhere else.
    pub fn new(api_key: impl Into<String>) -> Self {
        MonitorConfig {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// Set the ingestion base URL.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Set the deployment environment.
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Set the error/performance sample rate.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Set the session sample rate.
    pub fn with_session_sample_rate(mut self, rate: f64) -> Self {
        self.session_sample_rate = rate;
        self
    }

    /// Set the breadcrumb ring capacity.
    pub fn with_max_breadcrumbs(mut self, capacity: usize) -> Self {
        self.max_breadcrumbs = capacity;
        self
    }

    /// Set privacy controls.
    pub fn with_privacy(mut self, privacy: PrivacyConfig) -> Self {
        self.privacy = privacy;
        self
    }

    /// Set performance capture controls.
    pub fn with_performance(mut self, performance: PerformanceConfig) -> Self {
        self.performance = performance;
        self
    }

    /// Set replay capture controls.
    pub fn with_replay(mut self, replay: ReplayConfig) -> Self {
        self.replay = replay;
        self
    }

    /// Add a request-exclusion regex.
    pub fn with_exclude_url(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_urls.push(pattern.into());
        self
    }

    /// Set the offline database directory.
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Validate the record. Called once at init.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.api_key.trim().is_empty() {
            return Err(AgentError::Config("apiKey is required".into()));
        }
        if self.api_url.trim().is_empty() {
            return Err(AgentError::Config("apiUrl must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(AgentError::Config(format!(
                "sampleRate must be within [0, 1], got {}",
                self.sample_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.session_sample_rate) {
            return Err(AgentError::Config(format!(
                "sessionSampleRate must be within [0, 1], got {}",
                self.session_sample_rate
            )));
        }
        if self.max_breadcrumbs == 0 {
            return Err(AgentError::Config("maxBreadcrumbs must be at least 1".into()));
        }
        Ok(())
    }
}
