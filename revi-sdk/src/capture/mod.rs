//! The monitor: capture entry points and agent lifecycle.
//!
//! A [`Monitor`] is the explicitly constructed process-lifetime object the
//! host talks to. It owns the breadcrumb ring, session state, the sampler,
//! the replay serializer, the performance recorder and the background tasks
//! that feed the resilience pipeline. Every public method is safe to call
//! with any configuration: a monitor built from an invalid config logs once
//! and becomes a no-op, and no capture entry point ever panics or returns an
//! error to the host.
//!
//! Capture paths are non-suspending: they sample, build the event and hand
//! it to a spawned task; all slow work (serialization batches, HTTP,
//! storage) happens behind that boundary.

pub mod network;
pub mod performance;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use revi::common::{now_millis, Value};
use revi::config::MonitorConfig;
use revi::event::{
    Breadcrumb, BreadcrumbCategory, ClientInfo, ErrorEvent, EventId, EventKind, Priority,
    SessionEvent, Severity, UserContext,
};
use revi::trace::{SpanContext, TraceFlags};
use revi_http::{HttpClient, HttpError};
use tracing::{debug, warn};

use crate::breadcrumbs::BreadcrumbRing;
use crate::circuit::{CircuitConfig, CircuitSnapshot};
use crate::coordinator::{CoordinatorConfig, ResilienceCoordinator};
use crate::fingerprint::Fingerprinter;
use crate::health::{HealthConfig, HealthMonitor, HealthSnapshot, RegionEndpoint};
use crate::ids::{IdGenerator, RandomIdGenerator};
use crate::replay::dom::{DomDocument, Viewport};
use crate::replay::mutation::{DomChange, DomMutation};
use crate::replay::snapshot::DomSerializer;
use crate::retry::RetryPolicy;
use crate::runtime::CancelToken;
use crate::sampler::{Sampler, SamplerConfig};
use crate::store::{OfflineStore, StoreConfig};
use crate::sync::{HostConditions, SyncConfig, SyncManager, SyncProgress};
use crate::transport::Transport;

use self::network::{InstrumentedClient, NetworkCapture, WATCHDOG_INTERVAL};
use self::performance::{
    NavigationTiming, PerformanceRecorder, ResourceTiming, VitalKind, WebVitals,
};

/// Options accepted by the explicit capture calls.
#[derive(Clone, Debug, Default)]
pub struct CaptureOptions {
    /// Severity override.
    pub level: Option<Severity>,
    /// Tags merged into the event.
    pub tags: BTreeMap<String, String>,
    /// Free-form structured context.
    pub extra: BTreeMap<String, Value>,
}

impl CaptureOptions {
    /// Options with a severity override.
    pub fn level(level: Severity) -> Self {
        CaptureOptions {
            level: Some(level),
            ..Default::default()
        }
    }

    /// Add a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add a structured context entry.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Facts about the host environment, reported once at init.
#[derive(Clone, Debug, Default)]
pub struct HostInfo {
    /// User-agent string.
    pub user_agent: String,
    /// Viewport width in CSS pixels.
    pub viewport_width: u32,
    /// Viewport height in CSS pixels.
    pub viewport_height: u32,
}

/// Stands in when no HTTP client was supplied; every send fails as a
/// transport error, so captures park in the offline store.
#[derive(Debug, Default)]
struct DisabledClient;

#[async_trait]
impl HttpClient for DisabledClient {
    async fn send(
        &self,
        _request: http::Request<Vec<u8>>,
    ) -> Result<http::Response<Vec<u8>>, HttpError> {
        Err(HttpError::Connection("no http client configured".into()))
    }
}

/// Builder for a [`Monitor`].
#[derive(Debug)]
pub struct MonitorBuilder {
    config: MonitorConfig,
    client: Option<Arc<dyn HttpClient>>,
    host: HostInfo,
    regions: Vec<RegionEndpoint>,
    retry: RetryPolicy,
    circuit: CircuitConfig,
    sync: SyncConfig,
    health: HealthConfig,
    probe_health: bool,
}

impl MonitorBuilder {
    /// Provide the HTTP client used for ingestion traffic.
    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Provide host environment facts.
    pub fn with_host_info(mut self, host: HostInfo) -> Self {
        self.host = host;
        self
    }

    /// Add an ingestion region for health probing and failover reporting.
    /// The configured `api_url` is always the first region.
    pub fn with_region(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.regions.push(RegionEndpoint {
            name: name.into(),
            url: url.into(),
        });
        self
    }

    /// Override the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the circuit-breaker configuration.
    pub fn with_circuit_config(mut self, circuit: CircuitConfig) -> Self {
        self.circuit = circuit;
        self
    }

    /// Override the sync configuration.
    pub fn with_sync_config(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Disable the periodic health probes (they stay available on demand).
    pub fn without_health_probes(mut self) -> Self {
        self.probe_health = false;
        self
    }

    /// Construct the monitor. Never fails: invalid configuration yields a
    /// disabled monitor that warns once.
    pub fn build(self) -> Monitor {
        let enabled = match self.config.validate() {
            Ok(()) => {
                if self.client.is_none() {
                    warn!("no HTTP client configured; captures will queue offline only");
                }
                true
            }
            Err(err) => {
                warn!(error = %err, "invalid configuration, monitor disabled");
                false
            }
        };

        let client: Arc<dyn HttpClient> =
            self.client.unwrap_or_else(|| Arc::new(DisabledClient));
        let cancel = CancelToken::new();
        let ids = RandomIdGenerator::default();
        let session_span = SpanContext::new(
            ids.new_trace_id(),
            ids.new_span_id(),
            None,
            TraceFlags::SAMPLED,
        );
        let max_breadcrumbs = self.config.max_breadcrumbs;
        let perf_config = self.config.performance.clone();

        let store = Arc::new(OfflineStore::open(StoreConfig {
            directory: self.config.storage_dir.clone(),
            max_bytes: None,
        }));

        let mut regions = vec![RegionEndpoint {
            name: "primary".to_string(),
            url: self.config.api_url.clone(),
        }];
        regions.extend(self.regions);
        let health = enabled
            .then(|| HealthMonitor::new(Arc::clone(&client), regions, self.health.clone()));

        let transport = Arc::new(Transport::new(
            Arc::clone(&client),
            self.config.api_url.clone(),
            self.config.api_key.clone(),
        ));
        let coordinator = Arc::new(ResilienceCoordinator::new(
            transport,
            Arc::clone(&store),
            health.clone(),
            CoordinatorConfig {
                retry: self.retry,
                circuit: self.circuit,
            },
            cancel.clone(),
        ));
        let sync = SyncManager::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            health.clone(),
            self.sync,
        );

        let sampler = Arc::new(Sampler::new(SamplerConfig {
            error_rate: self.config.sample_rate,
            session_rate: self.config.session_sample_rate,
            performance_rate: self.config.sample_rate,
            ..SamplerConfig::default()
        }));

        let (network_sink, network_events) = tokio::sync::mpsc::unbounded_channel();
        let network = Arc::new(NetworkCapture::new(
            &self.config,
            session_span.clone(),
            network_sink,
        ));

        let session_id = uuid::Uuid::new_v4().to_string();
        let inner = Arc::new(MonitorInner {
            config: self.config,
            enabled,
            session: Mutex::new(SessionState {
                id: session_id,
                started_at: now_millis(),
                user: None,
                url: None,
            }),
            ring: Mutex::new(BreadcrumbRing::new(max_breadcrumbs)),
            sampler,
            fingerprinter: Fingerprinter::new(),
            ids,
            store,
            coordinator,
            sync,
            health,
            serializer: Mutex::new(DomSerializer::new()),
            replay_buffer: Mutex::new(Vec::new()),
            last_viewport: Mutex::new(Viewport::default()),
            perf: Mutex::new(PerformanceRecorder::new(perf_config)),
            network,
            host: self.host,
            session_span,
            runtime: tokio::runtime::Handle::try_current().ok(),
            cancel,
            tasks: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        });

        let monitor = Monitor { inner };
        if monitor.inner.config.debug {
            debug!(
                api_url = %monitor.inner.config.api_url,
                environment = ?monitor.inner.config.environment,
                sample_rate = monitor.inner.config.sample_rate,
                storage_degraded = monitor.inner.store.is_degraded(),
                "monitor initialized"
            );
        }
        monitor.spawn_background(network_events, self.probe_health);
        if monitor.inner.enabled {
            monitor.inner.dispatch_session_event(
                "session_start",
                serde_json::json!({
                    "startedAt": now_millis(),
                    "environment": monitor.inner.config.environment,
                    "userAgent": monitor.inner.host.user_agent,
                }),
            );
        }
        monitor
    }
}

#[derive(Debug)]
struct SessionState {
    id: String,
    started_at: u64,
    user: Option<UserContext>,
    url: Option<String>,
}

#[derive(Debug)]
struct MonitorInner {
    config: MonitorConfig,
    enabled: bool,
    session: Mutex<SessionState>,
    ring: Mutex<BreadcrumbRing>,
    sampler: Arc<Sampler>,
    fingerprinter: Fingerprinter,
    ids: RandomIdGenerator,
    store: Arc<OfflineStore>,
    coordinator: Arc<ResilienceCoordinator>,
    sync: Arc<SyncManager>,
    health: Option<Arc<HealthMonitor>>,
    serializer: Mutex<DomSerializer>,
    replay_buffer: Mutex<Vec<DomChange>>,
    last_viewport: Mutex<Viewport>,
    perf: Mutex<PerformanceRecorder>,
    network: Arc<NetworkCapture>,
    host: HostInfo,
    session_span: SpanContext,
    runtime: Option<tokio::runtime::Handle>,
    cancel: CancelToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    destroyed: AtomicBool,
}

/// The application-monitoring agent.
///
/// Cheap to clone; all clones share one agent. Construct with
/// [`Monitor::builder`], tear down with [`Monitor::destroy`].
#[derive(Clone, Debug)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    /// Start building a monitor for `config`.
    pub fn builder(config: MonitorConfig) -> MonitorBuilder {
        MonitorBuilder {
            config,
            client: None,
            host: HostInfo::default(),
            regions: Vec::new(),
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
            sync: SyncConfig::default(),
            health: HealthConfig::default(),
            probe_health: true,
        }
    }

    /// Capture a handled error. Returns the event id when admitted.
    pub fn capture_error(
        &self,
        error: &(dyn std::error::Error + '_),
        options: CaptureOptions,
    ) -> Option<EventId> {
        let stack = error_chain(error);
        self.inner.capture_event(
            &error.to_string(),
            stack.as_deref(),
            Severity::Error,
            options,
        )
    }

    /// Capture a message. Returns the event id when admitted.
    pub fn capture_message(&self, message: &str, options: CaptureOptions) -> Option<EventId> {
        self.inner
            .capture_event(message, None, Severity::Info, options)
    }

    /// Install a `std::panic` hook capturing panics as critical events.
    ///
    /// The previous hook keeps running after capture. The hook holds only a
    /// weak reference; a destroyed monitor stops capturing.
    pub fn install_panic_hook(&self) {
        let weak = Arc::downgrade(&self.inner);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(inner) = weak.upgrade() {
                inner.capture_panic(info);
            }
            previous(info);
        }));
    }

    /// Append a breadcrumb to the timeline.
    pub fn add_breadcrumb(&self, breadcrumb: Breadcrumb) {
        if !self.inner.active() {
            return;
        }
        if let Ok(mut ring) = self.inner.ring.lock() {
            ring.push(breadcrumb);
        }
    }

    /// Record a navigation breadcrumb and update the session URL.
    pub fn record_navigation(&self, from: &str, to: &str) {
        if let Ok(mut session) = self.inner.session.lock() {
            session.url = Some(to.to_string());
        }
        self.add_breadcrumb(
            Breadcrumb::new(format!("navigated to {}", to))
                .with_category(BreadcrumbCategory::Navigation)
                .with_data("from", from)
                .with_data("to", to),
        );
    }

    /// Record a UI click breadcrumb.
    pub fn record_click(&self, target: &str) {
        self.add_breadcrumb(
            Breadcrumb::new(format!("clicked {}", target))
                .with_category(BreadcrumbCategory::Ui)
                .with_data("target", target),
        );
    }

    /// Record a console-output breadcrumb.
    pub fn record_console(&self, level: Severity, message: &str) {
        self.add_breadcrumb(
            Breadcrumb::new(message)
                .with_category(BreadcrumbCategory::Console)
                .with_level(level),
        );
    }

    /// Attach identity to the session.
    pub fn set_user_context(&self, user: UserContext) {
        if let Ok(mut session) = self.inner.session.lock() {
            session.user = Some(user);
        }
    }

    /// Record a named performance mark.
    pub fn mark(&self, name: &str) {
        self.inner.lock_perf().mark(name);
    }

    /// Milliseconds between two marks; `end` defaults to now.
    pub fn measure(&self, name: &str, start: Option<&str>, end: Option<&str>) -> Option<f64> {
        self.inner.lock_perf().measure(name, start, end)
    }

    /// The latest web vitals.
    pub fn web_vitals(&self) -> WebVitals {
        self.inner.lock_perf().web_vitals()
    }

    /// Host feed: one web-vital observation.
    pub fn record_vital(&self, kind: VitalKind, value: f64) {
        if !self.inner.active() {
            return;
        }
        self.inner.lock_perf().record_vital(kind, value);
    }

    /// Host feed: one resource-timing entry.
    pub fn record_resource_timing(&self, timing: ResourceTiming) {
        if !self.inner.active() {
            return;
        }
        self.inner.lock_perf().record_resource(timing);
    }

    /// Host feed: the navigation-timing entry.
    pub fn record_navigation_timing(&self, timing: NavigationTiming) {
        if !self.inner.active() {
            return;
        }
        self.inner.lock_perf().record_navigation_timing(timing);
    }

    /// The current session id.
    pub fn session_id(&self) -> String {
        self.inner
            .session
            .lock()
            .map(|session| session.id.clone())
            .unwrap_or_default()
    }

    /// End the current session and start a fresh one.
    pub fn end_session(&self) {
        if !self.inner.active() {
            return;
        }
        let (old_id, started_at) = match self.inner.session.lock() {
            Ok(mut session) => {
                let old = (session.id.clone(), session.started_at);
                session.id = uuid::Uuid::new_v4().to_string();
                session.started_at = now_millis();
                old
            }
            Err(_) => return,
        };
        if let Ok(mut ring) = self.inner.ring.lock() {
            ring.clear();
        }
        self.inner.dispatch(
            EventKind::Session,
            Priority::Medium,
            serde_json::to_value(SessionEvent {
                session_id: old_id,
                event_type: "session_end".to_string(),
                data: serde_json::json!({ "durationMs": now_millis().saturating_sub(started_at) }),
                timestamp: now_millis(),
            })
            .unwrap_or(serde_json::Value::Null),
        );
    }

    /// Take a full replay snapshot of the host document.
    pub fn snapshot_document(&self, document: &DomDocument) {
        if !self.inner.active() || !self.inner.config.replay.enabled {
            return;
        }
        if !self.inner.sampler.should_capture(EventKind::Session, None) {
            return;
        }
        if let Ok(mut viewport) = self.inner.last_viewport.lock() {
            *viewport = document.viewport;
        }
        let snapshot = match self.inner.serializer.lock() {
            Ok(mut serializer) => {
                serializer.prune_to(document);
                serializer.snapshot(
                    document,
                    &self.inner.config.privacy,
                    &self.inner.config.replay,
                )
            }
            Err(_) => return,
        };
        self.inner.dispatch_session_event(
            "dom_snapshot",
            serde_json::to_value(&snapshot).unwrap_or(serde_json::Value::Null),
        );
    }

    /// Record one observer mutation into the replay change stream.
    pub fn record_mutation(&self, mutation: DomMutation) {
        if !self.inner.active() || !self.inner.config.replay.enabled {
            return;
        }
        let viewport = self
            .inner
            .last_viewport
            .lock()
            .map(|viewport| *viewport)
            .unwrap_or_default();
        let change = match self.inner.serializer.lock() {
            Ok(mut serializer) => serializer.record_mutation(
                mutation,
                &viewport,
                &self.inner.config.privacy,
                &self.inner.config.replay,
            ),
            Err(_) => None,
        };
        if let Some(change) = change {
            if let Ok(mut buffer) = self.inner.replay_buffer.lock() {
                buffer.push(change);
            }
        }
    }

    /// Wrap the host's HTTP client with network capture.
    pub fn instrument_client<C: HttpClient>(&self, inner: C) -> InstrumentedClient<C> {
        InstrumentedClient::new(inner, Arc::clone(&self.inner.network))
    }

    /// Report an online/offline transition.
    pub fn set_online(&self, online: bool) {
        if !self.inner.active() {
            return;
        }
        self.inner.sync.notify_online(online, &self.session_id());
    }

    /// Report a visibility change.
    pub fn set_visible(&self, visible: bool) {
        if !self.inner.active() {
            return;
        }
        self.inner.sync.notify_visible(visible, &self.session_id());
    }

    /// Report host conditions (battery level, background state).
    pub fn set_conditions(&self, conditions: HostConditions) {
        self.inner.sync.set_conditions(conditions);
    }

    /// Observe sync progress.
    pub fn sync_progress(&self) -> tokio::sync::watch::Receiver<SyncProgress> {
        self.inner.sync.progress()
    }

    /// Flush buffered telemetry and drain the offline store.
    pub async fn flush(&self) {
        if !self.inner.active() {
            return;
        }
        self.inner.network.flush();
        self.inner.flush_side_buffers();
        if let Err(err) = self.inner.sync.sync_now(&self.session_id()).await {
            debug!(error = %err, "flush drain did not complete");
        }
    }

    /// Stop all background work and disable capture. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Park whatever is still buffered so nothing is lost.
        let leftover = self.inner.network.drain_events();
        if !leftover.is_empty() {
            self.inner.store.enqueue(
                EventKind::Network,
                Priority::Low,
                serde_json::to_value(&leftover).unwrap_or(serde_json::Value::Null),
            );
        }
        self.inner.cancel.cancel();
        if let Some(health) = &self.inner.health {
            health.shutdown();
        }
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Circuit-breaker states, for observability.
    pub fn circuit_snapshots(&self) -> Vec<(&'static str, CircuitSnapshot)> {
        self.inner.coordinator.circuit_snapshots()
    }

    /// Endpoint health, for observability.
    pub fn health_snapshot(&self) -> Option<HealthSnapshot> {
        self.inner.health.as_ref().map(|health| health.snapshot())
    }

    /// Number of items currently parked in the offline store.
    pub fn offline_backlog(&self) -> usize {
        self.inner.store.len()
    }

    /// Whether the offline store degraded to memory-only operation.
    pub fn storage_degraded(&self) -> bool {
        self.inner.store.is_degraded()
    }

    /// Whether the monitor was disabled by invalid configuration.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled && !self.inner.destroyed.load(Ordering::SeqCst)
    }

    fn spawn_background(
        &self,
        mut network_events: tokio::sync::mpsc::UnboundedReceiver<Vec<revi::event::NetworkEvent>>,
        probe_health: bool,
    ) {
        let Some(handle) = self.inner.runtime.clone() else {
            debug!("no async runtime at init; background work deferred to flush/sync");
            return;
        };
        if !self.inner.enabled {
            return;
        }
        let mut tasks = Vec::new();

        // Network batches out of the capture buffer into the pipeline.
        let coordinator = Arc::clone(&self.inner.coordinator);
        tasks.push(handle.spawn(async move {
            while let Some(batch) = network_events.recv().await {
                let payload =
                    serde_json::to_value(&batch).unwrap_or(serde_json::Value::Null);
                let _ = coordinator
                    .submit(EventKind::Network, Priority::Low, payload, None)
                    .await;
            }
        }));

        // Watchdog: idle network flush, replay/performance buffers, and
        // adaptive sampling under degraded health.
        let inner = Arc::clone(&self.inner);
        tasks.push(handle.spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.network.watchdog_tick();
                        inner.flush_side_buffers();
                        inner
                            .sampler
                            .set_rate_scale(inner.coordinator.recommended_rate_scale());
                    }
                }
            }
        }));

        if probe_health {
            if let Some(health) = &self.inner.health {
                tasks.push(health.spawn());
            }
        }

        if let Ok(mut slot) = self.inner.tasks.lock() {
            slot.extend(tasks);
        }
    }
}

impl MonitorInner {
    fn active(&self) -> bool {
        self.enabled && !self.destroyed.load(Ordering::SeqCst)
    }

    fn lock_perf(&self) -> std::sync::MutexGuard<'_, PerformanceRecorder> {
        self.perf.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn capture_event(
        &self,
        message: &str,
        stack: Option<&str>,
        default_severity: Severity,
        options: CaptureOptions,
    ) -> Option<EventId> {
        if !self.active() {
            return None;
        }
        let severity = options.level.unwrap_or(default_severity);
        if !self
            .sampler
            .should_capture(EventKind::Error, Some(severity))
        {
            return None;
        }

        let (session_id, user, url) = match self.session.lock() {
            Ok(session) => (session.id.clone(), session.user.clone(), session.url.clone()),
            Err(_) => return None,
        };
        let grouping = self.fingerprinter.analyze(message, stack, url.as_deref());
        let event_id = self.ids.new_event_id();

        let breadcrumbs = self
            .ring
            .lock()
            .map(|ring| ring.snapshot())
            .unwrap_or_default();

        let event = ErrorEvent {
            event_id,
            timestamp: now_millis(),
            message: message.to_string(),
            stack: (!grouping.normalized_stack.is_empty())
                .then(|| grouping.normalized_stack.clone()),
            url,
            session_id,
            client: ClientInfo {
                user_agent: self.host.user_agent.clone(),
                viewport_width: self.host.viewport_width,
                viewport_height: self.host.viewport_height,
            },
            tags: options.tags,
            extra: options.extra,
            severity,
            fingerprint: grouping.fingerprint,
            pattern_hash: grouping.pattern_hash,
            title: grouping.title.clone(),
            user,
            trace_id: Some(self.session_span.trace_id()),
            span_id: Some(self.session_span.span_id()),
            parent_span_id: None,
            breadcrumbs,
        };

        // Correlation anchor for any errors that follow.
        if let Ok(mut ring) = self.ring.lock() {
            ring.push(
                Breadcrumb::new(grouping.title)
                    .with_level(severity)
                    .with_data("eventId", event_id.to_string()),
            );
        }

        let priority = if severity == Severity::Critical {
            Priority::High
        } else {
            Priority::Medium
        };
        self.dispatch(
            EventKind::Error,
            priority,
            serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
        );
        Some(event_id)
    }

    // Panic context: no spawning, no allocator surprises beyond formatting.
    // The event goes straight into the store and ships on the next drain.
    fn capture_panic(&self, info: &std::panic::PanicInfo<'_>) {
        if !self.active() {
            return;
        }
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string());
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));

        let (session_id, user, url) = match self.session.lock() {
            Ok(session) => (session.id.clone(), session.user.clone(), session.url.clone()),
            Err(_) => (String::new(), None, None),
        };
        let grouping =
            self.fingerprinter
                .analyze(&message, location.as_deref(), url.as_deref());
        let event = ErrorEvent {
            event_id: self.ids.new_event_id(),
            timestamp: now_millis(),
            message,
            stack: location.map(|l| vec![l]),
            url,
            session_id,
            client: ClientInfo {
                user_agent: self.host.user_agent.clone(),
                viewport_width: self.host.viewport_width,
                viewport_height: self.host.viewport_height,
            },
            tags: BTreeMap::new(),
            extra: BTreeMap::new(),
            severity: Severity::Critical,
            fingerprint: grouping.fingerprint,
            pattern_hash: grouping.pattern_hash,
            title: grouping.title,
            user,
            trace_id: Some(self.session_span.trace_id()),
            span_id: Some(self.session_span.span_id()),
            parent_span_id: None,
            breadcrumbs: self
                .ring
                .lock()
                .map(|ring| ring.snapshot())
                .unwrap_or_default(),
        };
        self.store.enqueue(
            EventKind::Error,
            Priority::High,
            serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
        );
    }

    /// Hand a payload to the pipeline without suspending the caller.
    fn dispatch(&self, kind: EventKind, priority: Priority, payload: serde_json::Value) {
        if !self.active() {
            return;
        }
        match &self.runtime {
            Some(handle) => {
                let coordinator = Arc::clone(&self.coordinator);
                handle.spawn(async move {
                    let _ = coordinator.submit(kind, priority, payload, None).await;
                });
            }
            // No runtime: park it for the next drain.
            None => {
                self.store.enqueue(kind, priority, payload);
            }
        }
    }

    fn dispatch_session_event(&self, event_type: &str, data: serde_json::Value) {
        let session_id = self
            .session
            .lock()
            .map(|session| session.id.clone())
            .unwrap_or_default();
        self.dispatch(
            EventKind::Session,
            Priority::Medium,
            serde_json::to_value(SessionEvent {
                session_id,
                event_type: event_type.to_string(),
                data,
                timestamp: now_millis(),
            })
            .unwrap_or(serde_json::Value::Null),
        );
    }

    /// Flush the replay change buffer and pending performance envelopes.
    fn flush_side_buffers(&self) {
        let changes: Vec<DomChange> = self
            .replay_buffer
            .lock()
            .map(|mut buffer| std::mem::take(&mut *buffer))
            .unwrap_or_default();
        if !changes.is_empty() {
            self.dispatch_session_event(
                "dom_changes",
                serde_json::to_value(&changes).unwrap_or(serde_json::Value::Null),
            );
        }

        let pending = self.lock_perf().take_pending();
        for envelope in pending {
            if !self
                .sampler
                .should_capture(EventKind::Performance, None)
            {
                continue;
            }
            let session_id = self
                .session
                .lock()
                .map(|session| session.id.clone())
                .unwrap_or_default();
            self.dispatch(
                EventKind::Performance,
                Priority::Low,
                serde_json::to_value(SessionEvent {
                    session_id,
                    event_type: envelope.kind.clone(),
                    data: envelope.data,
                    timestamp: now_millis(),
                })
                .unwrap_or(serde_json::Value::Null),
            );
        }
    }
}

fn error_chain(error: &(dyn std::error::Error + '_)) -> Option<String> {
    let mut frames = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        frames.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    (!frames.is_empty()).then(|| frames.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHttpClient;
    use revi::config::MonitorConfig;

    fn monitor_with(client: &MockHttpClient) -> Monitor {
        Monitor::builder(
            MonitorConfig::new("pk_test").with_api_url("https://api.example.test"),
        )
        .with_http_client(Arc::new(client.clone()))
        .with_host_info(HostInfo {
            user_agent: "test-agent/1.0".into(),
            viewport_width: 1280,
            viewport_height: 720,
        })
        .without_health_probes()
        .build()
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn capture_message_ships_an_error_event() {
        let client = MockHttpClient::new();
        let monitor = monitor_with(&client);

        let event_id = monitor
            .capture_message("something odd", CaptureOptions::level(Severity::Warning))
            .expect("admitted");
        settle().await;

        let requests = client.requests();
        let error_request = requests
            .iter()
            .find(|request| request.uri.ends_with("/api/capture/error"))
            .expect("error endpoint hit");
        let body: serde_json::Value = serde_json::from_slice(&error_request.decoded_body()).unwrap();
        let members = crate::compress::expand_batch(body["errors"].clone());
        assert_eq!(members[0]["message"], "something odd");
        assert_eq!(members[0]["severity"], "warning");
        assert_eq!(members[0]["eventId"], event_id.to_string());
        assert_eq!(members[0]["sessionId"], monitor.session_id());
        monitor.destroy();
    }

    #[tokio::test]
    async fn breadcrumbs_attach_to_captures() {
        let client = MockHttpClient::new();
        let monitor = monitor_with(&client);

        monitor.record_navigation("/", "/checkout");
        monitor.record_click("#buy");
        monitor.capture_message("boom", CaptureOptions::level(Severity::Error));
        settle().await;

        let requests = client.requests();
        let error_request = requests
            .iter()
            .find(|request| request.uri.ends_with("/api/capture/error"))
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&error_request.decoded_body()).unwrap();
        let members = crate::compress::expand_batch(body["errors"].clone());
        let crumbs = members[0]["breadcrumbs"].as_array().unwrap();
        assert_eq!(crumbs.len(), 2);
        assert_eq!(crumbs[0]["category"], "navigation");
        assert_eq!(crumbs[1]["category"], "ui");
        // The navigation updated the session URL, which feeds the grouping.
        assert_eq!(members[0]["url"], "/checkout");
        monitor.destroy();
    }

    #[tokio::test]
    async fn invalid_config_yields_a_noop_monitor() {
        let client = MockHttpClient::new();
        let monitor = Monitor::builder(MonitorConfig::default())
            .with_http_client(Arc::new(client.clone()))
            .build();

        assert!(!monitor.is_enabled());
        assert_eq!(
            monitor.capture_message("ignored", CaptureOptions::default()),
            None
        );
        monitor.add_breadcrumb(Breadcrumb::new("ignored"));
        monitor.record_vital(VitalKind::Lcp, 1.0);
        monitor.end_session();
        monitor.flush().await;
        monitor.destroy();
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn end_session_rotates_the_session_id() {
        let client = MockHttpClient::new();
        let monitor = monitor_with(&client);

        let first = monitor.session_id();
        monitor.add_breadcrumb(Breadcrumb::new("before"));
        monitor.end_session();
        let second = monitor.session_id();
        assert_ne!(first, second);

        // The old timeline does not leak into the new session.
        monitor.capture_message("after", CaptureOptions::level(Severity::Error));
        settle().await;
        let requests = client.requests();
        let error_request = requests
            .iter()
            .find(|request| request.uri.ends_with("/api/capture/error"))
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&error_request.decoded_body()).unwrap();
        let members = crate::compress::expand_batch(body["errors"].clone());
        assert!(members[0]["breadcrumbs"]
            .as_array()
            .map_or(true, |crumbs| crumbs.is_empty()));
        monitor.destroy();
    }

    #[tokio::test]
    async fn destroy_parks_buffered_network_events() {
        let client = MockHttpClient::new();
        let monitor = monitor_with(&client);

        let instrumented = monitor.instrument_client(MockHttpClient::new());
        let request = http::Request::builder()
            .uri("https://third.party/users")
            .body(Vec::new())
            .unwrap();
        instrumented.send(request).await.unwrap();

        monitor.destroy();
        assert_eq!(monitor.inner.store.items_by_kind(EventKind::Network).len(), 1);
    }

    #[tokio::test]
    async fn sampled_out_events_return_none() {
        let client = MockHttpClient::new();
        let monitor = Monitor::builder(
            MonitorConfig::new("pk_test")
                .with_api_url("https://api.example.test")
                .with_sample_rate(0.0),
        )
        .with_http_client(Arc::new(client.clone()))
        .without_health_probes()
        .build();

        assert_eq!(
            monitor.capture_message("info-level", CaptureOptions::default()),
            None
        );
        // Severity overrides still capture.
        assert!(monitor
            .capture_message("critical", CaptureOptions::level(Severity::Critical))
            .is_some());
        monitor.destroy();
    }
}
