//! Network interception.
//!
//! Hosts route their outgoing traffic through an [`InstrumentedClient`]
//! wrapping their real [`HttpClient`]. Admitted requests get trace headers
//! injected and produce a [`NetworkEvent`]; everything else passes through
//! untouched. The admission filter's first rule is the self-loop guard: the
//! agent's own ingestion traffic is never monitored, or a capture would
//! produce a capture forever.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::{Request, Response};
use regex::Regex;
use revi::common::now_millis;
use revi::config::MonitorConfig;
use revi::event::NetworkEvent;
use revi::propagation::{Extractor, TraceContextCodec, TRACE_RESPONSE_HEADER};
use revi::trace::{SpanContext, TraceFlags, TraceId};
use revi_http::{HeaderExtractor, HeaderInjector, HttpClient, HttpError};
use tokio::time::Instant;
use tracing::debug;

use crate::ids::{IdGenerator, RandomIdGenerator};

/// Buffer size that forces a flush.
pub const NETWORK_BUFFER_HIGH_WATER: usize = 200;
/// Watchdog tick.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(3);
/// Idle time after which the watchdog flushes a non-empty buffer.
const IDLE_FLUSH_AFTER: Duration = Duration::from_secs(5);
/// Window treated as rapid activity.
const RAPID_WINDOW: Duration = Duration::from_secs(2);
/// Buffers smaller than this are not flushed during rapid activity.
const RAPID_MIN_FLUSH: usize = 10;
/// URL patterns whose bodies are captured by default.
pub const DEFAULT_BODY_ALLOW: &[&str] = &["/api/", "/graphql"];
/// Captured bodies are truncated to this many bytes.
const BODY_CAP: usize = 4096;
/// Port the ingestion service uses in local development; localhost traffic
/// to it is part of the self-loop guard.
const DEV_API_PORT: u16 = 3001;

/// The ordered admission filter for outgoing request URLs.
#[derive(Debug)]
pub struct AdmissionFilter {
    api_url: String,
    exclude: Vec<Regex>,
    deny: Vec<Regex>,
    allow: Vec<Regex>,
}

impl AdmissionFilter {
    /// Build the filter from agent configuration. Invalid patterns are
    /// skipped with a debug log; a broken pattern must not disable capture.
    pub fn new(config: &MonitorConfig) -> Self {
        AdmissionFilter {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            exclude: compile_patterns(&config.exclude_urls),
            deny: compile_patterns(&config.privacy.deny_urls),
            allow: compile_patterns(&config.privacy.allow_urls),
        }
    }

    /// Whether a request to `url` is monitored.
    ///
    /// Order: self-loop guard, caller excludes, privacy deny list, privacy
    /// allow list (exclusive when non-empty), then admit.
    pub fn admit(&self, url: &str) -> bool {
        if self.is_own_traffic(url) {
            return false;
        }
        if self.exclude.iter().any(|pattern| pattern.is_match(url)) {
            return false;
        }
        if self.deny.iter().any(|pattern| pattern.is_match(url)) {
            return false;
        }
        if !self.allow.is_empty() {
            return self.allow.iter().any(|pattern| pattern.is_match(url));
        }
        true
    }

    fn is_own_traffic(&self, url: &str) -> bool {
        if !self.api_url.is_empty() && url.starts_with(&self.api_url) {
            return true;
        }
        if url.contains("/api/analytics/") {
            return true;
        }
        if let Ok(parsed) = url::Url::parse(url) {
            let host = parsed.host_str().unwrap_or_default();
            if (host == "localhost" || host == "127.0.0.1")
                && parsed.port() == Some(DEV_API_PORT)
            {
                return true;
            }
        }
        false
    }
}

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(err) => {
                debug!(pattern, error = %err, "ignoring invalid URL pattern");
                None
            }
        })
        .collect()
}

#[derive(Debug)]
struct BufferState {
    events: Vec<NetworkEvent>,
    last_capture: Option<Instant>,
}

/// The per-kind buffer between capture and the pipeline.
#[derive(Debug)]
pub struct NetworkBuffer {
    state: Mutex<BufferState>,
    high_water: usize,
}

impl NetworkBuffer {
    /// A buffer flushing at `high_water` events.
    pub fn new(high_water: usize) -> Self {
        NetworkBuffer {
            state: Mutex::new(BufferState {
                events: Vec::new(),
                last_capture: None,
            }),
            high_water: high_water.max(1),
        }
    }

    /// Append an event. Returns the full buffer when the high-water mark is
    /// reached.
    pub fn push(&self, event: NetworkEvent) -> Option<Vec<NetworkEvent>> {
        let mut state = self.lock();
        state.events.push(event);
        state.last_capture = Some(Instant::now());
        (state.events.len() >= self.high_water).then(|| std::mem::take(&mut state.events))
    }

    /// The watchdog's flush decision: idle buffers flush, rapid activity
    /// holds small buffers back to maximize batch size.
    pub fn idle_flush(&self) -> Option<Vec<NetworkEvent>> {
        let mut state = self.lock();
        if state.events.is_empty() {
            return None;
        }
        let since_last = state.last_capture.map(|at| at.elapsed())?;
        if since_last >= IDLE_FLUSH_AFTER {
            return Some(std::mem::take(&mut state.events));
        }
        if since_last < RAPID_WINDOW && state.events.len() < RAPID_MIN_FLUSH {
            return None;
        }
        if state.events.len() >= RAPID_MIN_FLUSH {
            return Some(std::mem::take(&mut state.events));
        }
        None
    }

    /// Unconditional drain, used by `flush()` and shutdown.
    pub fn drain(&self) -> Vec<NetworkEvent> {
        std::mem::take(&mut self.lock().events)
    }

    /// Buffered event count.
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared capture state behind every instrumented client.
#[derive(Debug)]
pub struct NetworkCapture {
    filter: AdmissionFilter,
    buffer: NetworkBuffer,
    sink: tokio::sync::mpsc::UnboundedSender<Vec<NetworkEvent>>,
    ids: RandomIdGenerator,
    codec: TraceContextCodec,
    body_allow: Vec<Regex>,
    session_trace: TraceId,
    session_span: SpanContext,
}

impl NetworkCapture {
    /// Capture state for one monitor session. Flushed batches are delivered
    /// on `sink`.
    pub fn new(
        config: &MonitorConfig,
        session_span: SpanContext,
        sink: tokio::sync::mpsc::UnboundedSender<Vec<NetworkEvent>>,
    ) -> Self {
        NetworkCapture {
            filter: AdmissionFilter::new(config),
            buffer: NetworkBuffer::new(NETWORK_BUFFER_HIGH_WATER),
            sink,
            ids: RandomIdGenerator::default(),
            codec: TraceContextCodec::new(),
            body_allow: compile_patterns(
                &DEFAULT_BODY_ALLOW
                    .iter()
                    .map(|pattern| regex::escape(pattern))
                    .collect::<Vec<_>>(),
            ),
            session_trace: session_span.trace_id(),
            session_span,
        }
    }

    /// The admission filter, for hosts that pre-filter.
    pub fn filter(&self) -> &AdmissionFilter {
        &self.filter
    }

    /// Run the watchdog decision once and deliver any flushed batch.
    pub fn watchdog_tick(&self) {
        if let Some(batch) = self.buffer.idle_flush() {
            self.deliver(batch);
        }
    }

    /// Drain the buffer unconditionally and deliver.
    pub fn flush(&self) {
        let batch = self.buffer.drain();
        if !batch.is_empty() {
            self.deliver(batch);
        }
    }

    /// Drain the buffer without delivering, for shutdown parking.
    pub fn drain_events(&self) -> Vec<NetworkEvent> {
        self.buffer.drain()
    }

    fn deliver(&self, batch: Vec<NetworkEvent>) {
        if self.sink.send(batch).is_err() {
            debug!("network sink closed, dropping batch");
        }
    }

    fn record(&self, event: NetworkEvent) {
        if let Some(batch) = self.buffer.push(event) {
            self.deliver(batch);
        }
    }

    fn capture_body(&self, url: &str, body: &[u8]) -> Option<String> {
        if body.is_empty() || !self.body_allow.iter().any(|pattern| pattern.is_match(url)) {
            return None;
        }
        let text = String::from_utf8_lossy(body);
        let mut text = text.into_owned();
        if text.len() > BODY_CAP {
            let mut cap = BODY_CAP;
            while !text.is_char_boundary(cap) {
                cap -= 1;
            }
            text.truncate(cap);
        }
        Some(text)
    }
}

/// A wrapper around the host's HTTP client that records admitted traffic.
#[derive(Debug)]
pub struct InstrumentedClient<C> {
    inner: C,
    capture: Arc<NetworkCapture>,
}

impl<C> InstrumentedClient<C> {
    /// Wrap `inner` with the given capture state.
    pub fn new(inner: C, capture: Arc<NetworkCapture>) -> Self {
        InstrumentedClient { inner, capture }
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for InstrumentedClient<C> {
    async fn send(&self, mut request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, HttpError> {
        let url = request.uri().to_string();
        if !self.capture.filter.admit(&url) {
            return self.inner.send(request).await;
        }

        // A fresh span under the session root, injected into the request.
        let span = SpanContext::new(
            self.capture.session_trace,
            self.capture.ids.new_span_id(),
            Some(self.capture.session_span.span_id()),
            TraceFlags::SAMPLED,
        );
        self.capture
            .codec
            .inject(&span, &mut HeaderInjector(request.headers_mut()));

        let method = request.method().to_string();
        let request_headers = header_map(request.headers());
        let request_size = request.body().len() as u64;
        let request_body = self.capture.capture_body(&url, request.body());
        let start_time = now_millis();
        let started = Instant::now();

        let result = self.inner.send(request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let event = match &result {
            Ok(response) => {
                // Prefer the trace id the server says it recorded.
                let trace_id = Extractor::get(
                    &HeaderExtractor(response.headers()),
                    TRACE_RESPONSE_HEADER,
                )
                .and_then(|value| TraceId::from_hex(value).ok())
                .filter(|id| id.is_valid())
                .unwrap_or(self.capture.session_trace);
                NetworkEvent {
                    method,
                    url: url.clone(),
                    status: response.status().as_u16(),
                    request_size,
                    response_size: response.body().len() as u64,
                    request_body,
                    response_body: self.capture.capture_body(&url, response.body()),
                    request_headers,
                    response_headers: header_map(response.headers()),
                    trace_id: Some(trace_id),
                    span_id: Some(span.span_id()),
                    start_time,
                    duration_ms,
                }
            }
            Err(_) => NetworkEvent {
                method,
                url: url.clone(),
                status: 0,
                request_size,
                response_size: 0,
                request_body,
                response_body: None,
                request_headers,
                response_headers: BTreeMap::new(),
                trace_id: Some(span.trace_id()),
                span_id: Some(span.span_id()),
                start_time,
                duration_ms,
            },
        };
        self.capture.record(event);

        result
    }
}

fn header_map(headers: &http::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHttpClient;
    use revi::config::MonitorConfig;
    use revi::trace::SpanId;
    use tokio::sync::mpsc;

    fn config() -> MonitorConfig {
        let mut config = MonitorConfig::new("pk_test").with_api_url("https://api.example.test");
        config.privacy.deny_urls = vec!["private\\.test".to_string()];
        config
    }

    fn capture_rig(
        config: &MonitorConfig,
    ) -> (
        Arc<NetworkCapture>,
        mpsc::UnboundedReceiver<Vec<NetworkEvent>>,
    ) {
        let (sink, events) = mpsc::unbounded_channel();
        let session_span = SpanContext::new(
            TraceId::from(7u128),
            SpanId::from(7u64),
            None,
            TraceFlags::SAMPLED,
        );
        (
            Arc::new(NetworkCapture::new(config, session_span, sink)),
            events,
        )
    }

    #[test]
    fn admission_filter_order() {
        let mut config = config();
        config.exclude_urls = vec!["cdn\\.test".to_string()];
        config.privacy.allow_urls = vec![];
        let filter = AdmissionFilter::new(&config);

        // Self-loop guard.
        assert!(!filter.admit("https://api.example.test/api/capture/error"));
        assert!(!filter.admit("https://third.party/api/analytics/foo"));
        assert!(!filter.admit("http://localhost:3001/api/capture/error"));
        assert!(!filter.admit("http://127.0.0.1:3001/health"));
        // Caller excludes, then privacy deny.
        assert!(!filter.admit("https://cdn.test/bundle.js"));
        assert!(!filter.admit("https://private.test/users"));
        // Everything else is admitted.
        assert!(filter.admit("https://third.party/users"));
    }

    #[test]
    fn allow_list_is_exclusive_when_set() {
        let mut config = config();
        config.privacy.allow_urls = vec!["observed\\.test".to_string()];
        let filter = AdmissionFilter::new(&config);

        assert!(filter.admit("https://observed.test/users"));
        assert!(!filter.admit("https://third.party/users"));
        // The self-loop guard still wins over the allow list.
        assert!(!filter.admit("https://api.example.test/api/capture/error"));
    }

    #[tokio::test]
    async fn unmonitored_requests_pass_through_untouched() {
        let config = config();
        let (capture, _events) = capture_rig(&config);
        let mock = MockHttpClient::new();
        let client = InstrumentedClient::new(mock.clone(), capture.clone());

        let request = Request::builder()
            .uri("https://api.example.test/api/capture/error")
            .body(Vec::new())
            .unwrap();
        client.send(request).await.unwrap();

        assert_eq!(mock.requests()[0].header("traceparent"), None);
        assert!(capture.buffer.is_empty());
    }

    #[tokio::test]
    async fn admitted_requests_get_trace_headers_and_events() {
        let config = config();
        let (capture, _events) = capture_rig(&config);
        let mock = MockHttpClient::new();
        let client = InstrumentedClient::new(mock.clone(), capture.clone());

        let request = Request::builder()
            .method("POST")
            .uri("https://third.party/users")
            .body(b"{}".to_vec())
            .unwrap();
        client.send(request).await.unwrap();

        let sent = &mock.requests()[0];
        let traceparent = sent.header("traceparent").expect("traceparent injected");
        assert!(traceparent.starts_with("00-00000000000000000000000000000007-"));
        assert!(sent.header("x-revi-parent-span").is_some());

        assert_eq!(capture.buffer.len(), 1);
    }

    #[tokio::test]
    async fn transport_failures_record_status_zero() {
        let config = config();
        let (capture, _events) = capture_rig(&config);
        let mock = MockHttpClient::new();
        mock.enqueue_transport_error("refused");
        let client = InstrumentedClient::new(mock, capture.clone());

        let request = Request::builder()
            .uri("https://third.party/users")
            .body(Vec::new())
            .unwrap();
        let result = client.send(request).await;
        assert!(result.is_err());

        let batch = capture.buffer.drain();
        assert_eq!(batch[0].status, 0);
        assert_eq!(batch[0].response_size, 0);
    }

    #[tokio::test]
    async fn bodies_are_captured_only_for_allowlisted_urls() {
        let config = config();
        let (capture, _events) = capture_rig(&config);
        let mock = MockHttpClient::new();
        let client = InstrumentedClient::new(mock.clone(), capture.clone());

        let request = Request::builder()
            .uri("https://third.party/api/users")
            .body(b"{\"q\":1}".to_vec())
            .unwrap();
        client.send(request).await.unwrap();

        let request = Request::builder()
            .uri("https://third.party/assets/logo.png")
            .body(b"binary".to_vec())
            .unwrap();
        client.send(request).await.unwrap();

        let batch = capture.buffer.drain();
        assert_eq!(batch[0].request_body.as_deref(), Some("{\"q\":1}"));
        assert_eq!(batch[1].request_body, None);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_flushes_idle_buffers() {
        let config = config();
        let (capture, mut events) = capture_rig(&config);
        let mock = MockHttpClient::new();
        let client = InstrumentedClient::new(mock, capture.clone());

        let request = Request::builder()
            .uri("https://third.party/users")
            .body(Vec::new())
            .unwrap();
        client.send(request).await.unwrap();

        // Rapid activity with a small buffer: held back.
        capture.watchdog_tick();
        assert!(events.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(6)).await;
        capture.watchdog_tick();
        let batch = events.try_recv().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(capture.buffer.is_empty());
    }

    #[tokio::test]
    async fn high_water_forces_a_flush() {
        let config = config();
        let (capture, mut events) = capture_rig(&config);

        for n in 0..NETWORK_BUFFER_HIGH_WATER {
            capture.record(NetworkEvent {
                method: "GET".into(),
                url: format!("https://third.party/{}", n),
                status: 200,
                request_size: 0,
                response_size: 0,
                request_body: None,
                response_body: None,
                request_headers: BTreeMap::new(),
                response_headers: BTreeMap::new(),
                trace_id: None,
                span_id: None,
                start_time: 0,
                duration_ms: 0,
            });
        }

        let batch = events.try_recv().unwrap();
        assert_eq!(batch.len(), NETWORK_BUFFER_HIGH_WATER);
        assert!(capture.buffer.is_empty());
    }
}
