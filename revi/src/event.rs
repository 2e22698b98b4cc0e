//! The typed events the capture layer produces.
//!
//! Everything the agent ships is one of three wire shapes: an [`ErrorEvent`],
//! a [`NetworkEvent`], or a [`SessionEvent`] carrying an open-ended
//! `{kind, data}` [`Envelope`] (replay snapshots, performance entries,
//! session lifecycle). Events are created by the capture layer, immutable
//! afterwards, and destroyed after successful upload or eviction.

use std::collections::BTreeMap;
use std::fmt;
use std::num::ParseIntError;

use serde::{Deserialize, Serialize};

use crate::common::Value;
use crate::trace::{SpanId, TraceId};

/// Severity of an error event or breadcrumb.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Diagnostic detail, hidden by default in most views.
    Debug,
    /// Expected, informational occurrences.
    #[default]
    Info,
    /// Something unexpected that did not interrupt the user.
    Warning,
    /// A handled or unhandled error.
    Error,
    /// An error that broke the page for the user.
    Critical,
}

impl Severity {
    /// Canonical lowercase name, as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 16-byte value uniquely identifying a captured event.
#[derive(Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct EventId(u128);

impl EventId {
    /// Invalid event id.
    pub const INVALID: EventId = EventId(0);

    /// Create an event id from its representation as a byte array.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        EventId(u128::from_be_bytes(bytes))
    }

    /// Converts a string in base 16 to an event id.
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u128::from_str_radix(hex, 16).map(EventId)
    }
}

impl From<u128> for EventId {
    fn from(value: u128) -> Self {
        EventId(value)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl Serialize for EventId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        EventId::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Identity the host application attaches to the session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    /// Stable user id in the host application.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Email address, if the host chooses to attach it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Snapshot of the client environment at capture time, owned exclusively by
/// the event it is attached to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// User-agent string of the host environment.
    pub user_agent: String,
    /// Viewport width in CSS pixels.
    pub viewport_width: u32,
    /// Viewport height in CSS pixels.
    pub viewport_height: u32,
}

/// A captured error, normalized and fingerprinted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    /// Unique id for this occurrence.
    pub event_id: EventId,
    /// Capture time, ms since epoch.
    pub timestamp: u64,
    /// Raw error message.
    pub message: String,
    /// Normalized stack trace, one frame per line, at most ten frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<String>>,
    /// Page URL at capture time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Session the error occurred in; always the session active at
    /// `timestamp`.
    pub session_id: String,
    /// Client environment snapshot.
    pub client: ClientInfo,
    /// Free-form string tags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Free-form structured context supplied at the capture site.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
    /// Severity of the occurrence.
    pub severity: Severity,
    /// Stable hash grouping identical bugs.
    pub fingerprint: String,
    /// Looser hash grouping structurally similar errors.
    pub pattern_hash: String,
    /// Human-readable group title.
    pub title: String,
    /// Identity the host attached to the session, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserContext>,
    /// Trace active when the error was captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    /// Span active when the error was captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<SpanId>,
    /// Parent of the active span.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    /// Timeline snapshot taken at the moment of capture.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breadcrumbs: Vec<Breadcrumb>,
}

/// Category of a breadcrumb entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreadcrumbCategory {
    /// Route or URL changes.
    Navigation,
    /// Clicks, scrolls, focus changes.
    Ui,
    /// Request start/end markers.
    Network,
    /// Captured console output.
    Console,
    /// Host-supplied entries.
    Custom,
}

impl BreadcrumbCategory {
    /// Canonical lowercase name, as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            BreadcrumbCategory::Navigation => "navigation",
            BreadcrumbCategory::Ui => "ui",
            BreadcrumbCategory::Network => "network",
            BreadcrumbCategory::Console => "console",
            BreadcrumbCategory::Custom => "custom",
        }
    }
}

/// A small typed log entry describing a recent user or system event,
/// attached as context to errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breadcrumb {
    /// Capture time, ms since epoch.
    pub timestamp: u64,
    /// What produced the entry.
    pub category: BreadcrumbCategory,
    /// Severity of the entry.
    pub level: Severity,
    /// Short human-readable description.
    pub message: String,
    /// Free-form structured detail.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, Value>,
}

impl Breadcrumb {
    /// A `custom`-category breadcrumb with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Breadcrumb {
            timestamp: crate::common::now_millis(),
            category: BreadcrumbCategory::Custom,
            level: Severity::Info,
            message: message.into(),
            data: BTreeMap::new(),
        }
    }

    /// Set the category.
    pub fn with_category(mut self, category: BreadcrumbCategory) -> Self {
        self.category = category;
        self
    }

    /// Set the level.
    pub fn with_level(mut self, level: Severity) -> Self {
        self.level = level;
        self
    }

    /// Attach one structured data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// A monitored request/response pair. `status == 0` encodes a transport
/// failure, not an HTTP status.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEvent {
    /// Request method.
    pub method: String,
    /// Full request URL.
    pub url: String,
    /// Response status code; 0 for transport failures.
    pub status: u16,
    /// Request body size in bytes.
    pub request_size: u64,
    /// Response body size in bytes.
    pub response_size: u64,
    /// Request body, captured only for allow-listed URLs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    /// Response body, captured only for allow-listed URLs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// Request headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request_headers: BTreeMap<String, String>,
    /// Response headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub response_headers: BTreeMap<String, String>,
    /// Trace id of the outgoing request; correlated with any trace id the
    /// server echoed back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    /// Span id assigned to this call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<SpanId>,
    /// Request start, ms since epoch.
    pub start_time: u64,
    /// Wall time from send to settle, in ms.
    pub duration_ms: u64,
}

/// An open-ended `{kind, data}` payload. `kind` selects a schema the
/// ingestion service understands; `data` for unknown kinds is an opaque map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload discriminator, e.g. `dom_snapshot` or `web_vitals`.
    pub kind: String,
    /// Schema-specific payload.
    pub data: serde_json::Value,
}

impl Envelope {
    /// Construct an envelope from a serializable payload.
    ///
    /// Serialization failure degrades to a null payload rather than erroring;
    /// capture paths never propagate serialization problems to the host.
    pub fn new<T: Serialize>(kind: impl Into<String>, data: &T) -> Self {
        Envelope {
            kind: kind.into(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// One entry of a `POST /api/capture/session-event` batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Session the event belongs to.
    pub session_id: String,
    /// Payload discriminator.
    pub event_type: String,
    /// Schema-specific payload.
    pub data: serde_json::Value,
    /// Capture time, ms since epoch.
    pub timestamp: u64,
}

/// The event kinds the pipeline partitions by: sampling rates, offline-store
/// partitions and sync batches are all per-kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Captured errors.
    Error,
    /// Session lifecycle and replay payloads.
    Session,
    /// Performance entries.
    Performance,
    /// Monitored network calls.
    Network,
}

impl EventKind {
    /// Canonical lowercase name, used as the store partition tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Error => "error",
            EventKind::Session => "session",
            EventKind::Performance => "performance",
            EventKind::Network => "network",
        }
    }

    /// Parse a store partition tag.
    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "error" => Some(EventKind::Error),
            "session" => Some(EventKind::Session),
            "performance" => Some(EventKind::Performance),
            "network" => Some(EventKind::Network),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload priority of a stored item. Orderings place `Critical` first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Submitted before everything else; never evicted while lower bands
    /// remain.
    Critical,
    /// Uncaught errors.
    High,
    /// Handled errors, session events.
    #[default]
    Medium,
    /// Bulk telemetry.
    Low,
}

impl Priority {
    /// Canonical lowercase name, used in the store schema.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// Parse a store priority tag.
    pub fn parse(s: &str) -> Option<Priority> {
        match s {
            "critical" => Some(Priority::Critical),
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_by_seriousness() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn priority_orders_critical_first() {
        let mut priorities = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            EventKind::Error,
            EventKind::Session,
            EventKind::Performance,
            EventKind::Network,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("bogus"), None);
    }

    #[test]
    fn breadcrumb_builder() {
        let crumb = Breadcrumb::new("clicked #submit")
            .with_category(BreadcrumbCategory::Ui)
            .with_level(Severity::Debug)
            .with_data("selector", "#submit");
        assert_eq!(crumb.category, BreadcrumbCategory::Ui);
        assert_eq!(crumb.data["selector"], Value::from("#submit"));
    }

    #[test]
    fn event_id_hex_round_trip() {
        let id = EventId::from(0xdead_beefu128);
        assert_eq!(EventId::from_hex(&id.to_string()), Ok(id));
    }

    #[test]
    fn session_event_uses_snake_case() {
        let event = SessionEvent {
            session_id: "s1".into(),
            event_type: "session_start".into(),
            data: serde_json::json!({}),
            timestamp: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("session_id").is_some());
        assert!(json.get("event_type").is_some());
    }
}
