//! The wire protocol: request building and response classification.
//!
//! Everything the agent ships goes out as an HTTPS POST of JSON (gzipped
//! above a threshold) to one of three capture endpoints, authenticated by
//! the project key in `X-API-Key`. Responses are folded into the error
//! taxonomy here — retryable statuses become [`AgentError::ServerRetryable`]
//! carrying any `Retry-After` hint, terminal statuses become
//! [`AgentError::ServerTerminal`] — so the retry engine and circuit breaker
//! never look at raw HTTP.

use std::sync::Arc;
use std::time::Duration;

use http::{header, Request};
use revi::common::now_millis;
use revi::error::{AgentError, AgentResult};
use revi_http::{HttpClient, HttpError};
use serde::Deserialize;
use tracing::debug;

use crate::compress::maybe_compress;

/// Header carrying the project key.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Header marking submissions that belong to a reconnect drain.
pub const SYNC_SESSION_HEADER: &str = "x-sync-session";
/// `Retry-After` ceiling; larger server hints are capped.
const RETRY_AFTER_CAP: Duration = Duration::from_secs(600);

/// The three ingestion endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CaptureEndpoint {
    /// `POST /api/capture/error`
    Error,
    /// `POST /api/capture/session-event`
    SessionEvent,
    /// `POST /api/capture/network-event`
    NetworkEvent,
}

impl CaptureEndpoint {
    /// URL path of the endpoint.
    pub fn path(&self) -> &'static str {
        match self {
            CaptureEndpoint::Error => "/api/capture/error",
            CaptureEndpoint::SessionEvent => "/api/capture/session-event",
            CaptureEndpoint::NetworkEvent => "/api/capture/network-event",
        }
    }

    /// Key used for the per-endpoint circuit breaker.
    pub fn feature(&self) -> &'static str {
        match self {
            CaptureEndpoint::Error => "capture-error",
            CaptureEndpoint::SessionEvent => "capture-session",
            CaptureEndpoint::NetworkEvent => "capture-network",
        }
    }

    /// The endpoint a stored item of `kind` submits to.
    pub fn for_kind(kind: revi::event::EventKind) -> CaptureEndpoint {
        match kind {
            revi::event::EventKind::Error => CaptureEndpoint::Error,
            revi::event::EventKind::Network => CaptureEndpoint::NetworkEvent,
            revi::event::EventKind::Session | revi::event::EventKind::Performance => {
                CaptureEndpoint::SessionEvent
            }
        }
    }
}

/// A parsed acceptance response.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubmitResponse {
    /// Whether the server reported success. Missing fields default to
    /// `false`/empty; a 2xx status is the real signal.
    #[serde(default)]
    pub success: bool,
    /// Server-assigned ids of the accepted records.
    #[serde(default)]
    pub ids: Vec<String>,
}

/// Builds, sends and classifies capture submissions.
#[derive(Clone, Debug)]
pub struct Transport {
    client: Arc<dyn HttpClient>,
    api_url: String,
    api_key: String,
}

impl Transport {
    /// A transport posting to `api_url` with `api_key`.
    pub fn new(client: Arc<dyn HttpClient>, api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let mut api_url = api_url.into();
        while api_url.ends_with('/') {
            api_url.pop();
        }
        Transport {
            client,
            api_url,
            api_key: api_key.into(),
        }
    }

    /// The configured ingestion base URL, normalized without a trailing
    /// slash.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a batch body to an endpoint.
    ///
    /// The body gains a `sentAt` wall-clock stamp, is compacted/compressed
    /// by the caller's choice of shape, and the response is classified into
    /// the error taxonomy.
    pub async fn submit(
        &self,
        endpoint: CaptureEndpoint,
        mut body: serde_json::Value,
        sync_session: Option<&str>,
    ) -> AgentResult<SubmitResponse> {
        if let Some(fields) = body.as_object_mut() {
            fields.insert("sentAt".to_string(), serde_json::json!(now_millis()));
        }
        let serialized =
            serde_json::to_vec(&body).map_err(|err| AgentError::Internal(err.to_string()))?;
        let payload = maybe_compress(serialized)?;

        let mut request = Request::builder()
            .method(http::Method::POST)
            .uri(format!("{}{}", self.api_url, endpoint.path()))
            .header(header::CONTENT_TYPE, "application/json")
            .header(API_KEY_HEADER, self.api_key.as_str());
        if payload.compressed {
            request = request.header(header::CONTENT_ENCODING, "gzip");
        }
        if let Some(session) = sync_session {
            request = request.header(SYNC_SESSION_HEADER, session);
        }
        let request = request
            .body(payload.body)
            .map_err(|err| AgentError::Internal(err.to_string()))?;

        let response = self.client.send(request).await.map_err(|err| match err {
            HttpError::Timeout(after) => {
                AgentError::Transport(format!("request timed out after {:?}", after))
            }
            other => AgentError::Transport(other.to_string()),
        })?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            let parsed = serde_json::from_slice(response.body()).unwrap_or_else(|err| {
                debug!(error = %err, "acceptance body did not parse");
                SubmitResponse::default()
            });
            return Ok(parsed);
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        Err(classify_status(status, retry_after))
    }
}

/// Build the request body for a batch of raw event payloads: the
/// kind-specific field name wrapping the member array, compacted when
/// repetition makes it worthwhile.
pub fn batch_body(kind: revi::event::EventKind, payloads: Vec<serde_json::Value>) -> serde_json::Value {
    let members = if payloads.len() >= 2 {
        crate::compress::compact_batch(payloads)
    } else {
        serde_json::Value::Array(payloads)
    };
    match kind {
        revi::event::EventKind::Error => serde_json::json!({ "errors": members }),
        _ => serde_json::json!({ "events": members }),
    }
}

/// Fold an HTTP status into the error taxonomy.
///
/// Statuses in neither list become [`AgentError::Internal`], which the retry
/// engine treats as retryable only for idempotent operations.
pub fn classify_status(status: u16, retry_after: Option<Duration>) -> AgentError {
    match status {
        408 | 425 | 429 | 500 | 502 | 503 | 504 => AgentError::ServerRetryable {
            status,
            retry_after,
        },
        400 | 401 | 403 | 404 | 409 | 410 | 422 => AgentError::ServerTerminal { status },
        other => AgentError::Internal(format!("unexpected status {}", other)),
    }
}

/// Parse a `Retry-After` header value in delay-seconds form. Date-form
/// values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|seconds| Duration::from_secs(seconds).min(RETRY_AFTER_CAP))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHttpClient;
    use serde_json::json;

    fn transport(client: &MockHttpClient) -> Transport {
        Transport::new(Arc::new(client.clone()), "https://api.example.test/", "pk_test")
    }

    #[tokio::test]
    async fn posts_json_with_project_key() {
        let client = MockHttpClient::new();
        client.enqueue_ok_with_ids(&["e1"]);
        let transport = transport(&client);

        let response = transport
            .submit(CaptureEndpoint::Error, json!({"errors": []}), None)
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.ids, vec!["e1"]);

        let request = &client.requests()[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.uri, "https://api.example.test/api/capture/error");
        assert_eq!(request.header("x-api-key"), Some("pk_test"));
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("content-encoding"), None);

        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert!(body["sentAt"].as_u64().is_some());
    }

    #[tokio::test]
    async fn large_bodies_are_gzipped() {
        let client = MockHttpClient::new();
        let transport = transport(&client);

        let big = json!({"errors": [vec!["x".repeat(64); 64]]});
        transport
            .submit(CaptureEndpoint::Error, big, None)
            .await
            .unwrap();

        let request = &client.requests()[0];
        assert_eq!(request.header("content-encoding"), Some("gzip"));
        assert_eq!(&request.body[..2], &[0x1f, 0x8b]);
    }

    #[tokio::test]
    async fn sync_session_header_marks_drains() {
        let client = MockHttpClient::new();
        let transport = transport(&client);

        transport
            .submit(CaptureEndpoint::NetworkEvent, json!({"events": []}), Some("drain-1"))
            .await
            .unwrap();
        assert_eq!(client.requests()[0].header("x-sync-session"), Some("drain-1"));
    }

    #[tokio::test]
    async fn retryable_status_carries_retry_after() {
        let client = MockHttpClient::new();
        client.enqueue_status(503, &[("retry-after", "2")]);
        let transport = transport(&client);

        let err = transport
            .submit(CaptureEndpoint::Error, json!({"errors": []}), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AgentError::ServerRetryable {
                status: 503,
                retry_after: Some(Duration::from_secs(2)),
            }
        );
    }

    #[tokio::test]
    async fn terminal_status_is_not_retryable() {
        let client = MockHttpClient::new();
        client.enqueue_status(401, &[]);
        let transport = transport(&client);

        let err = transport
            .submit(CaptureEndpoint::Error, json!({"errors": []}), None)
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::ServerTerminal { status: 401 });
        assert!(!err.is_retryable(true));
    }

    #[tokio::test]
    async fn transport_failures_map_to_transport_errors() {
        let client = MockHttpClient::new();
        client.enqueue_transport_error("connection reset");
        let transport = transport(&client);

        let err = transport
            .submit(CaptureEndpoint::Error, json!({"errors": []}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
    }

    #[test]
    fn status_classification_tables() {
        for status in [408, 425, 429, 500, 502, 503, 504] {
            assert!(matches!(
                classify_status(status, None),
                AgentError::ServerRetryable { .. }
            ));
        }
        for status in [400, 401, 403, 404, 409, 410, 422] {
            assert!(matches!(
                classify_status(status, None),
                AgentError::ServerTerminal { .. }
            ));
        }
        assert!(matches!(classify_status(418, None), AgentError::Internal(_)));
    }

    #[test]
    fn retry_after_is_capped() {
        assert_eq!(parse_retry_after("900"), Some(Duration::from_secs(600)));
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after("soon"), None);
    }
}
