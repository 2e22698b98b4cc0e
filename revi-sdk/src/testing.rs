//! In-memory doubles for exercising the pipeline without a network.
//!
//! [`MockHttpClient`] records every request it receives and replays a
//! scripted response sequence, falling back to a generic acceptance response
//! once the script is exhausted. Useful in this crate's own tests and for
//! hosts asserting against their integration.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::{Request, Response};
use revi_http::{HttpClient, HttpError};

/// One request observed by a [`MockHttpClient`].
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    /// Request method.
    pub method: String,
    /// Full request URI.
    pub uri: String,
    /// Headers, lowercased names.
    pub headers: Vec<(String, String)>,
    /// Raw body bytes as sent (possibly compressed).
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// First header value with the given (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Body bytes with any gzip content-encoding undone.
    pub fn decoded_body(&self) -> Vec<u8> {
        if self.header("content-encoding") == Some("gzip") {
            use std::io::Read;
            let mut decoded = Vec::new();
            let mut decoder = flate2::read::GzDecoder::new(self.body.as_slice());
            if decoder.read_to_end(&mut decoded).is_ok() {
                return decoded;
            }
        }
        self.body.clone()
    }
}

#[derive(Debug)]
enum Scripted {
    Response {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    TransportError(String),
    Timeout(Duration),
}

/// An [`HttpClient`] that records requests and replays scripted responses.
#[derive(Clone, Debug, Default)]
pub struct MockHttpClient {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    script: Arc<Mutex<VecDeque<Scripted>>>,
}

impl MockHttpClient {
    /// A client that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response with the given status and headers and an empty
    /// acceptance body.
    pub fn enqueue_status(&self, status: u16, headers: &[(&str, &str)]) {
        self.enqueue_response(status, headers, br#"{"success":false}"#.to_vec());
    }

    /// Queue a `200` acceptance carrying the given ids.
    pub fn enqueue_ok_with_ids(&self, ids: &[&str]) {
        let body = serde_json::json!({"success": true, "ids": ids});
        self.enqueue_response(200, &[], body.to_string().into_bytes());
    }

    /// Queue an arbitrary response.
    pub fn enqueue_response(&self, status: u16, headers: &[(&str, &str)], body: Vec<u8>) {
        self.push(Scripted::Response {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body,
        });
    }

    /// Queue a transport failure.
    pub fn enqueue_transport_error(&self, message: &str) {
        self.push(Scripted::TransportError(message.to_string()));
    }

    /// Queue a timeout.
    pub fn enqueue_timeout(&self, after: Duration) {
        self.push(Scripted::Timeout(after));
    }

    /// All requests observed so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// Number of requests observed so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|requests| requests.len()).unwrap_or(0)
    }

    /// Drop recorded requests.
    pub fn reset(&self) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.clear();
        }
    }

    /// Drop unconsumed scripted responses; subsequent requests get the
    /// default acceptance.
    pub fn clear_script(&self) {
        if let Ok(mut script) = self.script.lock() {
            script.clear();
        }
    }

    fn push(&self, scripted: Scripted) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(scripted);
        }
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, HttpError> {
        let recorded = RecordedRequest {
            method: request.method().to_string(),
            uri: request.uri().to_string(),
            headers: request
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_ascii_lowercase(),
                        value.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect(),
            body: request.body().clone(),
        };
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(recorded);
        }

        let next = self.script.lock().ok().and_then(|mut script| script.pop_front());
        match next {
            None => Ok(acceptance_response()),
            Some(Scripted::Response {
                status,
                headers,
                body,
            }) => {
                let mut builder = Response::builder().status(status);
                for (name, value) in headers {
                    builder = builder.header(name, value);
                }
                builder
                    .body(body)
                    .map_err(|err| HttpError::InvalidRequest(err.to_string()))
            }
            Some(Scripted::TransportError(message)) => Err(HttpError::Connection(message)),
            Some(Scripted::Timeout(after)) => {
                tokio::time::sleep(after).await;
                Err(HttpError::Timeout(after))
            }
        }
    }
}

fn acceptance_response() -> Response<Vec<u8>> {
    Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .body(br#"{"success":true,"ids":[]}"#.to_vec())
        .unwrap_or_default()
}
