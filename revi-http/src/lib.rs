//! Helper types for sending Revi telemetry over HTTP.
//!
//! Hosts embed the agent in very different runtimes, so the transport is
//! abstracted behind the [`HttpClient`] trait and users bring their own
//! client. The agent needs the full response back — status codes feed the
//! retry classifier and circuit breaker, and `Retry-After` headers bound the
//! next delay — so `send` resolves to an [`http::Response`] rather than a
//! bare success flag.

#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, Request, Response};
use revi::propagation::{Extractor, Injector};
use thiserror::Error;

/// Failure to deliver a request or read its response.
///
/// This is a transport-level error: a response with a 4xx/5xx status is *not*
/// an `HttpError`, it is a successful exchange the caller classifies.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// The connection could not be established or broke mid-exchange.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The exchange did not complete within the caller's deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The request could not be built or converted for the underlying client.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// A minimal interface for delivering telemetry over HTTP.
///
/// Implementations relay the request as-is and return the response without
/// interpreting its status.
#[async_trait]
pub trait HttpClient: Debug + Send + Sync {
    /// Send a request and return the complete response.
    async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, HttpError>;
}

/// Injects context into an outgoing [`http::HeaderMap`].
#[derive(Debug)]
pub struct HeaderInjector<'a>(pub &'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    /// Set a key and value on the header map. Does nothing if the key or
    /// value are not valid header inputs.
    fn set(&mut self, key: &str, value: String) {
        if let Ok(name) = http::header::HeaderName::from_bytes(key.as_bytes()) {
            if let Ok(val) = http::header::HeaderValue::from_str(&value) {
                self.0.insert(name, val);
            }
        }
    }
}

/// Extracts context from a received [`http::HeaderMap`].
#[derive(Debug)]
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    /// Get a value for a key from the header map. Returns `None` for values
    /// that are not valid ASCII.
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }
}

#[cfg(feature = "reqwest")]
#[async_trait]
impl HttpClient for reqwest::Client {
    async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, HttpError> {
        let request = request
            .try_into()
            .map_err(|err: reqwest::Error| HttpError::InvalidRequest(err.to_string()))?;
        let response = self.execute(request).await.map_err(|err| {
            if err.is_timeout() {
                HttpError::Timeout(Duration::ZERO)
            } else {
                HttpError::Connection(err.to_string())
            }
        })?;

        let mut converted = Response::builder().status(response.status().as_u16());
        if let Some(headers) = converted.headers_mut() {
            *headers = response.headers().clone();
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| HttpError::Connection(err.to_string()))?;
        converted
            .body(body.to_vec())
            .map_err(|err| HttpError::Connection(err.to_string()))
    }
}
