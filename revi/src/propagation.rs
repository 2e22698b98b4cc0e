//! Carrier traits and the wire codec that move trace context across the
//! client→server boundary.
//!
//! The `traceparent` header identifies the monitored request in a common
//! format:
//!
//! `traceparent: 00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`
//!
//! It has four fields: version, trace-id, parent-id and trace-flags. The
//! agent additionally sends the id of the span the call was started under in
//! [`PARENT_SPAN_HEADER`], and correlates responses through
//! [`TRACE_RESPONSE_HEADER`] when the ingestion service echoes a trace id
//! back.

use crate::trace::{SpanContext, SpanId, TraceFlags, TraceId};

const SUPPORTED_VERSION: u8 = 0;
const MAX_VERSION: u8 = 254;

/// Header carrying the W3C-style trace context of an outgoing request.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// Header carrying the id of the span an outgoing request was started under.
pub const PARENT_SPAN_HEADER: &str = "x-revi-parent-span";
/// Response header servers may use to echo the trace id they recorded.
pub const TRACE_RESPONSE_HEADER: &str = "x-revi-trace-id";

/// Injects values into a carrier of string key/value pairs, typically an
/// outgoing header map.
pub trait Injector {
    /// Set a key and value on the carrier.
    fn set(&mut self, key: &str, value: String);
}

/// Extracts values from a carrier of string key/value pairs, typically a
/// received header map.
pub trait Extractor {
    /// Get a value for a key from the carrier, if present and readable.
    fn get(&self, key: &str) -> Option<&str>;
}

impl<S: std::hash::BuildHasher> Injector for std::collections::HashMap<String, String, S> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for std::collections::HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        std::collections::HashMap::get(self, &key.to_lowercase()).map(|v| v.as_str())
    }
}

/// Encodes and decodes [`SpanContext`]s in the `traceparent` wire format.
#[derive(Clone, Debug, Default)]
pub struct TraceContextCodec {
    _private: (),
}

impl TraceContextCodec {
    /// Create a new codec.
    pub fn new() -> Self {
        TraceContextCodec { _private: () }
    }

    /// Injects the context into the carrier. Invalid contexts inject nothing.
    pub fn inject(&self, cx: &SpanContext, injector: &mut dyn Injector) {
        if !cx.is_valid() {
            return;
        }
        let header_value = format!(
            "{:02x}-{:032x}-{:016x}-{:02x}",
            SUPPORTED_VERSION,
            cx.trace_id(),
            cx.span_id(),
            cx.trace_flags().to_u8() & TraceFlags::SAMPLED.to_u8(),
        );
        injector.set(TRACEPARENT_HEADER, header_value);
        if let Some(parent) = cx.parent_span_id() {
            injector.set(PARENT_SPAN_HEADER, format!("{:016x}", parent));
        }
    }

    /// Decodes a context from the carrier. Malformed or invalid headers yield
    /// `None`; the caller treats that as "no remote context".
    pub fn extract(&self, extractor: &dyn Extractor) -> Option<SpanContext> {
        let header_value = extractor.get(TRACEPARENT_HEADER).unwrap_or("").trim();
        let parts = header_value.split_terminator('-').collect::<Vec<&str>>();
        if parts.len() < 4 {
            return None;
        }

        // For version 0 there must be exactly 4 parts.
        let version = u8::from_str_radix(parts[0], 16).ok()?;
        if version > MAX_VERSION || (version == 0 && parts.len() != 4) {
            return None;
        }

        // Hex sections must be lowercase.
        if parts[1..4]
            .iter()
            .any(|part| part.chars().any(|c| c.is_ascii_uppercase()))
        {
            return None;
        }

        let trace_id = TraceId::from_hex(parts[1]).ok()?;
        let span_id = SpanId::from_hex(parts[2]).ok()?;
        let opts = u8::from_str_radix(parts[3], 16).ok()?;

        // Version 0 defines only the low two flag bits.
        if version == 0 && opts > 2 {
            return None;
        }

        let parent_span_id = extractor
            .get(PARENT_SPAN_HEADER)
            .and_then(|v| SpanId::from_hex(v).ok())
            .filter(|id| id.is_valid());

        let trace_flags = TraceFlags::new(opts & TraceFlags::SAMPLED.to_u8());
        let cx = SpanContext::new(trace_id, span_id, parent_span_id, trace_flags);
        if cx.is_valid() {
            Some(cx)
        } else {
            None
        }
    }
}
