//! Batch compaction and transport compression.
//!
//! Before upload a batch is compacted: top-level fields whose values repeat
//! across at least two members move into a shared `common` dictionary and
//! each member keeps a `{"$ref": id}` marker instead. The receiver tolerates
//! either the compacted or the raw form. The byte stream is then gzipped
//! unless it is small enough that framing overhead exceeds the saving.

use std::collections::BTreeMap;
use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use revi::error::{AgentError, AgentResult};
use serde_json::{Map, Value};

/// Payloads below this size are sent uncompressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Marker key members use to reference the shared dictionary.
const REF_KEY: &str = "$ref";

/// The result of compressing a serialized payload.
#[derive(Debug)]
pub struct CompressedPayload {
    /// The bytes to send.
    pub body: Vec<u8>,
    /// Whether `body` is gzip-compressed (drives `Content-Encoding`).
    pub compressed: bool,
}

/// Compact a batch of object members by extracting repeated field values.
///
/// Returns `{"common": {...}, "items": [...]}` when anything repeats, and
/// the raw `items` array otherwise. Non-object members pass through
/// untouched.
pub fn compact_batch(items: Vec<Value>) -> Value {
    // Count identical (field, value) pairs across members; the serialized
    // value is the map key so compound values compare structurally.
    let mut counts: BTreeMap<(String, String), u32> = BTreeMap::new();
    for item in items.iter().filter_map(Value::as_object) {
        for (field, value) in item {
            let serialized = value.to_string();
            *counts.entry((field.clone(), serialized)).or_insert(0) += 1;
        }
    }

    let mut common = Map::new();
    let mut refs: BTreeMap<(String, String), String> = BTreeMap::new();
    for item in items.iter().filter_map(Value::as_object) {
        for (field, value) in item {
            let key = (field.clone(), value.to_string());
            if counts.get(&key).copied().unwrap_or(0) >= 2 && !refs.contains_key(&key) {
                let id = format!("c{}", refs.len());
                common.insert(id.clone(), value.clone());
                refs.insert(key, id);
            }
        }
    }

    if common.is_empty() {
        return Value::Array(items);
    }

    let rewritten = items
        .into_iter()
        .map(|item| match item {
            Value::Object(fields) => {
                let fields = fields
                    .into_iter()
                    .map(|(field, value)| {
                        let key = (field.clone(), value.to_string());
                        match refs.get(&key) {
                            Some(id) => {
                                let mut reference = Map::new();
                                reference.insert(REF_KEY.to_string(), Value::String(id.clone()));
                                (field, Value::Object(reference))
                            }
                            None => (field, value),
                        }
                    })
                    .collect();
                Value::Object(fields)
            }
            other => other,
        })
        .collect();

    let mut out = Map::new();
    out.insert("common".to_string(), Value::Object(common));
    out.insert("items".to_string(), Value::Array(rewritten));
    Value::Object(out)
}

/// Expand a compacted batch back into its raw member array.
///
/// Raw arrays pass through unchanged, so consumers can apply this
/// unconditionally.
pub fn expand_batch(batch: Value) -> Vec<Value> {
    let (common, items) = match batch {
        Value::Array(items) => return items,
        Value::Object(mut fields) => {
            let common = fields.remove("common").unwrap_or(Value::Null);
            let items = fields.remove("items").unwrap_or(Value::Array(Vec::new()));
            (common, items)
        }
        other => return vec![other],
    };

    let dictionary = common.as_object().cloned().unwrap_or_default();
    let items = match items {
        Value::Array(items) => items,
        other => vec![other],
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::Object(fields) => {
                let fields = fields
                    .into_iter()
                    .map(|(field, value)| {
                        let resolved = value
                            .as_object()
                            .and_then(|obj| obj.get(REF_KEY))
                            .and_then(Value::as_str)
                            .and_then(|id| dictionary.get(id).cloned());
                        (field, resolved.unwrap_or(value))
                    })
                    .collect();
                Value::Object(fields)
            }
            other => other,
        })
        .collect()
}

/// Gzip `body` when it is large enough to be worth it.
pub fn maybe_compress(body: Vec<u8>) -> AgentResult<CompressedPayload> {
    if body.len() < COMPRESSION_THRESHOLD {
        return Ok(CompressedPayload {
            body,
            compressed: false,
        });
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&body)
        .and_then(|_| encoder.finish())
        .map(|compressed| CompressedPayload {
            body: compressed,
            compressed: true,
        })
        .map_err(|err| AgentError::Internal(format!("gzip failed: {}", err)))
}
