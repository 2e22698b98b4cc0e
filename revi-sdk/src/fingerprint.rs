//! Error normalization and grouping.
//!
//! Two errors that share a fingerprint are the same bug; two errors that
//! share only a pattern hash are similar. Both hashes are computed over
//! normalized inputs where runtime-variable substrings (paths, line numbers,
//! ids, quoted values, addresses) are replaced with stable placeholders, so
//! the same defect hitting different users, builds and records collapses
//! into one group.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Frames kept in the normalized stack.
const MAX_STACK_FRAMES: usize = 10;
/// Frames contributing to the pattern hash.
const MAX_PATTERN_FRAMES: usize = 5;
/// Message characters kept in a group title after the error-type prefix.
const TITLE_MESSAGE_LEN: usize = 50;
/// Path segments at least this long are treated as dynamic.
const DYNAMIC_SEGMENT_LEN: usize = 20;

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"https?://[^\s'")]+"#).expect("static regex"));
static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("static regex")
});
static FILE_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[A-Za-z]:)?(?:[\\/][\w.\-]+)+\.[A-Za-z0-9]{1,5}").expect("static regex"));
static ADDR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]+").expect("static regex"));
static LINE_COL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":\d+:\d+").expect("static regex"));
static LONG_NUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{6,}").expect("static regex"));
static SINGLE_QUOTED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"'([^']*)'").expect("static regex"));
static DOUBLE_QUOTED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"]*)""#).expect("static regex"));
static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("static regex"));
static BASENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[A-Za-z]:)?(?:[\\/][\w.\-]+)+[\\/]([\w.\-]+)").expect("static regex"));
static WEBPACK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"webpack(?:-internal)?://{1,3}\S*?([\w\-]+\.\w+)").expect("static regex"));
static ERROR_TYPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\w+Error|Error)").expect("static regex"));
static ANY_NUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("static regex"));
static CAMEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-z][a-z0-9]*[A-Z]\w*\b").expect("static regex"));
static FRAME_FUNC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\bat\s+)([\w$.<>]+)\s*[(@]").expect("static regex"));
static FRAME_FILE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([\w\-]+\.\w{1,5})\b").expect("static regex"));

/// The grouping record produced for one captured error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    /// Stable hash: equal for the same bug.
    pub fingerprint: String,
    /// Looser hash: equal for structurally similar bugs.
    pub pattern_hash: String,
    /// Message with runtime-variable substrings replaced.
    pub normalized_message: String,
    /// Normalized stack, at most [`MAX_STACK_FRAMES`] frames.
    pub normalized_stack: Vec<String>,
    /// URL reduced to a route pattern, when a URL was supplied.
    pub url_pattern: Option<String>,
    /// Human-readable group title.
    pub title: String,
}

/// Normalizes errors into grouping records.
///
/// All inputs may be empty; missing fields contribute the empty string and
/// analysis never fails.
#[derive(Clone, Debug, Default)]
pub struct Fingerprinter {
    _private: (),
}

impl Fingerprinter {
    /// Create a new fingerprinter.
    pub fn new() -> Self {
        Fingerprinter { _private: () }
    }

    /// Produce the grouping record for one error occurrence.
    pub fn analyze(&self, message: &str, stack: Option<&str>, url: Option<&str>) -> Fingerprint {
        let normalized_message = normalize_message(message);
        let normalized_stack = stack.map(normalize_stack).unwrap_or_default();
        let url_pattern = url.and_then(url_pattern);

        let fingerprint = digest(&[
            &normalized_message,
            &normalized_stack.join("\n"),
            url_pattern.as_deref().unwrap_or(""),
        ]);
        let pattern_hash = digest(&[
            &pattern_message(&normalized_message),
            &pattern_frames(&normalized_stack).join("\n"),
        ]);
        let title = title(&normalized_message, url_pattern.as_deref());

        Fingerprint {
            fingerprint,
            pattern_hash,
            normalized_message,
            normalized_stack,
            url_pattern,
            title,
        }
    }
}

/// Similarity of two normalized messages in [0, 1], where 1 is identical.
///
/// Levenshtein distance normalized by the longer string; the grouping
/// fallback when neither hash matches an existing group.
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    let out = hasher.finalize();
    let mut hex = String::with_capacity(out.len() * 2);
    for byte in out {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

fn normalize_message(message: &str) -> String {
    let msg = URL_RE.replace_all(message, "<url>");
    let msg = UUID_RE.replace_all(&msg, "<uuid>");
    let msg = FILE_PATH_RE.replace_all(&msg, "<file>");
    let msg = ADDR_RE.replace_all(&msg, "<addr>");
    let msg = LINE_COL_RE.replace_all(&msg, ":<line>:<col>");
    let msg = LONG_NUM_RE.replace_all(&msg, "<id>");
    let msg = replace_quoted(&SINGLE_QUOTED_RE, &msg);
    let msg = replace_quoted(&DOUBLE_QUOTED_RE, &msg);
    msg.trim().to_string()
}

// Short identifier-like literals (property names, enum variants) carry
// grouping signal and are kept; anything longer or value-like is runtime
// data.
fn replace_quoted(re: &Regex, input: &str) -> String {
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let inner = &caps[1];
        if inner.len() <= 16 && IDENTIFIER_RE.is_match(inner) {
            caps[0].to_string()
        } else {
            "\"<string>\"".to_string()
        }
    })
    .into_owned()
}

fn normalize_stack(stack: &str) -> Vec<String> {
    stack
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let line = WEBPACK_RE.replace_all(line, "<webpack>/$1");
            let line = BASENAME_RE.replace_all(&line, "$1");
            let line = LINE_COL_RE.replace_all(&line, ":<line>:<col>");
            line.into_owned()
        })
        .take(MAX_STACK_FRAMES)
        .collect()
}

fn url_pattern(url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }
    let (path, query) = match url::Url::parse(url) {
        Ok(parsed) => (
            parsed.path().to_string(),
            parsed.query().map(|q| !q.is_empty()).unwrap_or(false),
        ),
        // Not an absolute URL; treat a rooted path as-is.
        Err(_) if url.starts_with('/') => match url.split_once('?') {
            Some((path, query)) => (path.to_string(), !query.is_empty()),
            None => (url.to_string(), false),
        },
        Err(_) => return None,
    };

    let mut pattern = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        pattern.push('/');
        if segment.chars().all(|c| c.is_ascii_digit()) {
            pattern.push_str("<id>");
        } else if UUID_RE.is_match(segment) {
            pattern.push_str("<uuid>");
        } else if segment.len() >= DYNAMIC_SEGMENT_LEN {
            pattern.push_str("<dynamic>");
        } else {
            pattern.push_str(segment);
        }
    }
    if pattern.is_empty() {
        pattern.push('/');
    }
    if query {
        pattern.push_str("?<query>");
    }
    Some(pattern)
}

fn pattern_message(normalized: &str) -> String {
    let msg = ANY_NUM_RE.replace_all(normalized, "<num>");
    CAMEL_RE.replace_all(&msg, "<var>").into_owned()
}

// Only the function-name + file-basename pair of each frame survives into
// the pattern hash, so relocations within a file stay similar.
fn pattern_frames(frames: &[String]) -> Vec<String> {
    frames
        .iter()
        .take(MAX_PATTERN_FRAMES)
        .map(|frame| {
            let func = FRAME_FUNC_RE
                .captures(frame)
                .map(|c| c[1].to_string())
                .unwrap_or_else(|| "<anonymous>".to_string());
            let file = FRAME_FILE_RE
                .captures(frame)
                .map(|c| c[1].to_string())
                .unwrap_or_default();
            format!("{}@{}", func, file)
        })
        .collect()
}

fn title(normalized_message: &str, url_pattern: Option<&str>) -> String {
    let mut title = String::new();
    let rest = match ERROR_TYPE_RE.find(normalized_message) {
        Some(m) => {
            title.push_str(m.as_str());
            normalized_message[m.end()..].trim_start_matches([':', ' '])
        }
        None => normalized_message,
    };

    let rest = rest.trim();
    if !rest.is_empty() {
        if !title.is_empty() {
            title.push_str(": ");
        }
        if rest.chars().count() > TITLE_MESSAGE_LEN {
            title.extend(rest.chars().take(TITLE_MESSAGE_LEN));
            title.push('…');
        } else {
            title.push_str(rest);
        }
    }
    if let Some(pattern) = url_pattern {
        title.push_str(" in ");
        title.push_str(pattern);
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_MESSAGE: &str =
        "TypeError: Cannot read properties of undefined (reading 'x') at /app/main.js:123:45";

    #[test]
    fn normalizes_paths_and_coordinates() {
        let record = Fingerprinter::new().analyze(SAMPLE_MESSAGE, None, None);
        assert_eq!(
            record.normalized_message,
            "TypeError: Cannot read properties of undefined (reading 'x') at <file>:<line>:<col>"
        );
    }

    #[test]
    fn url_becomes_route_pattern() {
        let record = Fingerprinter::new().analyze(
            SAMPLE_MESSAGE,
            None,
            Some("https://site.test/users/42/profile"),
        );
        assert_eq!(record.url_pattern.as_deref(), Some("/users/<id>/profile"));
    }

    #[test]
    fn fingerprint_is_stable_across_dynamic_url_segments() {
        let fp = Fingerprinter::new();
        let a = fp.analyze(SAMPLE_MESSAGE, None, Some("https://site.test/users/42/profile"));
        let b = fp.analyze(SAMPLE_MESSAGE, None, Some("https://site.test/users/99/profile"));
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.pattern_hash, b.pattern_hash);
    }

    #[test]
    fn title_leads_with_error_type() {
        let record = Fingerprinter::new().analyze(
            SAMPLE_MESSAGE,
            None,
            Some("https://site.test/users/42/profile"),
        );
        assert!(
            record.title.starts_with("TypeError: Cannot read properties of undefined"),
            "got {:?}",
            record.title
        );
        assert!(record.title.ends_with(" in /users/<id>/profile"));
    }

    #[test]
    fn normalization_is_idempotent() {
        let fp = Fingerprinter::new();
        let once = fp.analyze(SAMPLE_MESSAGE, None, Some("https://site.test/users/42/profile"));
        let twice = fp.analyze(
            &once.normalized_message,
            None,
            once.url_pattern.as_deref(),
        );
        assert_eq!(once.normalized_message, twice.normalized_message);
        assert_eq!(once.url_pattern, twice.url_pattern);
        assert_eq!(once.fingerprint, twice.fingerprint);
    }

    #[test]
    fn empty_inputs_never_fail() {
        let record = Fingerprinter::new().analyze("", None, Some(""));
        assert_eq!(record.normalized_message, "");
        assert_eq!(record.url_pattern, None);
        assert!(record.normalized_stack.is_empty());
        assert!(!record.fingerprint.is_empty());
    }

    #[test]
    fn stack_frames_are_reduced_and_truncated() {
        let stack = (0..15)
            .map(|i| format!("  at handler{} (/srv/app/dist/bundle-{}.js:10:{})", i, i, i))
            .collect::<Vec<_>>()
            .join("\n");
        let record = Fingerprinter::new().analyze("Error: boom", Some(&stack), None);
        assert_eq!(record.normalized_stack.len(), 10);
        assert_eq!(
            record.normalized_stack[0],
            "at handler0 (bundle-0.js:<line>:<col>)"
        );
    }

    #[test]
    fn webpack_prefixes_are_tagged() {
        let stack = "at render (webpack-internal:///./src/views/Home.vue:88:12)";
        let record = Fingerprinter::new().analyze("Error: boom", Some(stack), None);
        assert_eq!(
            record.normalized_stack[0],
            "at render (<webpack>/Home.vue:<line>:<col>)"
        );
    }

    #[test]
    fn quoted_values_and_ids_are_scrubbed() {
        let record = Fingerprinter::new().analyze(
            r#"Error: user 1234567 sent "payload value 9" from 0xdeadbeef"#,
            None,
            None,
        );
        assert_eq!(
            record.normalized_message,
            r#"Error: user <id> sent "<string>" from <addr>"#
        );
    }

    #[test]
    fn uuid_segments_and_long_segments_collapse() {
        let pattern = url_pattern(
            "https://x.test/a/9f8b7c6d-1a2b-3c4d-5e6f-7a8b9c0d1e2f/averyveryverylongdynamicsegment?q=1",
        )
        .unwrap();
        assert_eq!(pattern, "/a/<uuid>/<dynamic>?<query>");
    }

    #[test]
    fn similarity_is_symmetric_and_bounded() {
        let a = "Error: connection refused";
        let b = "Error: connection reset";
        let s = similarity(a, b);
        assert!(s > 0.5 && s < 1.0);
        assert_eq!(similarity(a, a), 1.0);
        assert!((similarity(a, b) - similarity(b, a)).abs() < f64::EPSILON);
    }

    #[test]
    fn pattern_hash_groups_similar_messages() {
        let fp = Fingerprinter::new();
        let a = fp.analyze("Error: retry 3 of 5 failed for userCount", None, None);
        let b = fp.analyze("Error: retry 4 of 9 failed for itemTotal", None, None);
        assert_ne!(a.fingerprint, b.fingerprint);
        assert_eq!(a.pattern_hash, b.pattern_hash);
    }
}
