//! Credential redaction for log records leaving the search engine.
//!
//! Every record a search or export emits passes through [`redact`]. The
//! only way to obtain a [`RedactedRecord`] is through that function, so the
//! JSON and CSV renderers cannot be handed an unredacted row.
//!
//! ```
//! use ando_core::record::LogRecord;
//! use ando_observability::redact::redact;
//!
//! let mut rec = LogRecord::default();
//! rec.request_url = Some("http://host/path/?api_key=SECRET&foo=bar".into());
//! rec.request_query.insert("api_key".into(), "SECRET".into());
//! let clean = redact(rec);
//! assert_eq!(clean.request_url.as_deref(), Some("http://host/path/?foo=bar"));
//! assert!(clean.request_query.is_empty());
//! ```

use ando_core::record::LogRecord;
use percent_encoding::percent_decode_str;
use serde::{Serialize, Serializer};
use std::ops::Deref;

/// Replacement for credential text found outside the known locations.
pub const REDACTED: &str = "[REDACTED]";

/// Query parameter carrying the caller's API key.
pub const API_KEY_PARAM: &str = "api_key";

/// A log record with all credential material removed.
#[derive(Debug, Clone, PartialEq)]
pub struct RedactedRecord(LogRecord);

impl RedactedRecord {
    pub fn as_record(&self) -> &LogRecord {
        &self.0
    }
}

impl Deref for RedactedRecord {
    type Target = LogRecord;

    fn deref(&self) -> &LogRecord {
        &self.0
    }
}

impl Serialize for RedactedRecord {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

/// Strip credentials from a record.
///
/// The `api_key` parameter is removed from `request_url` and
/// `request_query`, and the record's own key attribute is dropped. Any
/// other text field still containing one of those key values has the value
/// replaced by [`REDACTED`]. A `request_query` pair whose key contains a
/// key value is dropped whole, so masked keys never collide. Numeric
/// fields whose rendered value contains a key value are cleared.
///
/// `request_at` is never altered. A key made only of digits can still
/// appear inside its rendered timestamp.
pub fn redact(mut record: LogRecord) -> RedactedRecord {
    let mut secrets: Vec<String> = Vec::new();

    if let Some(key) = record.api_key.take() {
        secrets.push(key);
    }
    if let Some(key) = record.request_query.remove(API_KEY_PARAM) {
        secrets.push(key);
    }
    if let Some(url) = record.request_url.as_mut() {
        let (clean, removed) = strip_query_param(url, API_KEY_PARAM);
        *url = clean;
        secrets.extend(removed);
    }

    // Query values are stored both raw and percent-decoded.
    let decoded: Vec<String> = secrets.iter().map(|s| decode_component(s)).collect();
    secrets.extend(decoded);
    secrets.retain(|s| !s.is_empty());
    secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
    secrets.dedup();

    if !secrets.is_empty() {
        for field in record.text_fields_mut() {
            mask(field, &secrets);
        }
        record
            .request_query
            .retain(|k, _| !secrets.iter().any(|s| k.contains(s.as_str())));
        for value in record.request_query.values_mut() {
            mask(value, &secrets);
        }
        if record.response_status.is_some_and(|v| leaks(&v.to_string(), &secrets)) {
            record.response_status = None;
        }
        if record.response_time.is_some_and(|v| leaks(&v.to_string(), &secrets)) {
            record.response_time = None;
        }
    }

    RedactedRecord(record)
}

fn leaks(rendered: &str, secrets: &[String]) -> bool {
    secrets.iter().any(|s| rendered.contains(s.as_str()))
}

fn mask(field: &mut String, secrets: &[String]) {
    for secret in secrets {
        if field.contains(secret.as_str()) {
            *field = field.replace(secret.as_str(), REDACTED);
        }
    }
}

/// Remove every `name` parameter from the query string of `url`.
///
/// Matching is on the decoded key and exact. Remaining parameters keep
/// their original text and relative order; a query string left empty
/// loses its `?`. Returns the new URL and the raw values removed.
pub fn strip_query_param(url: &str, name: &str) -> (String, Vec<String>) {
    let (before_fragment, fragment) = match url.split_once('#') {
        Some((b, f)) => (b, Some(f)),
        None => (url, None),
    };
    let Some((base, query)) = before_fragment.split_once('?') else {
        return (url.to_string(), Vec::new());
    };

    let mut removed = Vec::new();
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((*pair, ""));
            if decode_component(key) == name {
                removed.push(value.to_string());
                false
            } else {
                true
            }
        })
        .collect();

    let mut out = String::with_capacity(url.len());
    out.push_str(base);
    if !kept.is_empty() {
        out.push('?');
        out.push_str(&kept.join("&"));
    }
    if let Some(f) = fragment {
        out.push('#');
        out.push_str(f);
    }
    (out, removed)
}

/// Decode a form-encoded query component (`+` is a space).
fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(url: &str) -> LogRecord {
        let mut rec = LogRecord::new(Utc.with_ymd_and_hms(2015, 1, 16, 6, 6, 28).unwrap());
        rec.request_url = Some(url.to_string());
        rec
    }

    // ── strip_query_param ────────────────────────────────────────

    #[test]
    fn key_removed_from_any_position() {
        for (input, expected) in [
            ("http://host/path/?api_key=SECRET&foo=bar", "http://host/path/?foo=bar"),
            ("http://host/path/?foo=bar&api_key=SECRET", "http://host/path/?foo=bar"),
            ("http://host/path/?a=1&api_key=SECRET&b=2", "http://host/path/?a=1&b=2"),
        ] {
            let (out, removed) = strip_query_param(input, API_KEY_PARAM);
            assert_eq!(out, expected);
            assert_eq!(removed, vec!["SECRET".to_string()]);
        }
    }

    #[test]
    fn sole_parameter_drops_question_mark() {
        let (out, _) = strip_query_param("http://host/path?api_key=SECRET", API_KEY_PARAM);
        assert_eq!(out, "http://host/path");
    }

    #[test]
    fn other_params_keep_order_and_encoding() {
        let (out, _) = strip_query_param(
            "/p?z=%2F1&api_key=SECRET&a=x+y&flag",
            API_KEY_PARAM,
        );
        assert_eq!(out, "/p?z=%2F1&a=x+y&flag");
    }

    #[test]
    fn encoded_and_repeated_keys_are_removed() {
        let (out, removed) = strip_query_param(
            "/p?api%5Fkey=ONE&x=1&api_key=TWO#frag",
            API_KEY_PARAM,
        );
        assert_eq!(out, "/p?x=1#frag");
        assert_eq!(removed, vec!["ONE".to_string(), "TWO".to_string()]);
    }

    #[test]
    fn similar_names_are_not_removed() {
        let input = "/p?my_api_key=1&api_keys=2&API_KEY=3";
        let (out, removed) = strip_query_param(input, API_KEY_PARAM);
        assert_eq!(out, input);
        assert!(removed.is_empty());
    }

    #[test]
    fn url_without_query_unchanged() {
        let (out, removed) = strip_query_param("http://host/path/", API_KEY_PARAM);
        assert_eq!(out, "http://host/path/");
        assert!(removed.is_empty());
    }

    // ── redact ───────────────────────────────────────────────────

    #[test]
    fn redacts_url_query_map_and_key_attribute() {
        let mut rec = record("http://host/path/?api_key=SECRET&foo=bar");
        rec.request_query.insert("api_key".into(), "SECRET".into());
        rec.request_query.insert("foo".into(), "bar".into());
        rec.api_key = Some("SECRET".into());

        let clean = redact(rec);
        assert_eq!(clean.request_url.as_deref(), Some("http://host/path/?foo=bar"));
        assert_eq!(clean.request_query.len(), 1);
        assert_eq!(clean.request_query["foo"], "bar");
        assert!(clean.api_key.is_none());
        let json = serde_json::to_string(&clean).unwrap();
        assert!(!json.contains("SECRET"));
    }

    #[test]
    fn secret_echoed_in_other_fields_is_masked() {
        let mut rec = record("/p?api_key=S%2BCRET");
        rec.request_referer = Some("http://evil/?k=S+CRET".into());
        rec.request_user_agent = Some("agent S%2BCRET".into());
        rec.request_query.insert("note".into(), "S+CRET".into());

        let clean = redact(rec);
        assert_eq!(clean.request_url.as_deref(), Some("/p"));
        assert_eq!(clean.request_referer.as_deref(), Some("http://evil/?k=[REDACTED]"));
        assert_eq!(clean.request_user_agent.as_deref(), Some("agent [REDACTED]"));
        assert_eq!(clean.request_query["note"], REDACTED);
    }

    #[test]
    fn query_keys_carrying_the_secret_are_dropped() {
        let mut rec = record("/p?api_key=SECRET");
        rec.request_query.insert("SECRET".into(), "a".into());
        rec.request_query.insert("x-SECRET".into(), "b".into());
        rec.request_query.insert("keep".into(), "c".into());

        let clean = redact(rec);
        assert_eq!(clean.request_query.len(), 1);
        assert_eq!(clean.request_query["keep"], "c");
        let json = serde_json::to_string(&clean).unwrap();
        assert!(!json.contains("SECRET"));
        assert!(!json.contains(REDACTED));
    }

    #[test]
    fn numeric_fields_echoing_the_secret_are_cleared() {
        let mut rec = record("/p?api_key=503");
        rec.response_status = Some(503);
        rec.response_time = Some(1.5034);

        let clean = redact(rec);
        assert_eq!(clean.response_status, None);
        assert_eq!(clean.response_time, None);

        let mut rec = record("/p?api_key=SECRET");
        rec.response_status = Some(503);
        rec.response_time = Some(1.5);
        let clean = redact(rec);
        assert_eq!(clean.response_status, Some(503));
        assert_eq!(clean.response_time, Some(1.5));
    }

    #[test]
    fn record_without_credentials_is_unchanged() {
        let mut rec = record("http://host/path?foo=bar");
        rec.request_query.insert("foo".into(), "bar".into());
        let clean = redact(rec.clone());
        assert_eq!(clean.as_record(), &rec);
    }

    #[test]
    fn empty_key_value_masks_nothing() {
        let rec = record("/p?api_key=&foo=bar");
        let clean = redact(rec);
        assert_eq!(clean.request_url.as_deref(), Some("/p?foo=bar"));
        assert_eq!(clean.request_method, "GET");
    }
}
