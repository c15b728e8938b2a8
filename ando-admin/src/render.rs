//! JSON page and CSV export rendering.

use crate::search::{LogExport, SearchResult};
use ando_core::fields::{self, FieldPolicy};
use ando_core::filter::Scalar;
use ando_observability::redact::RedactedRecord;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use futures_util::{Stream, StreamExt, stream};
use serde_json::{Value, json};
use std::io;
use tracing::error;

pub const CSV_CONTENT_TYPE: &str = "text/csv";

/// Local time format of the CSV `Time` column.
const CSV_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `{"recordsTotal": n, "data": [...]}`, plus `hits_over_time` when asked for.
pub fn page_json(result: &SearchResult, with_histogram: bool) -> Value {
    let mut body = json!({
        "recordsTotal": result.total_matching,
        "data": result.records,
    });
    if with_histogram {
        let buckets: Vec<Value> = result
            .buckets
            .iter()
            .map(|b| {
                json!({
                    "key": b.key.timestamp_millis(),
                    "key_as_string": b
                        .key
                        .with_timezone(&result.tz)
                        .to_rfc3339_opts(SecondsFormat::Secs, true),
                    "doc_count": b.doc_count,
                })
            })
            .collect();
        body["hits_over_time"] = Value::Array(buckets);
    }
    body
}

/// Header line of the CSV export, newline included.
pub fn csv_header() -> String {
    let labels: Vec<&str> = fields::csv_columns().iter().map(|f| f.label).collect();
    let mut line = labels.join(",");
    line.push('\n');
    line
}

/// One CSV line, newline included. Timestamps are rendered in `tz`.
pub fn csv_row(record: &RedactedRecord, tz: Tz) -> String {
    let cells: Vec<String> = fields::csv_columns()
        .iter()
        .map(|f| csv_escape(&cell(record, f, tz)))
        .collect();
    let mut line = cells.join(",");
    line.push('\n');
    line
}

fn cell(record: &RedactedRecord, field: &FieldPolicy, tz: Tz) -> String {
    match record.field(field.backend) {
        None => String::new(),
        Some(Scalar::Text(s)) => s,
        Some(Scalar::Number(n)) if n.fract() == 0.0 && n.abs() < 1e15 => (n as i64).to_string(),
        Some(Scalar::Number(n)) => n.to_string(),
        Some(Scalar::Time(t)) => t.with_timezone(&tz).format(CSV_TIME_FORMAT).to_string(),
    }
}

/// Quote a CSV cell when it holds a delimiter, quote or line break.
pub fn csv_escape(value: &str) -> String {
    if !value.contains([',', '"', '\n', '\r']) {
        return value.to_string();
    }
    let escaped = value.replace('"', "\"\"");
    format!("\"{escaped}\"")
}

/// `Content-Disposition` of an export started at `now`.
pub fn content_disposition(now: DateTime<Utc>) -> String {
    format!(
        "attachment; filename=\"api_logs ({}).csv\"",
        now.format("%b %-d %Y")
    )
}

/// CSV body: the header, then one chunk per export batch.
///
/// A failed batch ends the body with an I/O error so the client sees a
/// truncated transfer rather than a file that looks complete.
pub fn csv_stream(export: LogExport) -> impl Stream<Item = Result<Bytes, io::Error>> {
    let tz = export.tz();
    let id = export.id();
    let header = stream::once(async { Ok::<_, io::Error>(Bytes::from(csv_header())) });
    let rows = export.into_stream().map(move |batch| match batch {
        Ok(records) => {
            let mut chunk = String::with_capacity(records.len() * 256);
            for r in &records {
                chunk.push_str(&csv_row(r, tz));
            }
            Ok(Bytes::from(chunk))
        }
        Err(e) => {
            error!(export_id = %id, error = %e, "export stream aborted");
            Err(io::Error::other(e.to_string()))
        }
    });
    header.chain(rows)
}
