//! Integration tests for the log search and export endpoints.
//!
//! Uses `tower::ServiceExt::oneshot` to call handlers without binding a real
//! TCP port. Every test seeds a fresh in-memory index.

use ando_admin::search::LogSearch;
use ando_admin::server::{AdminState, build_admin_router};
use ando_core::config::LogSearchConfig;
use ando_core::record::LogRecord;
use ando_observability::metrics::SearchMetrics;
use ando_store::index::{LogIndex, ScrollBatch, ScrollCursor, SearchPage, StoreError};
use ando_store::memory::MemoryIndex;
use ando_store::query::SearchQuery;
use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tower::ServiceExt; // .oneshot()

// ── Helpers ───────────────────────────────────────────────────

const RANGE: &str = "tz=America/Denver&start_at=2015-01-13&end_at=2015-01-18";

fn at() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2015-01-16T06:06:28.816Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn base_record() -> LogRecord {
    let mut r = LogRecord::new(at());
    r.request_host = Some("127.0.0.1".into());
    r.request_path = Some("/with_api_key/".into());
    r.request_ip = Some("127.0.0.1".into());
    r.response_status = Some(200);
    r
}

fn secret_record() -> LogRecord {
    let mut r = base_record();
    r.request_url = Some("http://127.0.0.1/with_api_key/?foo=bar&api_key=SECRET".into());
    r.request_query.insert("foo".into(), "bar".into());
    r.request_query.insert("api_key".into(), "SECRET".into());
    r.api_key = Some("SECRET".into());
    r
}

fn config() -> LogSearchConfig {
    let mut config = LogSearchConfig::default();
    config.index.scroll_batch_size = 100;
    config
}

fn state_with(index: Arc<dyn LogIndex>, config: LogSearchConfig) -> Arc<AdminState> {
    let metrics = Arc::new(SearchMetrics::new(config.observability.prometheus.enabled).unwrap());
    let search = LogSearch::new(index, config.index.clone(), metrics.clone());
    Arc::new(AdminState {
        search,
        config,
        metrics,
    })
}

fn state(index: Arc<MemoryIndex>) -> Arc<AdminState> {
    state_with(index, config())
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn filter_uri(path: &str, filter: Value) -> String {
    let filter = filter.to_string();
    let encoded = utf8_percent_encode(&filter, NON_ALPHANUMERIC);
    format!("{path}?{RANGE}&query={encoded}")
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = to_bytes(resp.into_body(), 16 * 1024 * 1024).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    serde_json::from_str(&body_text(resp).await).unwrap()
}

async fn wait_for_release(index: &MemoryIndex) {
    for _ in 0..100 {
        if index.open_scrolls() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scroll cursor was never released");
}

/// Delegates to an in-memory index; fails searches or later scroll pages on demand.
struct FlakyIndex {
    inner: Arc<MemoryIndex>,
    down: bool,
    fail_scroll: AtomicBool,
}

#[async_trait]
impl LogIndex for FlakyIndex {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, StoreError> {
        if self.down {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.search(query).await
    }

    async fn open_scroll(&self, query: &SearchQuery) -> Result<ScrollBatch, StoreError> {
        if self.down {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.open_scroll(query).await
    }

    async fn scroll(
        &self,
        cursor: &ScrollCursor,
        keep_alive: Duration,
    ) -> Result<ScrollBatch, StoreError> {
        if self.fail_scroll.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("node left the cluster".into()));
        }
        self.inner.scroll(cursor, keep_alive).await
    }

    async fn clear_scroll(&self, cursor: &ScrollCursor) -> Result<(), StoreError> {
        self.inner.clear_scroll(cursor).await
    }
}

// ── Health ────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_backend() {
    let app = build_admin_router(state(Arc::new(MemoryIndex::new())));
    let resp = app.oneshot(get_req("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "memory");
}

// ── JSON page ─────────────────────────────────────────────────

#[tokio::test]
async fn json_page_redacts_api_key() {
    let index = Arc::new(MemoryIndex::with_records(vec![secret_record()]));
    let app = build_admin_router(state(index));
    let resp = app
        .oneshot(get_req(&format!("/admin/stats/logs.json?{RANGE}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let text = body_text(resp).await;
    assert!(!text.contains("SECRET"));
    let body: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["recordsTotal"], 1);
    assert_eq!(
        body["data"][0]["request_url"],
        "http://127.0.0.1/with_api_key/?foo=bar"
    );
    assert_eq!(body["data"][0]["request_query"], json!({"foo": "bar"}));
    assert!(body["data"][0].get("api_key").is_none());
}

#[tokio::test]
async fn json_page_windows_and_counts() {
    let index = Arc::new(MemoryIndex::new());
    index.extend((0..30).map(|_| base_record()));
    let app = build_admin_router(state(index));
    let resp = app
        .oneshot(get_req(&format!(
            "/admin/stats/logs.json?{RANGE}&start=20&length=25"
        )))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["recordsTotal"], 30);
    assert_eq!(body["data"].as_array().unwrap().len(), 10);
}

#[tokio::test]
async fn json_page_with_histogram() {
    let index = Arc::new(MemoryIndex::with_records(vec![base_record()]));
    let app = build_admin_router(state(index));
    let resp = app
        .oneshot(get_req(&format!(
            "/admin/stats/logs.json?{RANGE}&interval=day&hits_over_time=true"
        )))
        .await
        .unwrap();
    let body = body_json(resp).await;
    let buckets = body["hits_over_time"].as_array().unwrap();
    assert_eq!(buckets.len(), 6);
    let total: u64 = buckets.iter().map(|b| b["doc_count"].as_u64().unwrap()).sum();
    assert_eq!(total, 1);
    assert_eq!(buckets[0]["key_as_string"], "2015-01-13T00:00:00-07:00");
}

// ── Filters ──────────────────────────────────────────────────

#[tokio::test]
async fn user_agent_prefix_ignores_case() {
    let mut matching = base_record();
    matching.request_user_agent = Some("MOZILLAAA".into());
    let mut other = base_record();
    other.request_user_agent = Some("curl/8.0".into());
    let index = Arc::new(MemoryIndex::with_records(vec![matching, other]));
    let app = build_admin_router(state(index));

    let filter = json!({"condition": "AND", "rules": [{
        "id": "request_user_agent", "field": "request_user_agent", "type": "string",
        "input": "text", "operator": "begins_with", "value": "Mozilla"
    }]});
    let resp = app
        .oneshot(get_req(&filter_uri("/admin/stats/logs.json", filter)))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["recordsTotal"], 1);
    assert_eq!(body["data"][0]["request_user_agent"], "MOZILLAAA");
}

#[tokio::test]
async fn api_key_prefix_is_case_sensitive() {
    let mut upper = base_record();
    upper.api_key = Some("AbCDeF".into());
    upper.request_path = Some("/upper".into());
    let mut lower = base_record();
    lower.api_key = Some("abcdef".into());
    lower.request_path = Some("/lower".into());
    let index = Arc::new(MemoryIndex::with_records(vec![upper, lower]));
    let app = build_admin_router(state(index));

    let filter = json!({"condition": "AND", "rules": [{
        "id": "api_key", "field": "api_key", "type": "string",
        "input": "text", "operator": "begins_with", "value": "AbCDeF"
    }]});
    let resp = app
        .oneshot(get_req(&filter_uri("/admin/stats/logs.json", filter)))
        .await
        .unwrap();
    let text = body_text(resp).await;
    assert!(!text.contains("AbCDeF"));
    let body: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["recordsTotal"], 1);
    assert_eq!(body["data"][0]["request_path"], "/upper");
}

#[tokio::test]
async fn is_not_null_skips_absent_values() {
    let mut with_email = base_record();
    with_email.user_email = Some("ops@example.com".into());
    let without = base_record();
    let index = Arc::new(MemoryIndex::with_records(vec![with_email, without]));
    let app = build_admin_router(state(index));

    let filter = json!({"condition": "AND", "rules": [{
        "id": "user_email", "field": "user_email", "type": "string",
        "input": "text", "operator": "is_not_null", "value": null
    }]});
    let resp = app
        .oneshot(get_req(&filter_uri("/admin/stats/logs.json", filter)))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["recordsTotal"], 1);
    assert_eq!(body["data"][0]["user_email"], "ops@example.com");
}

// ── Validation ────────────────────────────────────────────────

#[tokio::test]
async fn invalid_requests_are_rejected_before_search() {
    let cases = [
        ("/admin/stats/logs.json?tz=UTC&end_at=2015-01-18".to_string(), "missing_parameter"),
        (
            "/admin/stats/logs.json?tz=Mars/Olympus&start_at=2015-01-13&end_at=2015-01-18".to_string(),
            "unknown_timezone",
        ),
        (
            "/admin/stats/logs.json?tz=UTC&start_at=2015-01-18&end_at=2015-01-13".to_string(),
            "invalid_time_range",
        ),
        (
            filter_uri(
                "/admin/stats/logs.csv",
                json!({"condition": "AND", "rules": [{"id": "no_such_field", "operator": "equal", "value": "x"}]}),
            ),
            "unknown_field",
        ),
    ];
    for (uri, code) in cases {
        let app = build_admin_router(state(Arc::new(MemoryIndex::new())));
        let resp = app.oneshot(get_req(&uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], code, "{uri}");
        assert_eq!(body["error"]["retryable"], false);
    }
}

#[tokio::test]
async fn rejected_filter_does_not_echo_value() {
    let app = build_admin_router(state(Arc::new(MemoryIndex::new())));
    let filter = json!({"condition": "AND", "rules": [{
        "id": "response_status", "field": "response_status", "type": "integer",
        "operator": "equal", "value": "TOPSECRET"
    }]});
    let resp = app
        .oneshot(get_req(&filter_uri("/admin/stats/logs.json", filter)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(!body_text(resp).await.contains("TOPSECRET"));
}

#[tokio::test]
async fn page_beyond_result_window_is_rejected() {
    let app = build_admin_router(state(Arc::new(MemoryIndex::new())));
    let resp = app
        .oneshot(get_req(&format!(
            "/admin/stats/logs.json?{RANGE}&start=9990&length=100"
        )))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["error"]["code"], "page_window_too_large");
}

#[tokio::test]
async fn unbounded_range_and_histogram_are_rejected() {
    let cases = [
        (
            "/admin/stats/logs.json?tz=UTC&start_at=0001-01-01&end_at=9999-12-31&interval=minute&hits_over_time=true",
            "range_too_large",
        ),
        (
            "/admin/stats/logs.csv?tz=UTC&start_at=0001-01-01&end_at=9999-12-31",
            "range_too_large",
        ),
        (
            "/admin/stats/logs.json?tz=UTC&start_at=2015-01-01&end_at=2015-12-31&interval=minute&hits_over_time=true",
            "histogram_too_large",
        ),
    ];
    for (uri, code) in cases {
        let app = build_admin_router(state(Arc::new(MemoryIndex::new())));
        let resp = tokio::time::timeout(Duration::from_secs(5), app.oneshot(get_req(uri)))
            .await
            .expect("validation must not reach the index")
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body_json(resp).await["error"]["code"], code, "{uri}");
    }
}

#[tokio::test]
async fn range_includes_local_midnight_edges() {
    let edge = |ts: &str, path: &str| {
        let mut r = base_record();
        r.request_at = DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc);
        r.request_path = Some(path.to_string());
        r
    };
    let index = Arc::new(MemoryIndex::with_records(vec![
        edge("2015-01-13T06:59:59.999Z", "/before-start"),
        edge("2015-01-13T07:00:00Z", "/start"),
        edge("2015-01-19T06:59:59.999Z", "/last"),
        edge("2015-01-19T07:00:00Z", "/after-end"),
    ]));
    let app = build_admin_router(state(index));
    let resp = app
        .oneshot(get_req(&format!("/admin/stats/logs.json?{RANGE}")))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["recordsTotal"], 2);
    assert_eq!(body["data"][0]["request_path"], "/last");
    assert_eq!(body["data"][1]["request_path"], "/start");
}

#[tokio::test]
async fn repeated_page_returns_same_rows_over_tied_timestamps() {
    let index = Arc::new(MemoryIndex::new());
    index.extend((0..40).map(|i| {
        let mut r = base_record();
        r.request_path = Some(format!("/tie/{i}"));
        r
    }));
    let uri = format!("/admin/stats/logs.json?{RANGE}&start=10&length=10");
    let first = body_json(build_admin_router(state(index.clone())).oneshot(get_req(&uri)).await.unwrap()).await;
    let second = body_json(build_admin_router(state(index)).oneshot(get_req(&uri)).await.unwrap()).await;
    assert_eq!(first["data"], second["data"]);
    assert_eq!(first["data"][0]["request_path"], "/tie/10");
}

// ── CSV export ────────────────────────────────────────────────

#[tokio::test]
async fn csv_export_streams_every_row() {
    let index = Arc::new(MemoryIndex::new());
    index.extend((0..1005).map(|_| secret_record()));
    let app = build_admin_router(state(index.clone()));
    let resp = app
        .oneshot(get_req(&format!("/admin/stats/logs.csv?{RANGE}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/csv");
    let disposition = resp.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
    assert!(disposition.starts_with("attachment; filename=\"api_logs ("));
    assert!(disposition.ends_with(").csv\""));

    let text = body_text(resp).await;
    assert!(!text.contains("SECRET"));
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1006);
    assert_eq!(
        lines[0],
        "Time,Method,Host,URL,User,IP Address,Country,State,City,Status,Reason Denied,Response Time,Content Type,Accept Encoding,User Agent"
    );
    assert_eq!(
        lines[1],
        "2015-01-15 23:06:28,GET,127.0.0.1,http://127.0.0.1/with_api_key/?foo=bar,,127.0.0.1,,,,200,,,,,"
    );
    assert_eq!(index.open_scrolls(), 0);
}

#[tokio::test]
async fn csv_export_of_nothing_is_header_only() {
    let index = Arc::new(MemoryIndex::new());
    let app = build_admin_router(state(index.clone()));
    let resp = app
        .oneshot(get_req(&format!("/admin/stats/logs.csv?{RANGE}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await.lines().count(), 1);
    assert_eq!(index.open_scrolls(), 0);
}

#[tokio::test]
async fn dropped_download_releases_cursor() {
    let index = Arc::new(MemoryIndex::new());
    index.extend((0..500).map(|_| base_record()));
    let app = build_admin_router(state(index.clone()));
    let resp = app
        .oneshot(get_req(&format!("/admin/stats/logs.csv?{RANGE}")))
        .await
        .unwrap();
    assert_eq!(index.open_scrolls(), 1);

    let mut chunks = resp.into_body().into_data_stream();
    let header = chunks.next().await.unwrap().unwrap();
    assert!(header.starts_with(b"Time,Method"));
    drop(chunks);

    wait_for_release(&index).await;
}

// ── Backend failures ──────────────────────────────────────────

#[tokio::test]
async fn unreachable_index_is_503() {
    let index = Arc::new(FlakyIndex {
        inner: Arc::new(MemoryIndex::new()),
        down: true,
        fail_scroll: AtomicBool::new(false),
    });
    for path in ["/admin/stats/logs.json", "/admin/stats/logs.csv"] {
        let app = build_admin_router(state_with(index.clone(), config()));
        let resp = app.oneshot(get_req(&format!("{path}?{RANGE}"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], "backend_unavailable");
        assert_eq!(body["error"]["retryable"], true);
    }
}

#[tokio::test]
async fn failure_mid_export_truncates_body_and_releases_cursor() {
    let inner = Arc::new(MemoryIndex::new());
    inner.extend((0..250).map(|_| base_record()));
    let index = Arc::new(FlakyIndex {
        inner: inner.clone(),
        down: false,
        fail_scroll: AtomicBool::new(true),
    });
    let app = build_admin_router(state_with(index, config()));
    let resp = app
        .oneshot(get_req(&format!("/admin/stats/logs.csv?{RANGE}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(to_bytes(resp.into_body(), 16 * 1024 * 1024).await.is_err());
    wait_for_release(&inner).await;
}

// ── Auth and metrics ──────────────────────────────────────────

#[tokio::test]
async fn api_key_guards_log_endpoints_only() {
    let mut config = config();
    config.admin.api_key = Some("admin-token".into());
    let state = state_with(Arc::new(MemoryIndex::new()), config);

    let resp = build_admin_router(state.clone())
        .oneshot(get_req(&format!("/admin/stats/logs.json?{RANGE}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let authed = Request::builder()
        .uri(format!("/admin/stats/logs.json?{RANGE}"))
        .header("x-api-key", "admin-token")
        .body(Body::empty())
        .unwrap();
    let resp = build_admin_router(state.clone()).oneshot(authed).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = build_admin_router(state).oneshot(get_req("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn metrics_endpoint_when_enabled() {
    let mut config = config();
    config.observability.prometheus.enabled = true;
    let state = state_with(Arc::new(MemoryIndex::with_records(vec![base_record()])), config);

    build_admin_router(state.clone())
        .oneshot(get_req(&format!("/admin/stats/logs.json?{RANGE}")))
        .await
        .unwrap();
    let resp = build_admin_router(state).oneshot(get_req("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body_text(resp).await.contains("ando_log_searches_total"));

    let disabled = build_admin_router(state_with(Arc::new(MemoryIndex::new()), LogSearchConfig::default()));
    let resp = disabled.oneshot(get_req("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
