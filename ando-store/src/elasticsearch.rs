use crate::index::{Bucket, LogIndex, ScrollBatch, ScrollCursor, SearchPage, StoreError};
use crate::query::SearchQuery;
use ando_core::config::IndexConfig;
use ando_core::record::LogRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Elasticsearch-backed log index.
///
/// Requests rotate over the configured nodes. Missing monthly indices are
/// ignored, so a range reaching into months with no traffic still succeeds.
pub struct ElasticsearchIndex {
    client: reqwest::Client,
    urls: Vec<String>,
    next: AtomicUsize,
    username: Option<String>,
    password: Option<String>,
    timeout_ms: u64,
}

impl ElasticsearchIndex {
    pub fn new(config: &IndexConfig) -> Result<Self, StoreError> {
        if config.urls.is_empty() {
            return Err(StoreError::Unavailable("no index nodes configured".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .gzip(true)
            .build()
            .map_err(|e| StoreError::Unavailable(e.without_url().to_string()))?;
        Ok(Self {
            client,
            urls: config
                .urls
                .iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            next: AtomicUsize::new(0),
            username: config.username.clone(),
            password: config.password.clone(),
            timeout_ms: config.timeout_ms,
        })
    }

    fn node(&self) -> &str {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.urls.len();
        &self.urls[i]
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: &Value,
        in_scroll: bool,
    ) -> Result<Vec<u8>, StoreError> {
        let url = format!("{}{}", self.node(), path);
        let mut req = self.client.request(method, url).json(body);
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_ref());
        }
        let resp = req.send().await.map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| self.transport_error(e))?;
        if status.is_success() {
            return Ok(bytes.to_vec());
        }
        Err(status_error(status, &bytes, in_scroll))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &Value,
        in_scroll: bool,
    ) -> Result<T, StoreError> {
        let body = self.send(method, path, body, in_scroll).await?;
        decode(&body)
    }

    fn transport_error(&self, e: reqwest::Error) -> StoreError {
        if e.is_timeout() {
            StoreError::Timeout(self.timeout_ms)
        } else if e.is_connect() {
            StoreError::Unavailable("connection to index node failed".into())
        } else {
            StoreError::Unavailable(e.without_url().to_string())
        }
    }
}

/// `_search` path over the query's indices.
///
/// `preference` pins every page of one search to the same shard copies, so
/// tied sort keys come back in the same order on each request.
fn search_path(query: &SearchQuery, scroll: Option<Duration>) -> String {
    let mut path = format!(
        "/{}/_search?ignore_unavailable=true&allow_no_indices=true&preference={}",
        query.indices.join(","),
        query.preference()
    );
    if let Some(keep_alive) = scroll {
        path.push_str(&format!("&scroll={}s", keep_alive.as_secs().max(1)));
    }
    path
}

#[async_trait]
impl LogIndex for ElasticsearchIndex {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, StoreError> {
        let path = search_path(query, None);
        let resp: SearchResponse = self.call(Method::POST, &path, &query.to_body(), false).await?;
        debug!(indices = query.indices.len(), took_ms = resp.took, "index search completed");
        Ok(resp.into_page())
    }

    async fn open_scroll(&self, query: &SearchQuery) -> Result<ScrollBatch, StoreError> {
        let keep_alive = query.keep_alive().ok_or_else(|| StoreError::Rejected {
            status: 400,
            reason: "scroll requested without a keep-alive".into(),
        })?;
        let path = search_path(query, Some(keep_alive));
        let resp: SearchResponse = self.call(Method::POST, &path, &query.to_body(), false).await?;
        resp.into_batch()
    }

    async fn scroll(
        &self,
        cursor: &ScrollCursor,
        keep_alive: Duration,
    ) -> Result<ScrollBatch, StoreError> {
        let body = json!({
            "scroll": format!("{}s", keep_alive.as_secs().max(1)),
            "scroll_id": cursor.as_str(),
        });
        let resp: SearchResponse = self
            .call(Method::POST, "/_search/scroll", &body, true)
            .await?;
        resp.into_batch()
    }

    async fn clear_scroll(&self, cursor: &ScrollCursor) -> Result<(), StoreError> {
        let body = json!({ "scroll_id": [cursor.as_str()] });
        match self.send(Method::DELETE, "/_search/scroll", &body, true).await {
            Ok(_) | Err(StoreError::ScrollExpired) => Ok(()),
            Err(e) => {
                warn!(error = %e, "failed to clear index scroll");
                Err(e)
            }
        }
    }
}

// ── Wire types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    took: u64,
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    hits: Hits,
    #[serde(default)]
    aggregations: Option<Aggregations>,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    total: Option<Total>,
    #[serde(default)]
    hits: Vec<Hit>,
}

/// `hits.total` is a bare count before 7.0 and an object after.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Total {
    Count(u64),
    Object { value: u64 },
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: LogRecord,
}

#[derive(Debug, Deserialize)]
struct Aggregations {
    hits_over_time: HistogramAgg,
}

#[derive(Debug, Deserialize)]
struct HistogramAgg {
    #[serde(default)]
    buckets: Vec<RawBucket>,
}

#[derive(Debug, Deserialize)]
struct RawBucket {
    key: i64,
    doc_count: u64,
}

impl SearchResponse {
    fn into_page(self) -> SearchPage {
        let records: Vec<LogRecord> = self.hits.hits.into_iter().map(|h| h.source).collect();
        let total = match self.hits.total {
            Some(Total::Count(n)) | Some(Total::Object { value: n }) => n,
            None => records.len() as u64,
        };
        let buckets = self
            .aggregations
            .map(|a| {
                a.hits_over_time
                    .buckets
                    .into_iter()
                    .filter_map(|b| {
                        DateTime::<Utc>::from_timestamp_millis(b.key).map(|key| Bucket {
                            key,
                            doc_count: b.doc_count,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        SearchPage {
            total,
            records,
            buckets,
        }
    }

    fn into_batch(self) -> Result<ScrollBatch, StoreError> {
        let cursor = self
            .scroll_id
            .clone()
            .map(ScrollCursor::new)
            .ok_or_else(|| StoreError::Decode("scroll response carried no scroll id".into()))?;
        Ok(ScrollBatch {
            records: self.into_page().records,
            cursor,
        })
    }
}

/// Decode a response body. Errors give the position only; bodies carry
/// stored request data.
fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(body).map_err(|e| {
        StoreError::Decode(format!("line {} column {}", e.line(), e.column()))
    })
}

/// Map a non-2xx response. Only the error `type` is kept from the body;
/// its `reason` may quote query values.
fn status_error(status: StatusCode, body: &[u8], in_scroll: bool) -> StoreError {
    if in_scroll && status == StatusCode::NOT_FOUND {
        return StoreError::ScrollExpired;
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return StoreError::Unavailable(format!("index node answered {}", status.as_u16()));
    }
    let reason = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["type"].as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    StoreError::Rejected {
        status: status.as_u16(),
        reason,
    }
}
