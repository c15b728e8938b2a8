//! Page and export orchestration over a [`LogIndex`].
//!
//! [`LogSearch::page`] runs one bounded fetch. [`LogSearch::export`] opens a
//! scroll and hands back a [`LogExport`] that pulls one batch at a time, so
//! memory stays bounded by the batch size no matter how many rows match.
//! Both paths redact every record before returning it.

use ando_core::config::IndexConfig;
use ando_core::error::SearchError;
use ando_core::record::LogRecord;
use ando_core::request::{Mode, SearchRequest};
use ando_observability::metrics::SearchMetrics;
use ando_observability::redact::{RedactedRecord, redact};
use ando_store::index::{Bucket, LogIndex, ScrollCursor, StoreError};
use ando_store::query::{self, SearchQuery};
use chrono_tz::Tz;
use futures_util::Stream;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of a page search.
#[derive(Debug)]
pub struct SearchResult {
    pub total_matching: u64,
    pub records: Vec<RedactedRecord>,
    /// Empty unless the request asked for a histogram.
    pub buckets: Vec<Bucket>,
    /// Timezone the request was resolved in.
    pub tz: Tz,
}

/// Search engine over one log index.
#[derive(Clone)]
pub struct LogSearch {
    index: Arc<dyn LogIndex>,
    config: IndexConfig,
    metrics: Arc<SearchMetrics>,
}

impl LogSearch {
    pub fn new(index: Arc<dyn LogIndex>, config: IndexConfig, metrics: Arc<SearchMetrics>) -> Self {
        Self {
            index,
            config,
            metrics,
        }
    }

    pub fn backend(&self) -> &'static str {
        self.index.name()
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Fetch one window of matching records plus the total match count.
    ///
    /// One round trip, no retries. A backend that does not answer within
    /// the configured timeout fails with [`SearchError::Timeout`].
    pub async fn page(&self, request: &SearchRequest) -> Result<SearchResult, SearchError> {
        if !matches!(request.mode, Mode::Page { .. }) {
            return Err(SearchError::Internal("page search needs a page request".into()));
        }
        let query = query::translate(request, &self.config)?;
        let started = Instant::now();
        let outcome = with_deadline(self.timeout(), self.index.search(&query)).await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(page) => {
                self.metrics.record_search("page", 200, elapsed);
                debug!(
                    backend = self.index.name(),
                    total = page.total,
                    returned = page.records.len(),
                    "page search completed"
                );
                Ok(SearchResult {
                    total_matching: page.total,
                    records: page.records.into_iter().map(redact).collect(),
                    buckets: page.buckets,
                    tz: query.range.tz,
                })
            }
            Err(e) => {
                self.metrics.record_search("page", e.status_code(), elapsed);
                warn!(backend = self.index.name(), error = %e, "page search failed");
                Err(e)
            }
        }
    }

    /// Start a full-result export.
    ///
    /// The scroll is opened here, so an unreachable index fails the request
    /// before any output is produced. The returned export owns the cursor
    /// and releases it when exhausted, on error, or when dropped.
    pub async fn export(&self, request: &SearchRequest) -> Result<LogExport, SearchError> {
        if request.mode != Mode::Export {
            return Err(SearchError::Internal("export needs an export request".into()));
        }
        let query = query::translate(request, &self.config)?;
        let keep_alive = query.keep_alive().unwrap_or(Duration::from_secs(
            self.config.scroll_keep_alive_secs,
        ));
        let started = Instant::now();
        let opened = with_deadline(self.timeout(), self.index.open_scroll(&query)).await;
        let elapsed = started.elapsed().as_secs_f64();

        let first = match opened {
            Ok(batch) => batch,
            Err(e) => {
                self.metrics.record_search("export", e.status_code(), elapsed);
                warn!(backend = self.index.name(), error = %e, "export could not start");
                return Err(e);
            }
        };
        self.metrics.record_search("export", 200, elapsed);

        let export = LogExport::new(
            self.index.clone(),
            first.cursor,
            first.records,
            keep_alive,
            self.timeout(),
            &query,
            self.metrics.clone(),
        );
        info!(
            export_id = %export.id,
            backend = self.index.name(),
            indices = query.indices.len(),
            "export started"
        );
        Ok(export)
    }
}

/// Await a backend call, bounding it by `deadline`.
async fn with_deadline<T>(
    deadline: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, SearchError> {
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result.map_err(SearchError::from),
        Err(_) => Err(SearchError::Timeout(deadline.as_millis() as u64)),
    }
}

/// An in-flight export: a lazy, single-pass sequence of redacted batches.
///
/// Batches are fetched strictly one after another. The scroll cursor is
/// cleared exactly once: when the scan is exhausted, when a fetch fails,
/// on [`LogExport::close`], or when the export is dropped mid-stream.
pub struct LogExport {
    index: Arc<dyn LogIndex>,
    cursor: Option<ScrollCursor>,
    pending: Option<Vec<LogRecord>>,
    keep_alive: Duration,
    timeout: Duration,
    id: Uuid,
    tz: Tz,
    rows: u64,
    batches: u64,
    metrics: Arc<SearchMetrics>,
}

impl LogExport {
    fn new(
        index: Arc<dyn LogIndex>,
        cursor: ScrollCursor,
        first: Vec<LogRecord>,
        keep_alive: Duration,
        timeout: Duration,
        query: &SearchQuery,
        metrics: Arc<SearchMetrics>,
    ) -> Self {
        metrics.export_started();
        Self {
            index,
            cursor: Some(cursor),
            pending: Some(first),
            keep_alive,
            timeout,
            id: Uuid::new_v4(),
            tz: query.range.tz,
            rows: 0,
            batches: 0,
            metrics,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Timezone export timestamps are rendered in.
    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// Rows handed out so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Whether the index still holds a cursor for this export.
    pub fn is_open(&self) -> bool {
        self.cursor.is_some()
    }

    /// Next batch of redacted records; `Ok(None)` once the scan is done.
    ///
    /// After an error the cursor is already released and later calls
    /// return `Ok(None)`.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<RedactedRecord>>, SearchError> {
        let records = match self.pending.take() {
            Some(first) => first,
            None => {
                let Some(cursor) = self.cursor.clone() else {
                    return Ok(None);
                };
                let fetched =
                    with_deadline(self.timeout, self.index.scroll(&cursor, self.keep_alive)).await;
                match fetched {
                    Ok(batch) => {
                        self.cursor = Some(batch.cursor);
                        batch.records
                    }
                    Err(e) => {
                        warn!(
                            export_id = %self.id,
                            rows = self.rows,
                            error = %e,
                            "export aborted mid-scroll"
                        );
                        self.close().await;
                        return Err(e);
                    }
                }
            }
        };

        if records.is_empty() {
            info!(
                export_id = %self.id,
                rows = self.rows,
                batches = self.batches,
                "export completed"
            );
            self.close().await;
            return Ok(None);
        }

        self.batches += 1;
        self.rows += records.len() as u64;
        self.metrics.add_export_rows(records.len() as u64);
        debug!(export_id = %self.id, batch = self.batches, size = records.len(), "export batch");
        Ok(Some(records.into_iter().map(redact).collect()))
    }

    /// Release the scroll cursor, if still held.
    pub async fn close(&mut self) {
        self.pending = None;
        if let Some(cursor) = self.cursor.take() {
            match self.index.clear_scroll(&cursor).await {
                Ok(()) => debug!(export_id = %self.id, "scroll released"),
                Err(e) => warn!(export_id = %self.id, error = %e, "scroll release failed"),
            }
        }
    }

    /// Drain the export as a stream of batches. The stream ends after the
    /// first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<RedactedRecord>, SearchError>> {
        futures_util::stream::unfold(self, |mut export| async move {
            match export.next_batch().await {
                Ok(Some(batch)) => Some((Ok(batch), export)),
                Ok(None) => None,
                Err(e) => Some((Err(e), export)),
            }
        })
    }
}

impl Drop for LogExport {
    fn drop(&mut self) {
        self.metrics.export_finished();
        let Some(cursor) = self.cursor.take() else {
            return;
        };
        // Client went away mid-stream; release the cursor in the background.
        let index = self.index.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                info!(export_id = %id, rows = self.rows, "export abandoned, releasing scroll");
                handle.spawn(async move {
                    if let Err(e) = index.clear_scroll(&cursor).await {
                        warn!(export_id = %id, error = %e, "scroll release failed");
                    }
                });
            }
            Err(_) => warn!(export_id = %id, "no runtime to release scroll; it will expire"),
        }
    }
}
