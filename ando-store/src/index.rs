use crate::query::SearchQuery;
use ando_core::error::SearchError;
use ando_core::record::LogRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Faults raised by a log index backend.
///
/// Messages never carry response bodies or query text: both can contain
/// credential values.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("index unreachable: {0}")]
    Unavailable(String),

    #[error("index request timed out after {0} ms")]
    Timeout(u64),

    #[error("scroll cursor expired or unknown")]
    ScrollExpired,

    #[error("index rejected the query with status {status}: {reason}")]
    Rejected { status: u16, reason: String },

    #[error("unreadable index response: {0}")]
    Decode(String),
}

impl From<StoreError> for SearchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => SearchError::BackendUnavailable(msg),
            StoreError::Timeout(ms) => SearchError::Timeout(ms),
            StoreError::ScrollExpired => SearchError::ScrollExpired,
            StoreError::Rejected { .. } | StoreError::Decode(_) => {
                SearchError::Internal(err.to_string())
            }
        }
    }
}

/// One bounded fetch: total match count plus the requested window.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub total: u64,
    pub records: Vec<LogRecord>,
    /// Present only when the query asked for a histogram.
    pub buckets: Vec<Bucket>,
}

/// One date-histogram bucket; `key` is the bucket's first instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub key: DateTime<Utc>,
    pub doc_count: u64,
}

/// Backend-issued resume point of a scan. Opaque to callers.
#[derive(Clone, PartialEq, Eq)]
pub struct ScrollCursor(String);

impl ScrollCursor {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Scroll ids are long and grant access to the scan; keep them out of logs.
impl fmt::Debug for ScrollCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScrollCursor({} bytes)", self.0.len())
    }
}

/// One scan batch. An empty `records` means the scan is exhausted.
#[derive(Debug, Clone)]
pub struct ScrollBatch {
    pub records: Vec<LogRecord>,
    pub cursor: ScrollCursor,
}

/// Search primitives of the analytics index holding gateway request logs.
#[async_trait]
pub trait LogIndex: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Single bounded fetch using the query's `from`/`size` window.
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, StoreError>;

    /// Start a scan; returns the first batch and the cursor for the next.
    async fn open_scroll(&self, query: &SearchQuery) -> Result<ScrollBatch, StoreError>;

    /// Fetch the batch after `cursor`, extending its lifetime by `keep_alive`.
    async fn scroll(
        &self,
        cursor: &ScrollCursor,
        keep_alive: Duration,
    ) -> Result<ScrollBatch, StoreError>;

    /// Release index-side resources held by `cursor`.
    async fn clear_scroll(&self, cursor: &ScrollCursor) -> Result<(), StoreError>;
}
