use thiserror::Error;

/// A rejected search request. Raised before any backend call is made.
///
/// Messages name the offending parameter, field or operator. They never echo
/// a rule value: filter values may themselves be credentials.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid parameter {param}: {reason}")]
    InvalidParameter { param: &'static str, reason: String },

    #[error("Invalid date for {param}: expected YYYY-MM-DD")]
    InvalidDate { param: &'static str },

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("Invalid time range: end_at is before start_at")]
    InvalidTimeRange,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Malformed filter: {0}")]
    MalformedFilter(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Operator {operator} is not supported for field {field}")]
    UnsupportedOperator { field: String, operator: String },

    #[error("Invalid value for field {field} with operator {operator}: {reason}")]
    InvalidValue {
        field: String,
        operator: String,
        reason: &'static str,
    },

    #[error("Field {0} cannot be sorted on")]
    UnknownSortField(String),

    #[error("Page window ends at row {end}, beyond the {limit} row limit; use the CSV export")]
    PageWindowTooLarge { end: u64, limit: u64 },

    #[error("Time range spans {days} days, beyond the {limit} day limit")]
    RangeTooLarge { days: u64, limit: u64 },

    #[error("Histogram needs up to {buckets} {interval} buckets, beyond the {limit} bucket limit; use a coarser interval")]
    HistogramTooLarge {
        buckets: u64,
        interval: &'static str,
        limit: u64,
    },
}

impl ValidationError {
    /// Stable machine-readable reason.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MissingParameter(_) => "missing_parameter",
            ValidationError::InvalidParameter { .. } => "invalid_parameter",
            ValidationError::InvalidDate { .. } => "invalid_date",
            ValidationError::UnknownTimezone(_) => "unknown_timezone",
            ValidationError::InvalidTimeRange => "invalid_time_range",
            ValidationError::InvalidInterval(_) => "invalid_interval",
            ValidationError::MalformedFilter(_) => "malformed_filter",
            ValidationError::UnknownField(_) => "unknown_field",
            ValidationError::UnsupportedOperator { .. } => "unsupported_operator",
            ValidationError::InvalidValue { .. } => "invalid_value",
            ValidationError::UnknownSortField(_) => "unknown_sort_field",
            ValidationError::PageWindowTooLarge { .. } => "page_window_too_large",
            ValidationError::RangeTooLarge { .. } => "range_too_large",
            ValidationError::HistogramTooLarge { .. } => "histogram_too_large",
        }
    }
}

/// Unified error type for search and export.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Log index unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Log index did not answer within {0} ms")]
    Timeout(u64),

    #[error("Scroll cursor expired before the export completed")]
    ScrollExpired,

    #[error("Internal: {0}")]
    Internal(String),
}

impl SearchError {
    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            SearchError::Validation(_) => 400,
            SearchError::BackendUnavailable(_) => 503,
            SearchError::ScrollExpired => 503,
            SearchError::Timeout(_) => 504,
            SearchError::Internal(_) => 500,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SearchError::BackendUnavailable(_) | SearchError::Timeout(_) | SearchError::ScrollExpired
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            SearchError::Validation(v) => v.code(),
            // An expired cursor is reported the same way as an unreachable index.
            SearchError::BackendUnavailable(_) | SearchError::ScrollExpired => "backend_unavailable",
            SearchError::Timeout(_) => "backend_timeout",
            SearchError::Internal(_) => "internal_error",
        }
    }

    /// JSON error body.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "retryable": self.is_retryable(),
            }
        })
    }
}
