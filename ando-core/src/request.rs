//! Search requests: parameter parsing and time-range resolution.

use crate::config::SearchConfig;
use crate::error::ValidationError;
use crate::fields::{self, FieldPolicy};
use crate::filter::{self, FilterGroup};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::str::FromStr;

/// Raw query parameters shared by the JSON search and CSV export endpoints.
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    pub tz: Option<String>,
    pub start_at: Option<String>,
    pub end_at: Option<String>,
    pub interval: Option<String>,
    pub start: Option<String>,
    pub length: Option<String>,
    pub search: Option<String>,
    pub query: Option<String>,
    pub sort_column: Option<String>,
    pub sort_dir: Option<String>,
    pub hits_over_time: bool,
}

impl SearchParams {
    /// Collect parameters from a decoded query string.
    ///
    /// Sorting follows the DataTables convention: `order[0][column]` indexes
    /// into `columns[N][data]`, which names the field.
    pub fn from_query(map: &HashMap<String, String>) -> Self {
        let get = |k: &str| map.get(k).cloned();
        let sort_column = get("order[0][column]")
            .and_then(|idx| get(&format!("columns[{idx}][data]")));
        Self {
            tz: get("tz"),
            start_at: get("start_at"),
            end_at: get("end_at"),
            interval: get("interval"),
            start: get("start"),
            length: get("length"),
            search: get("search").or_else(|| get("search[value]")),
            query: get("query"),
            sort_column,
            sort_dir: get("order[0][dir]"),
            hits_over_time: matches!(get("hits_over_time").as_deref(), Some("true" | "1")),
        }
    }
}

/// Calendar-local bounds of a search, interpreted in `timezone`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeRange {
    pub start_at: NaiveDate,
    pub end_at: NaiveDate,
    pub timezone: String,
}

/// Absolute bounds: `start` inclusive, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub tz: Tz,
}

impl TimeRange {
    pub fn tz(&self) -> Result<Tz, ValidationError> {
        Tz::from_str(&self.timezone)
            .map_err(|_| ValidationError::UnknownTimezone(self.timezone.clone()))
    }

    /// Resolve to UTC instants: local midnight starting `start_at` through
    /// local midnight ending `end_at`.
    pub fn resolve(&self) -> Result<ResolvedRange, ValidationError> {
        let tz = self.tz()?;
        if self.end_at < self.start_at {
            return Err(ValidationError::InvalidTimeRange);
        }
        let end_day = self
            .end_at
            .succ_opt()
            .ok_or(ValidationError::InvalidDate { param: "end_at" })?;
        Ok(ResolvedRange {
            start: local_day_start(tz, self.start_at).with_timezone(&Utc),
            end: local_day_start(tz, end_day).with_timezone(&Utc),
            tz,
        })
    }
}

/// First instant of a local calendar day. Days whose midnight falls in a
/// DST gap start at the first valid local time after it.
pub fn local_day_start(tz: Tz, day: NaiveDate) -> DateTime<Tz> {
    let midnight = day.and_time(chrono::NaiveTime::MIN);
    first_valid(tz, midnight)
}

fn first_valid(tz: Tz, local: NaiveDateTime) -> DateTime<Tz> {
    let mut candidate = local;
    // DST gaps never exceed a few hours.
    for _ in 0..(4 * 60) {
        if let Some(t) = tz.from_local_datetime(&candidate).earliest() {
            return t;
        }
        candidate += Duration::minutes(1);
    }
    tz.from_utc_datetime(&local)
}

/// Most buckets a `hits_over_time` histogram may span.
pub const MAX_HISTOGRAM_BUCKETS: u64 = 65_536;

/// Bucket granularity for time-series aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Minute => "minute",
            Interval::Hour => "hour",
            Interval::Day => "day",
            Interval::Week => "week",
            Interval::Month => "month",
        }
    }

    /// Elasticsearch `calendar_interval` unit.
    pub fn calendar_interval(&self) -> &'static str {
        match self {
            Interval::Minute => "1m",
            Interval::Hour => "1h",
            Interval::Day => "1d",
            Interval::Week => "1w",
            Interval::Month => "1M",
        }
    }

    /// Upper bound on the buckets covering `days` local calendar days,
    /// allowing for 25-hour DST days and partial weeks or months at the edges.
    pub fn max_buckets(&self, days: u64) -> u64 {
        match self {
            Interval::Minute => days.saturating_mul(25 * 60),
            Interval::Hour => days.saturating_mul(25),
            Interval::Day => days,
            Interval::Week => days / 7 + 2,
            Interval::Month => days / 28 + 2,
        }
    }

    /// Start of the local bucket containing `t`. Weeks start on Monday.
    pub fn bucket_start(&self, t: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let local = t.with_timezone(&tz).naive_local();
        let truncated = match self {
            Interval::Minute => local
                .with_second(0)
                .and_then(|l| l.with_nanosecond(0))
                .unwrap_or(local),
            Interval::Hour => local.date().and_hms_opt(local.hour(), 0, 0).unwrap_or(local),
            Interval::Day => local.date().and_time(chrono::NaiveTime::MIN),
            Interval::Week => {
                let monday = local.date()
                    - Duration::days(i64::from(local.weekday().num_days_from_monday()));
                monday.and_time(chrono::NaiveTime::MIN)
            }
            Interval::Month => local
                .date()
                .with_day(1)
                .unwrap_or(local.date())
                .and_time(chrono::NaiveTime::MIN),
        };
        match self {
            // Sub-day buckets follow absolute time; an ambiguous local hour maps to its first pass.
            Interval::Minute | Interval::Hour => tz
                .from_local_datetime(&truncated)
                .earliest()
                .map(|l| l.with_timezone(&Utc))
                .unwrap_or(t),
            _ => first_valid(tz, truncated).with_timezone(&Utc),
        }
    }

    /// Start of the bucket after the one starting at `bucket`.
    pub fn next_bucket(&self, bucket: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let past = match self {
            Interval::Minute => bucket + Duration::minutes(1),
            Interval::Hour => bucket + Duration::hours(1),
            // Jump past the bucket by more than a DST shift, then snap back.
            Interval::Day => bucket + Duration::hours(26),
            Interval::Week => bucket + Duration::days(7) + Duration::hours(2),
            Interval::Month => bucket + Duration::days(32),
        };
        self.bucket_start(past, tz)
    }
}

impl FromStr for Interval {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(Interval::Minute),
            "hour" => Ok(Interval::Hour),
            "day" => Ok(Interval::Day),
            "week" => Ok(Interval::Week),
            "month" => Ok(Interval::Month),
            other => Err(ValidationError::InvalidInterval(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sort {
    pub field: &'static FieldPolicy,
    pub descending: bool,
}

impl Default for Sort {
    fn default() -> Self {
        Self {
            field: &fields::FIELDS[0],
            descending: true,
        }
    }
}

/// Fetch strategy of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One bounded window of rows.
    Page { offset: u64, length: u64 },
    /// The entire filtered result set, scrolled in batches.
    Export,
}

/// Which endpoint a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    Page,
    Export,
}

/// A validated search request.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub time_range: TimeRange,
    pub interval: Interval,
    pub free_text: Option<String>,
    pub filter: Option<FilterGroup>,
    pub sort: Sort,
    pub mode: Mode,
    /// Ask the backend for per-interval hit counts alongside the page.
    pub histogram: bool,
}

impl SearchRequest {
    /// Validate raw parameters. Performs no backend calls.
    pub fn from_params(
        params: &SearchParams,
        kind: ModeKind,
        config: &SearchConfig,
        max_result_window: u64,
    ) -> Result<Self, ValidationError> {
        let timezone = non_blank(&params.tz)
            .unwrap_or(config.default_timezone.as_str())
            .to_string();
        let start_at = parse_date("start_at", &params.start_at)?;
        let end_at = parse_date("end_at", &params.end_at)?;
        let interval = non_blank(&params.interval)
            .unwrap_or(config.default_interval.as_str())
            .parse::<Interval>()?;

        // Reversed ranges are rejected when the range is resolved.
        let days = u64::try_from((end_at - start_at).num_days() + 1).unwrap_or(0);
        if days > config.max_range_days {
            return Err(ValidationError::RangeTooLarge {
                days,
                limit: config.max_range_days,
            });
        }
        let histogram = params.hits_over_time && kind == ModeKind::Page;
        if histogram && interval.max_buckets(days) > MAX_HISTOGRAM_BUCKETS {
            return Err(ValidationError::HistogramTooLarge {
                buckets: interval.max_buckets(days),
                interval: interval.as_str(),
                limit: MAX_HISTOGRAM_BUCKETS,
            });
        }

        let free_text = non_blank(&params.search).map(str::to_string);
        let filter = filter::parse_filter(params.query.as_deref())?;
        let sort = parse_sort(params)?;

        let mode = match kind {
            ModeKind::Export => Mode::Export,
            ModeKind::Page => {
                let offset = match non_blank(&params.start) {
                    None => 0,
                    Some(s) => s.parse::<u64>().map_err(|_| ValidationError::InvalidParameter {
                        param: "start",
                        reason: "expected a non-negative integer".into(),
                    })?,
                };
                let length = match non_blank(&params.length) {
                    None => config.default_page_length,
                    // DataTables sends -1 for "show all".
                    Some("-1") => config.max_page_length,
                    Some(s) => s.parse::<u64>().map_err(|_| ValidationError::InvalidParameter {
                        param: "length",
                        reason: "expected a non-negative integer".into(),
                    })?,
                }
                .min(config.max_page_length);
                let end = offset.saturating_add(length);
                if end > max_result_window {
                    return Err(ValidationError::PageWindowTooLarge {
                        end,
                        limit: max_result_window,
                    });
                }
                Mode::Page { offset, length }
            }
        };

        Ok(Self {
            time_range: TimeRange {
                start_at,
                end_at,
                timezone,
            },
            interval,
            free_text,
            filter,
            sort,
            mode,
            histogram,
        })
    }
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_date(param: &'static str, raw: &Option<String>) -> Result<NaiveDate, ValidationError> {
    let raw = non_blank(raw).ok_or(ValidationError::MissingParameter(param))?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| ValidationError::InvalidDate { param })
}

fn parse_sort(params: &SearchParams) -> Result<Sort, ValidationError> {
    let Some(column) = non_blank(&params.sort_column) else {
        return Ok(Sort::default());
    };
    let field = fields::lookup(column)
        .ok()
        .filter(|f| f.sortable)
        .ok_or_else(|| ValidationError::UnknownSortField(column.to_string()))?;
    let descending = match non_blank(&params.sort_dir) {
        None => true,
        Some(d) if d.eq_ignore_ascii_case("desc") => true,
        Some(d) if d.eq_ignore_ascii_case("asc") => false,
        Some(_) => {
            return Err(ValidationError::InvalidParameter {
                param: "order[0][dir]",
                reason: "expected asc or desc".into(),
            });
        }
    };
    Ok(Sort { field, descending })
}
