//! Query translation: validated search requests to backend queries.
//!
//! [`translate`] lowers a [`SearchRequest`] into a [`SearchQuery`], the
//! backend-neutral query object both index backends consume. The
//! Elasticsearch backend serializes it with [`SearchQuery::to_body`]; the
//! in-memory backend evaluates it directly.

use ando_core::config::IndexConfig;
use ando_core::error::ValidationError;
use ando_core::fields::{self, Operator};
use ando_core::filter::{Condition, FilterGroup, FilterNode, FilterRule, FilterValue, Scalar};
use ando_core::request::{Interval, Mode, ResolvedRange, SearchRequest};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value, json};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Backend field holding the request timestamp.
pub const TIMESTAMP_FIELD: &str = "request_at";

/// Secondary sort key: index order, breaking ties between equal sort values.
pub const TIEBREAK_FIELD: &str = "_doc";

/// Boolean query tree understood by the log index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexQuery {
    MatchAll,
    Bool {
        must: Vec<IndexQuery>,
        should: Vec<IndexQuery>,
        must_not: Vec<IndexQuery>,
    },
    Term {
        field: &'static str,
        value: Scalar,
        case_insensitive: bool,
    },
    Terms {
        field: &'static str,
        values: Vec<Scalar>,
        case_insensitive: bool,
    },
    Prefix {
        field: &'static str,
        value: String,
        case_insensitive: bool,
    },
    /// `*` matches any run, `?` one character, `\` escapes.
    Wildcard {
        field: &'static str,
        pattern: String,
        case_insensitive: bool,
    },
    Range {
        field: &'static str,
        bounds: Bounds,
    },
    Exists {
        field: &'static str,
    },
    /// Every whitespace-separated term must appear in at least one field.
    FullText {
        fields: Vec<&'static str>,
        text: String,
    },
}

impl IndexQuery {
    fn must(must: Vec<IndexQuery>) -> Self {
        IndexQuery::Bool {
            must,
            should: Vec::new(),
            must_not: Vec::new(),
        }
    }

    fn should(should: Vec<IndexQuery>) -> Self {
        IndexQuery::Bool {
            must: Vec::new(),
            should,
            must_not: Vec::new(),
        }
    }

    fn not(inner: IndexQuery) -> Self {
        IndexQuery::Bool {
            must: Vec::new(),
            should: Vec::new(),
            must_not: vec![inner],
        }
    }

    fn range(field: &'static str, bounds: Bounds) -> Self {
        IndexQuery::Range { field, bounds }
    }

    /// Elasticsearch query DSL.
    pub fn to_json(&self) -> Value {
        match self {
            IndexQuery::MatchAll => json!({ "match_all": {} }),
            IndexQuery::Bool {
                must,
                should,
                must_not,
            } => {
                let mut body = Map::new();
                if !must.is_empty() {
                    body.insert("must".into(), must.iter().map(Self::to_json).collect());
                }
                if !should.is_empty() {
                    body.insert("should".into(), should.iter().map(Self::to_json).collect());
                    body.insert("minimum_should_match".into(), json!(1));
                }
                if !must_not.is_empty() {
                    body.insert(
                        "must_not".into(),
                        must_not.iter().map(Self::to_json).collect(),
                    );
                }
                json!({ "bool": body })
            }
            IndexQuery::Term {
                field,
                value,
                case_insensitive,
            } => leaf("term", field, scalar_json(value), *case_insensitive),
            IndexQuery::Terms {
                field,
                values,
                case_insensitive,
            } => {
                if *case_insensitive {
                    // `terms` has no case-insensitive mode; spell it out as a disjunction.
                    let terms: Vec<Value> = values
                        .iter()
                        .map(|v| leaf("term", field, scalar_json(v), true))
                        .collect();
                    json!({ "bool": { "should": terms, "minimum_should_match": 1 } })
                } else {
                    let values: Vec<Value> = values.iter().map(scalar_json).collect();
                    json!({ "terms": { *field: values } })
                }
            }
            IndexQuery::Prefix {
                field,
                value,
                case_insensitive,
            } => leaf("prefix", field, json!(value), *case_insensitive),
            IndexQuery::Wildcard {
                field,
                pattern,
                case_insensitive,
            } => leaf("wildcard", field, json!(pattern), *case_insensitive),
            IndexQuery::Range { field, bounds } => {
                let mut params = Map::new();
                for (key, bound) in [
                    ("gte", &bounds.gte),
                    ("gt", &bounds.gt),
                    ("lte", &bounds.lte),
                    ("lt", &bounds.lt),
                ] {
                    if let Some(v) = bound {
                        params.insert(key.into(), scalar_json(v));
                    }
                }
                json!({ "range": { *field: params } })
            }
            IndexQuery::Exists { field } => json!({ "exists": { "field": field } }),
            IndexQuery::FullText { fields, text } => json!({
                "simple_query_string": {
                    "query": text,
                    "fields": fields,
                    "default_operator": "and",
                    "lenient": true,
                }
            }),
        }
    }
}

/// Range limits; unset sides are open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bounds {
    pub gte: Option<Scalar>,
    pub gt: Option<Scalar>,
    pub lte: Option<Scalar>,
    pub lt: Option<Scalar>,
}

fn leaf(kind: &str, field: &str, value: Value, case_insensitive: bool) -> Value {
    let mut params = Map::new();
    params.insert("value".into(), value);
    if case_insensitive {
        params.insert("case_insensitive".into(), json!(true));
    }
    json!({ kind: { field: params } })
}

pub fn scalar_json(v: &Scalar) -> Value {
    match v {
        Scalar::Text(s) => json!(s),
        Scalar::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => json!(*n as i64),
        Scalar::Number(n) => json!(n),
        Scalar::Time(t) => json!(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
    }
}

/// Sort key of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SortKey {
    pub field: &'static str,
    pub descending: bool,
}

/// How the backend should hand back rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    /// `from`/`size` window.
    Window { from: u64, size: u64 },
    /// Fixed-size batches through a scroll cursor.
    Scroll { batch_size: u64, keep_alive: Duration },
}

/// Per-interval hit counts over the searched range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DateHistogram {
    pub interval: Interval,
    pub tz: Tz,
    /// First and last instants of the searched range; empty buckets between them are reported.
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
}

/// Backend query object produced by [`translate`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    /// Monthly indices covering the time range.
    pub indices: Vec<String>,
    pub query: IndexQuery,
    pub sort: SortKey,
    pub fetch: Fetch,
    pub histogram: Option<DateHistogram>,
    /// Resolved time range, kept for rendering local timestamps.
    pub range: ResolvedRange,
}

impl SearchQuery {
    /// Elasticsearch `_search` request body.
    pub fn to_body(&self) -> Value {
        let order = if self.sort.descending { "desc" } else { "asc" };
        let mut body = json!({
            "query": self.query.to_json(),
            "sort": [
                { self.sort.field: { "order": order, "missing": "_last" } },
                { TIEBREAK_FIELD: "asc" },
            ],
        });
        match self.fetch {
            Fetch::Window { from, size } => {
                body["from"] = json!(from);
                body["size"] = json!(size);
                body["track_total_hits"] = json!(true);
            }
            Fetch::Scroll { batch_size, .. } => {
                body["size"] = json!(batch_size);
            }
        }
        if let Some(h) = &self.histogram {
            body["aggs"] = json!({
                "hits_over_time": {
                    "date_histogram": {
                        "field": TIMESTAMP_FIELD,
                        "calendar_interval": h.interval.calendar_interval(),
                        "time_zone": h.tz.name(),
                        "min_doc_count": 0,
                        "extended_bounds": {
                            "min": h.min.timestamp_millis(),
                            "max": h.max.timestamp_millis(),
                        },
                    }
                }
            });
        }
        body
    }

    /// Shard-copy routing key for this search.
    ///
    /// Depends on the indices, filter and sort but not the window, so every
    /// page of one search lands on the same copies.
    pub fn preference(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.indices.hash(&mut hasher);
        self.query.to_json().to_string().hash(&mut hasher);
        self.sort.hash(&mut hasher);
        format!("ando-{:016x}", hasher.finish())
    }

    /// Scroll keep-alive, when the query scans.
    pub fn keep_alive(&self) -> Option<Duration> {
        match self.fetch {
            Fetch::Scroll { keep_alive, .. } => Some(keep_alive),
            Fetch::Window { .. } => None,
        }
    }
}

/// Compile a validated request into a backend query.
///
/// Fails only on time-range problems: an unknown timezone or `end_at`
/// before `start_at`.
pub fn translate(
    request: &SearchRequest,
    config: &IndexConfig,
) -> Result<SearchQuery, ValidationError> {
    let range = request.time_range.resolve()?;

    let mut must = vec![IndexQuery::range(
        TIMESTAMP_FIELD,
        Bounds {
            gte: Some(Scalar::Time(range.start)),
            lt: Some(Scalar::Time(range.end)),
            ..Bounds::default()
        },
    )];
    if let Some(text) = &request.free_text {
        must.push(IndexQuery::FullText {
            fields: fields::full_text_fields(),
            text: text.clone(),
        });
    }
    if let Some(filter) = &request.filter {
        match lower_group(filter) {
            IndexQuery::MatchAll => {}
            q => must.push(q),
        }
    }

    let fetch = match request.mode {
        Mode::Page { offset, length } => Fetch::Window {
            from: offset,
            size: length,
        },
        Mode::Export => Fetch::Scroll {
            batch_size: config.scroll_batch_size,
            keep_alive: Duration::from_secs(config.scroll_keep_alive_secs),
        },
    };

    let histogram = request.histogram.then(|| DateHistogram {
        interval: request.interval,
        tz: range.tz,
        min: range.start,
        max: range.end - ChronoDuration::milliseconds(1),
    });

    Ok(SearchQuery {
        indices: index_names(&config.index_prefix, &range),
        query: IndexQuery::must(must),
        sort: SortKey {
            field: request.sort.field.backend,
            descending: request.sort.descending,
        },
        fetch,
        histogram,
        range,
    })
}

/// Monthly index names (`<prefix>-YYYY-MM`, UTC months) overlapping the range.
pub fn index_names(prefix: &str, range: &ResolvedRange) -> Vec<String> {
    let last = range.end - ChronoDuration::milliseconds(1);
    let (mut year, mut month) = (range.start.year(), range.start.month());
    let mut names = Vec::new();
    while (year, month) <= (last.year(), last.month()) {
        names.push(format!("{prefix}-{year:04}-{month:02}"));
        (year, month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    }
    names
}

fn lower_group(group: &FilterGroup) -> IndexQuery {
    let children: Vec<IndexQuery> = group
        .children
        .iter()
        .map(|c| match c {
            FilterNode::Rule(r) => lower_rule(r),
            FilterNode::Group(g) => lower_group(g),
        })
        .collect();
    let inner = if children.is_empty() {
        IndexQuery::MatchAll
    } else {
        match group.condition {
            Condition::And => IndexQuery::must(children),
            Condition::Or => IndexQuery::should(children),
        }
    };
    if group.negated {
        IndexQuery::not(inner)
    } else {
        inner
    }
}

fn lower_rule(rule: &FilterRule) -> IndexQuery {
    let policy = rule.field;
    let field = policy.backend;
    let ci = policy.folds_case();
    let fold = |s: &Scalar| match s {
        Scalar::Text(t) if ci => Scalar::Text(t.to_lowercase()),
        other => other.clone(),
    };
    let fold_text = |s: &Scalar| match fold(s) {
        Scalar::Text(t) => t,
        other => scalar_json(&other).to_string(),
    };

    let one = || match &rule.value {
        FilterValue::One(v) => Some(v),
        _ => None,
    };

    let positive = match rule.operator {
        Operator::Equal | Operator::NotEqual => match one() {
            Some(v) => IndexQuery::Term {
                field,
                value: fold(v),
                case_insensitive: ci,
            },
            None => IndexQuery::MatchAll,
        },
        Operator::In | Operator::NotIn => match &rule.value {
            FilterValue::Many(values) => IndexQuery::Terms {
                field,
                values: values.iter().map(fold).collect(),
                case_insensitive: ci,
            },
            _ => IndexQuery::MatchAll,
        },
        Operator::BeginsWith | Operator::NotBeginsWith => match one() {
            Some(v) => IndexQuery::Prefix {
                field,
                value: fold_text(v),
                case_insensitive: ci,
            },
            None => IndexQuery::MatchAll,
        },
        Operator::Contains | Operator::NotContains => match one() {
            Some(v) => IndexQuery::Wildcard {
                field,
                pattern: format!("*{}*", escape_wildcard(&fold_text(v))),
                case_insensitive: ci,
            },
            None => IndexQuery::MatchAll,
        },
        Operator::EndsWith | Operator::NotEndsWith => match one() {
            Some(v) => IndexQuery::Wildcard {
                field,
                pattern: format!("*{}", escape_wildcard(&fold_text(v))),
                case_insensitive: ci,
            },
            None => IndexQuery::MatchAll,
        },
        Operator::Less => IndexQuery::range(
            field,
            Bounds {
                lt: one().cloned(),
                ..Bounds::default()
            },
        ),
        Operator::LessOrEqual => IndexQuery::range(
            field,
            Bounds {
                lte: one().cloned(),
                ..Bounds::default()
            },
        ),
        Operator::Greater => IndexQuery::range(
            field,
            Bounds {
                gt: one().cloned(),
                ..Bounds::default()
            },
        ),
        Operator::GreaterOrEqual => IndexQuery::range(
            field,
            Bounds {
                gte: one().cloned(),
                ..Bounds::default()
            },
        ),
        Operator::Between | Operator::NotBetween => match &rule.value {
            FilterValue::Range(lo, hi) => IndexQuery::range(
                field,
                Bounds {
                    gte: Some(lo.clone()),
                    lte: Some(hi.clone()),
                    ..Bounds::default()
                },
            ),
            _ => IndexQuery::MatchAll,
        },
        Operator::IsNull | Operator::IsNotNull => IndexQuery::Exists { field },
    };

    if rule.operator.is_negated() {
        IndexQuery::not(positive)
    } else {
        positive
    }
}

fn escape_wildcard(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
