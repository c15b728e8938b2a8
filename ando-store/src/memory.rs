use crate::index::{Bucket, LogIndex, ScrollBatch, ScrollCursor, SearchPage, StoreError};
use crate::query::{Bounds, DateHistogram, Fetch, IndexQuery, SearchQuery};
use ando_core::filter::Scalar;
use ando_core::record::LogRecord;
use ando_core::request::MAX_HISTOGRAM_BUCKETS;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Log index held in process memory.
///
/// Evaluates translated queries directly against stored records with the
/// same matching rules the Elasticsearch backend applies. Used for local
/// runs and as the index behind the engine's tests.
pub struct MemoryIndex {
    records: ArcSwap<Vec<LogRecord>>,
    scrolls: DashMap<String, ScrollState>,
}

struct ScrollState {
    hits: Arc<Vec<LogRecord>>,
    position: usize,
    batch_size: usize,
    expires_at: Instant,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            records: ArcSwap::from_pointee(Vec::new()),
            scrolls: DashMap::new(),
        }
    }

    pub fn with_records(records: Vec<LogRecord>) -> Self {
        Self {
            records: ArcSwap::from_pointee(records),
            scrolls: DashMap::new(),
        }
    }

    pub fn insert(&self, record: LogRecord) {
        self.extend(std::iter::once(record));
    }

    pub fn extend(&self, records: impl IntoIterator<Item = LogRecord>) {
        let added: Vec<LogRecord> = records.into_iter().collect();
        self.records.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + added.len());
            next.extend(current.iter().cloned());
            next.extend(added.iter().cloned());
            next
        });
    }

    pub fn len(&self) -> usize {
        self.records.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of scroll cursors not yet cleared or reaped.
    pub fn open_scrolls(&self) -> usize {
        self.scrolls.len()
    }

    /// Matching records in query sort order. Ties keep insertion order,
    /// matching the `_doc` tiebreak sent to Elasticsearch.
    fn hits(&self, query: &SearchQuery) -> Vec<LogRecord> {
        let records = self.records.load();
        let mut hits: Vec<(usize, &LogRecord)> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| matches(&query.query, r))
            .collect();
        let field = query.sort.field;
        hits.sort_unstable_by(|(ia, a), (ib, b)| {
            let primary = match (a.field(field), b.field(field)) {
                (Some(x), Some(y)) => {
                    let ord = compare(&x, &y).unwrap_or(Ordering::Equal);
                    if query.sort.descending { ord.reverse() } else { ord }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            primary.then(ia.cmp(ib))
        });
        hits.into_iter().map(|(_, r)| r.clone()).collect()
    }

    fn reap_expired(&self) {
        let now = Instant::now();
        self.scrolls.retain(|_, s| s.expires_at > now);
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogIndex for MemoryIndex {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, StoreError> {
        let hits = self.hits(query);
        let (from, size) = match query.fetch {
            Fetch::Window { from, size } => (from as usize, size as usize),
            Fetch::Scroll { batch_size, .. } => (0, batch_size as usize),
        };
        let buckets = query
            .histogram
            .as_ref()
            .map(|h| histogram(h, &hits))
            .transpose()?
            .unwrap_or_default();
        Ok(SearchPage {
            total: hits.len() as u64,
            records: hits.iter().skip(from).take(size).cloned().collect(),
            buckets,
        })
    }

    async fn open_scroll(&self, query: &SearchQuery) -> Result<ScrollBatch, StoreError> {
        let Fetch::Scroll {
            batch_size,
            keep_alive,
        } = query.fetch
        else {
            return Err(StoreError::Rejected {
                status: 400,
                reason: "scroll requested without a batch size".into(),
            });
        };
        self.reap_expired();

        let hits = Arc::new(self.hits(query));
        let batch_size = batch_size.max(1) as usize;
        let first: Vec<LogRecord> = hits.iter().take(batch_size).cloned().collect();
        let id = uuid::Uuid::new_v4().to_string();
        debug!(total = hits.len(), batch_size, "memory scroll opened");
        self.scrolls.insert(
            id.clone(),
            ScrollState {
                position: first.len(),
                hits,
                batch_size,
                expires_at: Instant::now() + keep_alive,
            },
        );
        Ok(ScrollBatch {
            records: first,
            cursor: ScrollCursor::new(id),
        })
    }

    async fn scroll(
        &self,
        cursor: &ScrollCursor,
        keep_alive: Duration,
    ) -> Result<ScrollBatch, StoreError> {
        let now = Instant::now();
        let mut state = self
            .scrolls
            .get_mut(cursor.as_str())
            .ok_or(StoreError::ScrollExpired)?;
        if state.expires_at <= now {
            drop(state);
            self.scrolls.remove(cursor.as_str());
            return Err(StoreError::ScrollExpired);
        }
        let end = (state.position + state.batch_size).min(state.hits.len());
        let records = state.hits[state.position..end].to_vec();
        state.position = end;
        state.expires_at = now + keep_alive;
        Ok(ScrollBatch {
            records,
            cursor: cursor.clone(),
        })
    }

    async fn clear_scroll(&self, cursor: &ScrollCursor) -> Result<(), StoreError> {
        self.scrolls.remove(cursor.as_str());
        Ok(())
    }
}

/// Parse newline-delimited JSON records; blank lines are skipped.
///
/// Errors name the line only. Seed files hold real request logs, so the
/// offending text is never echoed.
pub fn parse_json_lines(text: &str) -> Result<Vec<LogRecord>, StoreError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<LogRecord>(line).map_err(|e| {
                StoreError::Decode(format!("line {}: column {}", n + 1, e.column()))
            })
        })
        .collect()
}

// ── Query evaluation ──────────────────────────────────────────

fn matches(query: &IndexQuery, record: &LogRecord) -> bool {
    match query {
        IndexQuery::MatchAll => true,
        IndexQuery::Bool {
            must,
            should,
            must_not,
        } => {
            must.iter().all(|q| matches(q, record))
                && (should.is_empty() || should.iter().any(|q| matches(q, record)))
                && !must_not.iter().any(|q| matches(q, record))
        }
        IndexQuery::Term {
            field,
            value,
            case_insensitive,
        } => record
            .field(field)
            .is_some_and(|v| equals(&v, value, *case_insensitive)),
        IndexQuery::Terms {
            field,
            values,
            case_insensitive,
        } => record
            .field(field)
            .is_some_and(|v| values.iter().any(|x| equals(&v, x, *case_insensitive))),
        IndexQuery::Prefix {
            field,
            value,
            case_insensitive,
        } => text(record, field, *case_insensitive)
            .is_some_and(|t| t.starts_with(&fold(value, *case_insensitive))),
        IndexQuery::Wildcard {
            field,
            pattern,
            case_insensitive,
        } => text(record, field, *case_insensitive).is_some_and(|t| {
            let pattern: Vec<char> = fold(pattern, *case_insensitive).chars().collect();
            let t: Vec<char> = t.chars().collect();
            glob(&pattern, &t)
        }),
        IndexQuery::Range { field, bounds } => record
            .field(field)
            .is_some_and(|v| within(&v, bounds)),
        IndexQuery::Exists { field } => record.field(field).is_some(),
        IndexQuery::FullText { fields, text: terms } => {
            let haystacks: Vec<String> = fields
                .iter()
                .filter_map(|f| text(record, f, true))
                .collect();
            terms.split_whitespace().all(|term| {
                let term = term.to_lowercase();
                haystacks.iter().any(|h| h.contains(&term))
            })
        }
    }
}

fn fold(s: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        s.to_lowercase()
    } else {
        s.to_string()
    }
}

fn text(record: &LogRecord, field: &str, case_insensitive: bool) -> Option<String> {
    match record.field(field)? {
        Scalar::Text(t) => Some(fold(&t, case_insensitive)),
        Scalar::Number(n) => Some(n.to_string()),
        Scalar::Time(t) => Some(t.to_rfc3339()),
    }
}

fn equals(stored: &Scalar, wanted: &Scalar, case_insensitive: bool) -> bool {
    match (stored, wanted) {
        (Scalar::Text(a), Scalar::Text(b)) if case_insensitive => a.to_lowercase() == b.to_lowercase(),
        _ => compare(stored, wanted) == Some(Ordering::Equal),
    }
}

fn compare(a: &Scalar, b: &Scalar) -> Option<Ordering> {
    match (a, b) {
        (Scalar::Text(x), Scalar::Text(y)) => Some(x.cmp(y)),
        (Scalar::Number(x), Scalar::Number(y)) => x.partial_cmp(y),
        (Scalar::Time(x), Scalar::Time(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn within(v: &Scalar, bounds: &Bounds) -> bool {
    let holds = |bound: &Option<Scalar>, ok: fn(Ordering) -> bool| {
        bound
            .as_ref()
            .is_none_or(|b| compare(v, b).is_some_and(ok))
    };
    holds(&bounds.gte, |o| o != Ordering::Less)
        && holds(&bounds.gt, |o| o == Ordering::Greater)
        && holds(&bounds.lte, |o| o != Ordering::Greater)
        && holds(&bounds.lt, |o| o == Ordering::Less)
}

/// Wildcard match: `*` any run, `?` one char, `\` escapes the next char.
fn glob(pattern: &[char], text: &[char]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
                continue;
            }
            Some('?') => {
                p += 1;
                t += 1;
                continue;
            }
            Some('\\') if pattern.get(p + 1) == Some(&text[t]) => {
                p += 2;
                t += 1;
                continue;
            }
            Some(c) if *c != '\\' && *c == text[t] => {
                p += 1;
                t += 1;
                continue;
            }
            _ => {}
        }
        match backtrack {
            Some((star, matched)) => {
                p = star + 1;
                t = matched + 1;
                backtrack = Some((star, matched + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

/// Buckets from `min` through `max`, empty ones included. Refuses more
/// than [`MAX_HISTOGRAM_BUCKETS`], as Elasticsearch does with `max_buckets`.
fn histogram(h: &DateHistogram, hits: &[LogRecord]) -> Result<Vec<Bucket>, StoreError> {
    let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
    for r in hits {
        let key = h.interval.bucket_start(r.request_at, h.tz);
        *counts.entry(key.timestamp_millis()).or_default() += 1;
    }
    let mut buckets = Vec::new();
    let mut key = h.interval.bucket_start(h.min, h.tz);
    while key <= h.max {
        if buckets.len() as u64 >= MAX_HISTOGRAM_BUCKETS {
            return Err(StoreError::Rejected {
                status: 400,
                reason: "too_many_buckets_exception".into(),
            });
        }
        buckets.push(Bucket {
            key,
            doc_count: counts.get(&key.timestamp_millis()).copied().unwrap_or(0),
        });
        let next = h.interval.next_bucket(key, h.tz);
        if next <= key {
            break;
        }
        key = next;
    }
    Ok(buckets)
}
