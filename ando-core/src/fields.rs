//! Static table of queryable log fields.
//!
//! Every field a filter, sort or export column may name is described here
//! once: its value type, which operators apply, whether comparisons fold
//! case, and the label it carries in CSV exports. The table is built on
//! first use and never mutated afterwards, so concurrent readers need no
//! synchronization.

use crate::error::ValidationError;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Value type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Timestamp,
    Enum(&'static [&'static str]),
}

impl FieldType {
    /// Operators legal for this type, excluding the null tests.
    pub fn operators(&self) -> &'static [Operator] {
        match self {
            FieldType::String => STRING_OPERATORS,
            FieldType::Number => NUMBER_OPERATORS,
            FieldType::Timestamp => TIMESTAMP_OPERATORS,
            FieldType::Enum(_) => ENUM_OPERATORS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Timestamp => "timestamp",
            FieldType::Enum(_) => "enum",
        }
    }
}

/// How string comparisons treat letter case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseRule {
    /// Fold case on both the stored value and the comparison value.
    Insensitive,
    /// Compare verbatim.
    Sensitive,
}

/// Comparison operators understood by the filter builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equal,
    NotEqual,
    In,
    NotIn,
    BeginsWith,
    NotBeginsWith,
    Contains,
    NotContains,
    EndsWith,
    NotEndsWith,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Between,
    NotBetween,
    IsNull,
    IsNotNull,
}

const STRING_OPERATORS: &[Operator] = &[
    Operator::Equal,
    Operator::NotEqual,
    Operator::In,
    Operator::NotIn,
    Operator::BeginsWith,
    Operator::NotBeginsWith,
    Operator::Contains,
    Operator::NotContains,
    Operator::EndsWith,
    Operator::NotEndsWith,
];

const NUMBER_OPERATORS: &[Operator] = &[
    Operator::Equal,
    Operator::NotEqual,
    Operator::In,
    Operator::NotIn,
    Operator::Less,
    Operator::LessOrEqual,
    Operator::Greater,
    Operator::GreaterOrEqual,
    Operator::Between,
    Operator::NotBetween,
];

const TIMESTAMP_OPERATORS: &[Operator] = &[
    Operator::Less,
    Operator::LessOrEqual,
    Operator::Greater,
    Operator::GreaterOrEqual,
    Operator::Between,
    Operator::NotBetween,
];

const ENUM_OPERATORS: &[Operator] = &[
    Operator::Equal,
    Operator::NotEqual,
    Operator::In,
    Operator::NotIn,
];

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "equal",
            Operator::NotEqual => "not_equal",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::BeginsWith => "begins_with",
            Operator::NotBeginsWith => "not_begins_with",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::EndsWith => "ends_with",
            Operator::NotEndsWith => "not_ends_with",
            Operator::Less => "less",
            Operator::LessOrEqual => "less_or_equal",
            Operator::Greater => "greater",
            Operator::GreaterOrEqual => "greater_or_equal",
            Operator::Between => "between",
            Operator::NotBetween => "not_between",
            Operator::IsNull => "is_null",
            Operator::IsNotNull => "is_not_null",
        }
    }

    /// Null tests ignore whatever value the caller supplied.
    pub fn is_null_test(&self) -> bool {
        matches!(self, Operator::IsNull | Operator::IsNotNull)
    }

    /// Negated operators lower to `must_not` around their positive form.
    pub fn is_negated(&self) -> bool {
        matches!(
            self,
            Operator::NotEqual
                | Operator::NotIn
                | Operator::NotBeginsWith
                | Operator::NotContains
                | Operator::NotEndsWith
                | Operator::NotBetween
                | Operator::IsNull
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "equal" | "equals" => Operator::Equal,
            "not_equal" | "not_equals" => Operator::NotEqual,
            "in" => Operator::In,
            "not_in" => Operator::NotIn,
            "begins_with" => Operator::BeginsWith,
            "not_begins_with" => Operator::NotBeginsWith,
            "contains" => Operator::Contains,
            "not_contains" => Operator::NotContains,
            "ends_with" => Operator::EndsWith,
            "not_ends_with" => Operator::NotEndsWith,
            "less" => Operator::Less,
            "less_or_equal" => Operator::LessOrEqual,
            "greater" => Operator::Greater,
            "greater_or_equal" => Operator::GreaterOrEqual,
            "between" => Operator::Between,
            "not_between" => Operator::NotBetween,
            "is_null" => Operator::IsNull,
            "is_not_null" => Operator::IsNotNull,
            _ => return Err(()),
        })
    }
}

/// Everything the parser and translator need to know about one field.
#[derive(Debug, PartialEq, Eq)]
pub struct FieldPolicy {
    /// Identifier used in filter expressions and sort parameters.
    pub id: &'static str,
    /// Field name in the backing index.
    pub backend: &'static str,
    pub kind: FieldType,
    pub case: CaseRule,
    /// Whether records may lack a value (enables `is_null` / `is_not_null`).
    pub optional: bool,
    /// Scanned by the free-text `search` term.
    pub full_text: bool,
    pub sortable: bool,
    /// Display name used as the CSV column header.
    pub label: &'static str,
}

impl FieldPolicy {
    /// Allowed operator set for this field.
    pub fn operators(&self) -> Vec<Operator> {
        let mut ops = self.kind.operators().to_vec();
        if self.optional {
            ops.extend([Operator::IsNull, Operator::IsNotNull]);
        }
        ops
    }

    pub fn allows(&self, op: Operator) -> bool {
        if op.is_null_test() {
            self.optional
        } else {
            self.kind.operators().contains(&op)
        }
    }

    pub fn folds_case(&self) -> bool {
        self.case == CaseRule::Insensitive && matches!(self.kind, FieldType::String)
    }
}

pub const HTTP_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "PATCH", "OPTIONS", "TRACE", "CONNECT",
];

pub const SCHEMES: &[&str] = &["http", "https"];

pub const DENIED_CODES: &[&str] = &[
    "api_key_missing",
    "api_key_invalid",
    "api_key_disabled",
    "api_key_unauthorized",
    "over_rate_limit",
    "https_required",
    "internal_server_error",
    "not_found",
];

const fn field(
    id: &'static str,
    kind: FieldType,
    optional: bool,
    full_text: bool,
    label: &'static str,
) -> FieldPolicy {
    FieldPolicy {
        id,
        backend: id,
        kind,
        case: CaseRule::Insensitive,
        optional,
        full_text,
        sortable: true,
        label,
    }
}

pub static FIELDS: &[FieldPolicy] = &[
    field("request_at", FieldType::Timestamp, false, false, "Time"),
    field("request_method", FieldType::Enum(HTTP_METHODS), false, false, "Method"),
    field("request_scheme", FieldType::Enum(SCHEMES), true, false, "Scheme"),
    field("request_host", FieldType::String, true, true, "Host"),
    field("request_path", FieldType::String, true, true, "Path"),
    field("request_url", FieldType::String, true, true, "URL"),
    field("user_email", FieldType::String, true, true, "User"),
    field("request_ip", FieldType::String, true, true, "IP Address"),
    field("request_ip_country", FieldType::String, true, true, "Country"),
    field("request_ip_region", FieldType::String, true, true, "State"),
    field("request_ip_city", FieldType::String, true, true, "City"),
    field("response_status", FieldType::Number, true, false, "Status"),
    field("gatekeeper_denied_code", FieldType::Enum(DENIED_CODES), true, false, "Reason Denied"),
    field("response_time", FieldType::Number, true, false, "Response Time"),
    field("response_content_type", FieldType::String, true, true, "Content Type"),
    field("request_accept_encoding", FieldType::String, true, false, "Accept Encoding"),
    field("request_user_agent", FieldType::String, true, true, "User Agent"),
    field("request_referer", FieldType::String, true, true, "Referer"),
    // API keys are secrets: exact-case matching only, never scanned by free text.
    FieldPolicy {
        id: "api_key",
        backend: "api_key",
        kind: FieldType::String,
        case: CaseRule::Sensitive,
        optional: true,
        full_text: false,
        sortable: false,
        label: "API Key",
    },
];

static BY_ID: LazyLock<HashMap<&'static str, &'static FieldPolicy>> =
    LazyLock::new(|| FIELDS.iter().map(|f| (f.id, f)).collect());

/// Look up a field by id.
pub fn lookup(id: &str) -> Result<&'static FieldPolicy, ValidationError> {
    BY_ID
        .get(id)
        .copied()
        .ok_or_else(|| ValidationError::UnknownField(id.to_string()))
}

/// Backend names of the fields the free-text term scans.
pub fn full_text_fields() -> Vec<&'static str> {
    FIELDS.iter().filter(|f| f.full_text).map(|f| f.backend).collect()
}

/// Column order of the CSV export.
pub const CSV_COLUMNS: &[&str] = &[
    "request_at",
    "request_method",
    "request_host",
    "request_url",
    "user_email",
    "request_ip",
    "request_ip_country",
    "request_ip_region",
    "request_ip_city",
    "response_status",
    "gatekeeper_denied_code",
    "response_time",
    "response_content_type",
    "request_accept_encoding",
    "request_user_agent",
];

/// Policies of the CSV columns, in column order.
pub fn csv_columns() -> Vec<&'static FieldPolicy> {
    CSV_COLUMNS.iter().filter_map(|id| BY_ID.get(id).copied()).collect()
}
