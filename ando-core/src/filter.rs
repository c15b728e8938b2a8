//! Filter expressions: wire parsing and the validated tree.
//!
//! The `query` parameter carries a QueryBuilder-style JSON document:
//!
//! ```json
//! {"condition": "AND", "rules": [
//!     {"id": "request_user_agent", "field": "request_user_agent", "type": "string",
//!      "input": "text", "operator": "begins_with", "value": "Mozilla"},
//!     {"condition": "OR", "rules": [ ... ]}
//! ]}
//! ```
//!
//! [`parse_filter`] turns that untrusted input into a [`FilterGroup`] whose
//! every rule names a registered field, an operator the field allows, and a
//! value of the field's type. Nothing downstream re-checks these properties.

use crate::error::ValidationError;
use crate::fields::{self, FieldPolicy, FieldType, Operator};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Boolean combinator of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    And,
    Or,
}

/// A single typed comparison operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    Number(f64),
    Time(DateTime<Utc>),
}

/// Operand of a rule, shaped by its operator.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    /// Null tests carry no operand.
    None,
    One(Scalar),
    Many(Vec<Scalar>),
    Range(Scalar, Scalar),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterRule {
    pub field: &'static FieldPolicy,
    pub operator: Operator,
    pub value: FilterValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Rule(FilterRule),
    Group(FilterGroup),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterGroup {
    pub condition: Condition,
    /// QueryBuilder's `"not": true` inverts the whole group.
    pub negated: bool,
    pub children: Vec<FilterNode>,
}

impl FilterGroup {
    pub fn and(children: Vec<FilterNode>) -> Self {
        Self {
            condition: Condition::And,
            negated: false,
            children,
        }
    }

    /// Number of rules in the tree, at any depth.
    pub fn rule_count(&self) -> usize {
        self.children
            .iter()
            .map(|c| match c {
                FilterNode::Rule(_) => 1,
                FilterNode::Group(g) => g.rule_count(),
            })
            .sum()
    }
}

/// Parse an optional raw filter expression.
///
/// An absent or blank expression means "match all" and yields `None`.
pub fn parse_filter(raw: Option<&str>) -> Result<Option<FilterGroup>, ValidationError> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(r) => r,
    };
    // serde_json's own messages quote offending input; report position only.
    let value: Value = serde_json::from_str(raw).map_err(|e| {
        ValidationError::MalformedFilter(format!(
            "invalid JSON at line {} column {}",
            e.line(),
            e.column()
        ))
    })?;
    parse_filter_value(&value).map(Some)
}

/// Parse an already-decoded filter document.
pub fn parse_filter_value(value: &Value) -> Result<FilterGroup, ValidationError> {
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("filter must be a JSON object"))?;
    parse_group(obj)
}

fn parse_group(obj: &Map<String, Value>) -> Result<FilterGroup, ValidationError> {
    let condition = match obj.get("condition") {
        None | Some(Value::Null) => Condition::And,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("and") => Condition::And,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("or") => Condition::Or,
        Some(_) => return Err(malformed("condition must be AND or OR")),
    };
    let negated = match obj.get("not") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(malformed("not must be a boolean")),
    };
    let rules = match obj.get("rules") {
        None | Some(Value::Null) => &[][..],
        Some(Value::Array(items)) => items.as_slice(),
        Some(_) => return Err(malformed("rules must be an array")),
    };

    let children = rules
        .iter()
        .map(parse_node)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FilterGroup {
        condition,
        negated,
        children,
    })
}

fn parse_node(value: &Value) -> Result<FilterNode, ValidationError> {
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("each rule must be a JSON object"))?;
    if obj.contains_key("rules") || obj.contains_key("condition") {
        parse_group(obj).map(FilterNode::Group)
    } else if obj.contains_key("operator") {
        parse_rule(obj).map(FilterNode::Rule)
    } else {
        Err(malformed("rule is neither a group nor a comparison"))
    }
}

fn parse_rule(obj: &Map<String, Value>) -> Result<FilterRule, ValidationError> {
    let id = obj.get("id").and_then(Value::as_str);
    let field_name = obj.get("field").and_then(Value::as_str);
    let field_id = match (id, field_name) {
        (Some(a), Some(b)) if a != b => {
            return Err(malformed("rule id and field name disagree"));
        }
        (Some(a), _) => a,
        (None, Some(b)) => b,
        (None, None) => return Err(malformed("rule is missing its field id")),
    };
    let field = fields::lookup(field_id)?;

    let op_name = obj
        .get("operator")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("operator must be a string"))?;
    let operator: Operator = op_name
        .parse()
        .map_err(|_| unsupported(field, op_name))?;
    if !field.allows(operator) {
        return Err(unsupported(field, op_name));
    }

    let raw_value = obj.get("value").unwrap_or(&Value::Null);
    let value = parse_operand(field, operator, raw_value)?;

    Ok(FilterRule {
        field,
        operator,
        value,
    })
}

fn parse_operand(
    field: &'static FieldPolicy,
    op: Operator,
    raw: &Value,
) -> Result<FilterValue, ValidationError> {
    match op {
        Operator::IsNull | Operator::IsNotNull => Ok(FilterValue::None),
        Operator::In | Operator::NotIn => {
            let items = match raw {
                Value::Array(items) => items.as_slice(),
                other => std::slice::from_ref(other),
            };
            if items.is_empty() {
                return Err(invalid(field, op, "expected at least one value"));
            }
            items
                .iter()
                .map(|v| parse_scalar(field, op, v))
                .collect::<Result<Vec<_>, _>>()
                .map(FilterValue::Many)
        }
        Operator::Between | Operator::NotBetween => match raw {
            Value::Array(items) if items.len() == 2 => Ok(FilterValue::Range(
                parse_scalar(field, op, &items[0])?,
                parse_scalar(field, op, &items[1])?,
            )),
            _ => Err(invalid(field, op, "expected a pair of bounds")),
        },
        _ => parse_scalar(field, op, raw).map(FilterValue::One),
    }
}

fn parse_scalar(
    field: &'static FieldPolicy,
    op: Operator,
    raw: &Value,
) -> Result<Scalar, ValidationError> {
    match field.kind {
        FieldType::String => match raw {
            Value::String(s) => Ok(Scalar::Text(s.clone())),
            Value::Number(n) => Ok(Scalar::Text(n.to_string())),
            _ => Err(invalid(field, op, "expected a string")),
        },
        FieldType::Enum(members) => {
            let s = raw
                .as_str()
                .ok_or_else(|| invalid(field, op, "expected a string"))?;
            members
                .iter()
                .find(|m| m.eq_ignore_ascii_case(s))
                .map(|m| Scalar::Text((*m).to_string()))
                .ok_or_else(|| invalid(field, op, "not one of the allowed values"))
        }
        FieldType::Number => {
            let n = match raw {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            match n {
                Some(n) if n.is_finite() => Ok(Scalar::Number(n)),
                _ => Err(invalid(field, op, "expected a number")),
            }
        }
        FieldType::Timestamp => {
            let t = match raw {
                Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
                    .ok()
                    .map(|t| t.with_timezone(&Utc)),
                Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
                _ => None,
            };
            t.map(Scalar::Time)
                .ok_or_else(|| invalid(field, op, "expected an RFC 3339 timestamp or epoch milliseconds"))
        }
    }
}

fn malformed(reason: &str) -> ValidationError {
    ValidationError::MalformedFilter(reason.to_string())
}

fn unsupported(field: &FieldPolicy, op: &str) -> ValidationError {
    ValidationError::UnsupportedOperator {
        field: field.id.to_string(),
        operator: op.to_string(),
    }
}

fn invalid(field: &FieldPolicy, op: Operator, reason: &'static str) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.id.to_string(),
        operator: op.as_str().to_string(),
        reason,
    }
}
