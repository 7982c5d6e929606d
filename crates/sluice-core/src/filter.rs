//! Predicates over a single batch identifier.
//!
//! A request can select partitions by exact identifier value or by a
//! predicate such as `{"op": "between", "value": ["2020-01", "2020-03"]}`.
//! Predicates are evaluated against a connector's inventory in memory.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::batch::IdentifierValue;
use crate::error::{BatchError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub op: FilterOp,
    pub value: FilterValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
    In,
    Like,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    String(String),
    Number(f64),
    Range([String; 2]),
    StringArray(Vec<String>),
}

impl FilterCondition {
    pub fn new(op: FilterOp, value: FilterValue) -> Self {
        Self { op, value }
    }

    /// Reject operator/value shapes that can never match, e.g. `between`
    /// with a scalar.
    pub fn validate(&self, key: &str) -> Result<()> {
        let ok = match (&self.op, &self.value) {
            (FilterOp::Between, FilterValue::Range(_)) => true,
            (FilterOp::Between, _) => false,
            // A two-element list deserializes as a range.
            (FilterOp::In, FilterValue::StringArray(_) | FilterValue::Range(_)) => true,
            (FilterOp::In, _) => false,
            (FilterOp::Like, FilterValue::String(_)) => true,
            (FilterOp::Like, _) => false,
            (_, FilterValue::String(_) | FilterValue::Number(_)) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(BatchError::InvalidBatchKwargs(format!(
                "identifier '{}' has a '{:?}' predicate with an incompatible value {:?}",
                key, self.op, self.value
            )))
        }
    }

    /// Evaluate the predicate against one identifier value. `Null` only
    /// matches `neq`.
    pub fn matches(&self, candidate: &IdentifierValue) -> bool {
        if matches!(candidate, IdentifierValue::Null) {
            return self.op == FilterOp::Neq;
        }
        match (&self.op, &self.value) {
            (FilterOp::Eq, v) => scalar(v).is_some_and(|s| compare(candidate, &s) == Ordering::Equal),
            (FilterOp::Neq, v) => scalar(v).is_some_and(|s| compare(candidate, &s) != Ordering::Equal),
            (FilterOp::Gt, v) => scalar(v).is_some_and(|s| compare(candidate, &s) == Ordering::Greater),
            (FilterOp::Gte, v) => scalar(v).is_some_and(|s| compare(candidate, &s) != Ordering::Less),
            (FilterOp::Lt, v) => scalar(v).is_some_and(|s| compare(candidate, &s) == Ordering::Less),
            (FilterOp::Lte, v) => scalar(v).is_some_and(|s| compare(candidate, &s) != Ordering::Greater),
            (FilterOp::Between, FilterValue::Range([from, to])) => {
                compare(candidate, &Scalar::Text(from)) != Ordering::Less
                    && compare(candidate, &Scalar::Text(to)) != Ordering::Greater
            }
            (FilterOp::In, FilterValue::StringArray(values)) => values
                .iter()
                .any(|v| compare(candidate, &Scalar::Text(v)) == Ordering::Equal),
            (FilterOp::In, FilterValue::Range(values)) => values
                .iter()
                .any(|v| compare(candidate, &Scalar::Text(v)) == Ordering::Equal),
            (FilterOp::Like, FilterValue::String(pattern)) => {
                like(&candidate.to_string(), pattern)
            }
            _ => false,
        }
    }
}

enum Scalar<'a> {
    Text(&'a str),
    Number(f64),
}

fn scalar(value: &FilterValue) -> Option<Scalar<'_>> {
    match value {
        FilterValue::String(s) => Some(Scalar::Text(s)),
        FilterValue::Number(n) => Some(Scalar::Number(*n)),
        _ => None,
    }
}

/// Numeric comparison when both sides are numeric, text comparison otherwise.
fn compare(candidate: &IdentifierValue, other: &Scalar<'_>) -> Ordering {
    let candidate_number = match candidate {
        IdentifierValue::Int(i) => Some(*i as f64),
        IdentifierValue::Str(s) => s.parse::<f64>().ok(),
        _ => None,
    };
    let other_number = match other {
        Scalar::Number(n) => Some(*n),
        Scalar::Text(s) => s.parse::<f64>().ok(),
    };
    if let (Some(a), Some(b)) = (candidate_number, other_number) {
        return a.partial_cmp(&b).unwrap_or(Ordering::Equal);
    }
    let other_text = match other {
        Scalar::Number(n) => format_number(*n),
        Scalar::Text(s) => s.to_string(),
    };
    candidate.to_string().cmp(&other_text)
}

fn format_number(n: f64) -> String {
    if n == n.floor() {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// SQL `LIKE` semantics: `%` matches any run, `_` matches one character.
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    like_from(&text, &pattern)
}

fn like_from(text: &[char], pattern: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((&'%', rest)) => (0..=text.len()).any(|skip| like_from(&text[skip..], rest)),
        Some((&'_', rest)) => !text.is_empty() && like_from(&text[1..], rest),
        Some((c, rest)) => text.first() == Some(c) && like_from(&text[1..], rest),
    }
}
