//! Rule conditions
//!
//! A condition is a `(field, comparator, threshold)` triple. Conditions cross
//! the store boundary as a JSON object mapping each field to one or more
//! clauses, for example:
//!
//! ```json
//! {"temperature": "<18", "brightness": ">=60 & <80"}
//! ```
//!
//! Comparators form a closed set; anything else is rejected when the
//! condition is parsed, never at evaluation time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::payload::Scalar;

/// Separator between clauses that apply to the same field
const CLAUSE_SEPARATOR: char = '&';

/// Condition errors
#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("unknown comparator '{symbol}' in clause '{clause}'")]
    UnknownComparator { symbol: String, clause: String },

    #[error("clause '{clause}' for field '{field}' has no threshold")]
    MissingThreshold { field: String, clause: String },

    #[error("empty clause for field '{field}'")]
    EmptyClause { field: String },

    #[error("clauses for field '{field}' must be a string")]
    InvalidClause { field: String },

    #[error("conditions must be a JSON object")]
    NotAnObject,

    #[error("action payload must be a JSON object")]
    ActionNotObject,
}

/// Result type for condition parsing
pub type ConditionResult<T> = Result<T, ConditionError>;

/// Closed set of comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    /// Two-character symbols come first so that `<=` is never read as `<`
    const ALL: [Comparator; 6] = [
        Comparator::Le,
        Comparator::Ge,
        Comparator::Eq,
        Comparator::Ne,
        Comparator::Lt,
        Comparator::Gt,
    ];

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }

    /// Apply the comparator to two numbers
    pub fn compare_f64(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparator::Lt => lhs < rhs,
            Comparator::Le => lhs <= rhs,
            Comparator::Gt => lhs > rhs,
            Comparator::Ge => lhs >= rhs,
            Comparator::Eq => lhs == rhs,
            Comparator::Ne => lhs != rhs,
        }
    }

    /// Split a clause like `"<=18"` into its comparator and the remainder
    fn split_clause(clause: &str) -> ConditionResult<(Self, &str)> {
        for comparator in Self::ALL {
            if let Some(rest) = clause.strip_prefix(comparator.symbol()) {
                // "<>" or "=<" style typos must not parse as "<" followed by a threshold
                if !rest.starts_with(['<', '>', '=', '!']) {
                    return Ok((comparator, rest));
                }
            }
        }

        let symbol: String = clause
            .chars()
            .take_while(|c| matches!(c, '<' | '>' | '=' | '!'))
            .collect();
        Err(ConditionError::UnknownComparator {
            symbol,
            clause: clause.to_string(),
        })
    }
}

impl FromStr for Comparator {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.symbol() == s)
            .ok_or_else(|| ConditionError::UnknownComparator {
                symbol: s.to_string(),
                clause: s.to_string(),
            })
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A single `(field, comparator, threshold)` triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub comparator: Comparator,
    pub threshold: Scalar,
}

impl Condition {
    pub fn new(field: impl Into<String>, comparator: Comparator, threshold: impl Into<Scalar>) -> Self {
        Self {
            field: field.into(),
            comparator,
            threshold: threshold.into(),
        }
    }

    /// Parse one clause such as `"<18"` or `"== 'on'"` for `field`
    pub fn parse_clause(field: &str, clause: &str) -> ConditionResult<Self> {
        let clause = clause.trim();
        if clause.is_empty() {
            return Err(ConditionError::EmptyClause {
                field: field.to_string(),
            });
        }

        let (comparator, rest) = Comparator::split_clause(clause)?;
        let raw = rest.trim();
        if raw.is_empty() {
            return Err(ConditionError::MissingThreshold {
                field: field.to_string(),
                clause: clause.to_string(),
            });
        }

        Ok(Self::new(field, comparator, parse_threshold(raw)))
    }

    /// Render the clause part, e.g. `"<18"`
    pub fn clause(&self) -> String {
        format!("{}{}", self.comparator, render_threshold(&self.threshold))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.clause())
    }
}

fn parse_threshold(raw: &str) -> Scalar {
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Scalar::String(raw[1..raw.len() - 1].to_string());
        }
    }

    match raw {
        "true" => return Scalar::Bool(true),
        "false" => return Scalar::Bool(false),
        _ => {}
    }

    match raw.parse::<f64>() {
        Ok(n) if n.is_finite() => Scalar::Number(n),
        _ => Scalar::String(raw.to_string()),
    }
}

fn render_threshold(threshold: &Scalar) -> String {
    match threshold {
        // Quote strings that would otherwise read back differently
        Scalar::String(s) => {
            let plain = !s.is_empty()
                && s.trim() == s
                && !s.contains(CLAUSE_SEPARATOR)
                && !s.starts_with(['<', '>', '=', '!', '"', '\''])
                && matches!(parse_threshold(s), Scalar::String(_));
            if plain {
                s.clone()
            } else if s.contains('"') {
                format!("'{}'", s)
            } else {
                format!("\"{}\"", s)
            }
        }
        other => other.to_string(),
    }
}

/// Split `"<a & ==\"R&B\""` into clauses, ignoring separators inside a quoted threshold
fn split_clauses(clauses: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, c) in clauses.char_indices() {
        if c == CLAUSE_SEPARATOR && threshold_closed(&clauses[start..i]) {
            parts.push(&clauses[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&clauses[start..]);
    parts
}

fn threshold_closed(clause: &str) -> bool {
    let threshold = clause
        .trim_start()
        .trim_start_matches(['<', '>', '=', '!'])
        .trim();
    match threshold.chars().next() {
        Some(quote @ ('"' | '\'')) => threshold.len() >= 2 && threshold.ends_with(quote),
        _ => true,
    }
}

/// Ordered AND-list of conditions
///
/// Conditions on the same field are kept adjacent (in first-appearance order)
/// so the list survives the field-keyed wire format unchanged. AND is
/// commutative, so the grouping never changes the outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new(conditions: Vec<Condition>) -> Self {
        let mut fields: Vec<String> = Vec::new();
        for condition in &conditions {
            if !fields.contains(&condition.field) {
                fields.push(condition.field.clone());
            }
        }

        let mut grouped = Vec::with_capacity(conditions.len());
        for field in &fields {
            grouped.extend(conditions.iter().filter(|c| &c.field == field).cloned());
        }
        Self(grouped)
    }

    /// Parse the field-keyed wire format
    pub fn from_json(value: &serde_json::Value) -> ConditionResult<Self> {
        let object = value.as_object().ok_or(ConditionError::NotAnObject)?;

        let mut conditions = Vec::new();
        for (field, clauses) in object {
            let clauses = clauses.as_str().ok_or_else(|| ConditionError::InvalidClause {
                field: field.clone(),
            })?;
            for clause in split_clauses(clauses) {
                conditions.push(Condition::parse_clause(field, clause)?);
            }
        }

        Ok(Self::new(conditions))
    }

    /// Render the field-keyed wire format
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        for condition in &self.0 {
            let clause = condition.clause();
            match object.get_mut(&condition.field) {
                Some(serde_json::Value::String(existing)) => {
                    existing.push_str(" & ");
                    existing.push_str(&clause);
                }
                _ => {
                    object.insert(condition.field.clone(), serde_json::Value::String(clause));
                }
            }
        }
        serde_json::Value::Object(object)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Condition> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Condition] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Condition>> for Conditions {
    fn from(conditions: Vec<Condition>) -> Self {
        Self::new(conditions)
    }
}

impl TryFrom<serde_json::Value> for Conditions {
    type Error = ConditionError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        Self::from_json(&value)
    }
}

impl From<Conditions> for serde_json::Value {
    fn from(conditions: Conditions) -> Self {
        conditions.to_json()
    }
}

impl<'a> IntoIterator for &'a Conditions {
    type Item = &'a Condition;
    type IntoIter = std::slice::Iter<'a, Condition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
