//! Trigger condition grammar
//!
//! ```text
//! field contains "literal"   case-insensitive substring
//! field == value             true / false / integer / string
//! field > number             numeric comparison
//! field matches "regex"      case-insensitive regex search
//! field                      presence / truthiness
//! ```
//!
//! The operator is located by substring search in the order above and the
//! condition is split once at the first occurrence. An operand that itself
//! contains an earlier operator token therefore splits at the wrong place;
//! `a == "x contains y"` parses as a `contains` on field `a == "x`.

use regex::{Regex, RegexBuilder};
use serde_json::Value;
use tracing::warn;

use crate::observations::{is_truthy, value_text, ObservationView};

/// Right-hand side of an `==` condition
#[derive(Debug, Clone, PartialEq)]
pub enum Expected {
    Truthy,
    Falsy,
    Integer(i64),
    Text(String),
}

/// A compiled trigger condition
#[derive(Debug, Clone)]
pub enum Condition {
    Contains { path: String, needle: String },
    Equals { path: String, expected: Expected },
    GreaterThan { path: String, threshold: f64 },
    Matches { path: String, pattern: Regex },
    Present { path: String },
    /// Empty or malformed condition
    Never,
}

fn strip_quotes(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '"' || c == '\'')
}

fn split_once<'a>(raw: &'a str, op: &str) -> Option<(String, &'a str)> {
    raw.split_once(op).map(|(lhs, rhs)| (lhs.trim().to_string(), rhs.trim()))
}

impl Condition {
    /// Compile a condition string. Never fails: malformed input becomes [`Condition::Never`].
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Condition::Never;
        }

        if let Some((path, rhs)) = split_once(raw, " contains ") {
            return Condition::Contains {
                path,
                needle: strip_quotes(rhs).to_lowercase(),
            };
        }

        if let Some((path, rhs)) = split_once(raw, " == ") {
            let expected = match rhs.to_lowercase().as_str() {
                "true" => Expected::Truthy,
                "false" => Expected::Falsy,
                _ if !rhs.is_empty() && rhs.chars().all(|c| c.is_ascii_digit()) => match rhs.parse() {
                    Ok(n) => Expected::Integer(n),
                    Err(_) => Expected::Text(rhs.to_string()),
                },
                _ => Expected::Text(strip_quotes(rhs).to_string()),
            };
            return Condition::Equals { path, expected };
        }

        if let Some((path, rhs)) = split_once(raw, " > ") {
            return match rhs.parse::<f64>() {
                Ok(threshold) => Condition::GreaterThan { path, threshold },
                Err(_) => {
                    warn!("Condition '{}' has a non-numeric threshold; it will never match", raw);
                    Condition::Never
                }
            };
        }

        if let Some((path, rhs)) = split_once(raw, " matches ") {
            return match RegexBuilder::new(strip_quotes(rhs)).case_insensitive(true).build() {
                Ok(pattern) => Condition::Matches { path, pattern },
                Err(e) => {
                    warn!("Condition '{}' has an invalid regex ({}); it will never match", raw, e);
                    Condition::Never
                }
            };
        }

        Condition::Present { path: raw.to_string() }
    }

    /// Evaluate against one observation; unresolvable paths never match
    pub fn matches(&self, view: &ObservationView<'_>) -> bool {
        match self {
            Condition::Never => false,
            Condition::Present { path } => view.resolve(path).map(is_truthy).unwrap_or(false),
            Condition::Contains { path, needle } => match view.resolve(path) {
                Some(v) if is_truthy(v) => value_text(v).to_lowercase().contains(needle.as_str()),
                _ => false,
            },
            Condition::Matches { path, pattern } => match view.resolve(path) {
                Some(v) if is_truthy(v) => pattern.is_match(&value_text(v)),
                _ => false,
            },
            Condition::GreaterThan { path, threshold } => view
                .resolve(path)
                .and_then(as_number)
                .map(|n| n > *threshold)
                .unwrap_or(false),
            Condition::Equals { path, expected } => {
                let value = view.resolve(path);
                match expected {
                    Expected::Truthy => value.map(is_truthy).unwrap_or(false),
                    Expected::Falsy => !value.map(is_truthy).unwrap_or(false),
                    Expected::Integer(n) => match value {
                        Some(Value::Number(num)) => num.as_f64() == Some(*n as f64),
                        Some(Value::Bool(b)) => i64::from(*b) == *n,
                        _ => false,
                    },
                    Expected::Text(text) => value.map(|v| value_text(v) == *text).unwrap_or(false),
                }
            }
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
