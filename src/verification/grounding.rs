//! Deterministic grounding rules
//!
//! Cheap textual checks that an explanation restates its rows: every scalar
//! value appears, no number appears that the rows do not contain, and an
//! empty result is acknowledged as empty.

use super::{VerificationCheckResult, VerificationRule};
use crate::store::Row;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    /// Either a thousands-grouped number (`122,610.50`) or a plain one.
    static ref NUMBER: Regex = Regex::new(r"\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?").unwrap();
}

const NO_DATA_PHRASES: &[&str] = &[
    "no data",
    "no records",
    "no results",
    "no rows",
    "no transactions",
    "no matching",
    "not found",
    "no information",
    "contains no",
    "returned nothing",
    "empty",
    "none",
];

/// Every number written in `text`, commas removed.
pub fn numbers_in(text: &str) -> Vec<f64> {
    NUMBER
        .find_iter(text)
        .filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok())
        .collect()
}

fn same_number(a: f64, b: f64) -> bool {
    (a - b).abs() < 0.005 || (a - b).abs() <= a.abs().max(b.abs()) * 1e-9
}

fn mentions_number(explanation_numbers: &[f64], value: f64) -> bool {
    explanation_numbers
        .iter()
        .any(|n| same_number(*n, value.abs()))
}

/// Scalars that should show up in the text. Nulls and booleans are skipped.
fn scalars(rows: &[Row]) -> Vec<&Value> {
    rows.iter()
        .flat_map(|row| row.values())
        .filter(|v| !matches!(v, Value::Null | Value::Bool(_)))
        .collect()
}

/// Every number the rows contain, including digits inside string values.
fn data_numbers(rows: &[Row]) -> Vec<f64> {
    rows.iter()
        .flat_map(|row| row.values())
        .flat_map(|value| match value {
            Value::Number(n) => n.as_f64().map(|f| vec![f.abs()]).unwrap_or_default(),
            Value::String(s) => numbers_in(s),
            _ => Vec::new(),
        })
        .collect()
}

/// Rule: every scalar value of a non-empty result is mentioned.
pub struct CompletenessRule;

impl VerificationRule for CompletenessRule {
    fn name(&self) -> &'static str {
        "completeness"
    }

    fn verify(&self, rows: &[Row], explanation: &str) -> VerificationCheckResult {
        if rows.is_empty() {
            return VerificationCheckResult::not_applicable();
        }

        let lowered = explanation.to_lowercase();
        let mentioned = numbers_in(explanation);

        let missing: Vec<String> = scalars(rows)
            .into_iter()
            .filter(|value| match value {
                Value::Number(n) => n
                    .as_f64()
                    .map(|f| !mentions_number(&mentioned, f))
                    .unwrap_or(false),
                Value::String(s) => match s.trim().parse::<f64>() {
                    Ok(f) => !mentions_number(&mentioned, f),
                    Err(_) => !lowered.contains(&s.trim().to_lowercase()),
                },
                _ => false,
            })
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();

        if missing.is_empty() {
            VerificationCheckResult::pass("every value is mentioned")
        } else {
            VerificationCheckResult::fail(format!(
                "values missing from the explanation: {}",
                missing.join(", ")
            ))
        }
    }
}

/// Rule: no number in the explanation is absent from the result.
pub struct UnsupportedNumbersRule;

impl VerificationRule for UnsupportedNumbersRule {
    fn name(&self) -> &'static str {
        "unsupported_numbers"
    }

    fn verify(&self, rows: &[Row], explanation: &str) -> VerificationCheckResult {
        if rows.is_empty() {
            return VerificationCheckResult::not_applicable();
        }

        let known = data_numbers(rows);
        let mut invented: Vec<String> = Vec::new();

        for found in NUMBER.find_iter(explanation) {
            let Ok(value) = found.as_str().replace(',', "").parse::<f64>() else {
                continue;
            };
            if !known.iter().any(|k| same_number(*k, value)) {
                invented.push(found.as_str().to_string());
            }
        }

        if invented.is_empty() {
            VerificationCheckResult::pass("every number is grounded")
        } else {
            VerificationCheckResult::fail(format!(
                "numbers not present in the data: {}",
                invented.join(", ")
            ))
        }
    }
}

/// Rule: an empty result is described as empty.
pub struct EmptyDataAcknowledgedRule;

impl VerificationRule for EmptyDataAcknowledgedRule {
    fn name(&self) -> &'static str {
        "empty_data_acknowledged"
    }

    fn verify(&self, rows: &[Row], explanation: &str) -> VerificationCheckResult {
        if !rows.iter().all(|row| row.is_empty()) {
            return VerificationCheckResult::not_applicable();
        }

        let lowered = explanation.to_lowercase();
        if NO_DATA_PHRASES.iter().any(|p| lowered.contains(p)) {
            VerificationCheckResult::pass("absence of data acknowledged")
        } else {
            VerificationCheckResult::fail("the result is empty but the explanation does not say so")
        }
    }
}
