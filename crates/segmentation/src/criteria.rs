//! Criteria types and evaluation for custom segments.
//!
//! A criteria map is `field -> value`, where the value is a scalar (exact
//! match), a `{"min": .., "max": ..}` object (inclusive range, either bound
//! optional) or a list (membership). Criteria always combine with AND.

use audience_core::types::CustomerRecord;
use audience_core::{SegmentationError, SegmentationResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Exact(Value),
    Range { min: Option<f64>, max: Option<f64> },
    OneOf(Vec<Value>),
}

impl Criterion {
    pub fn parse(field: &str, value: &Value) -> SegmentationResult<Self> {
        match value {
            Value::Null => Err(SegmentationError::validation(format!(
                "criterion '{field}' has a null value"
            ))),
            Value::Object(bounds) => parse_range(field, bounds),
            Value::Array(items) => Ok(Self::OneOf(items.clone())),
            scalar => Ok(Self::Exact(scalar.clone())),
        }
    }

    /// Absent or null fields never match.
    pub fn matches(&self, actual: Option<&Value>) -> bool {
        let Some(actual) = actual else {
            return false;
        };
        match self {
            Self::Exact(expected) => values_equal(actual, expected),
            Self::OneOf(options) => options.iter().any(|o| values_equal(actual, o)),
            Self::Range { min, max } => {
                let Some(v) = as_number(actual) else {
                    return false;
                };
                min.map_or(true, |m| v >= m) && max.map_or(true, |m| v <= m)
            }
        }
    }
}

fn parse_range(field: &str, bounds: &Map<String, Value>) -> SegmentationResult<Criterion> {
    if let Some(key) = bounds.keys().find(|k| *k != "min" && *k != "max") {
        return Err(SegmentationError::validation(format!(
            "criterion '{field}': unknown range key '{key}' (expected min/max)"
        )));
    }
    let bound = |name: &str| -> SegmentationResult<Option<f64>> {
        match bounds.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => as_number(v).map(Some).ok_or_else(|| {
                SegmentationError::validation(format!(
                    "criterion '{field}': {name} must be numeric"
                ))
            }),
        }
    };
    let (min, max) = (bound("min")?, bound("max")?);
    if min.is_none() && max.is_none() {
        return Err(SegmentationError::validation(format!(
            "criterion '{field}': range needs min or max"
        )));
    }
    Ok(Criterion::Range { min, max })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

/// JSON equality, except numbers compare by value (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => numeric_cmp(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Parsed criteria in map order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Criteria {
    entries: Vec<(String, Criterion)>,
}

impl Criteria {
    pub fn parse(map: &Map<String, Value>) -> SegmentationResult<Self> {
        let entries = map
            .iter()
            .map(|(field, value)| Ok((field.clone(), Criterion::parse(field, value)?)))
            .collect::<SegmentationResult<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(f, _)| f.as_str())
    }

    /// Splits off criteria whose field appears in none of `records`; those
    /// are not applied. Returns the applicable criteria and the ignored names.
    pub fn applicable_to(&self, records: &[CustomerRecord]) -> (Self, Vec<String>) {
        let (kept, ignored): (Vec<_>, Vec<_>) = self
            .entries
            .iter()
            .cloned()
            .partition(|(field, _)| records.iter().any(|r| r.fields().contains_key(field)));
        (
            Self { entries: kept },
            ignored.into_iter().map(|(field, _)| field).collect(),
        )
    }

    pub fn matches(&self, record: &CustomerRecord) -> bool {
        self.entries
            .iter()
            .all(|(field, criterion)| criterion.matches(record.get(field)))
    }

    pub fn filter<'a>(&self, records: &'a [CustomerRecord]) -> Vec<&'a CustomerRecord> {
        records.iter().filter(|r| self.matches(r)).collect()
    }
}
