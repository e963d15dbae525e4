//! Flat JSON objects -> typed [`Batch`] with the derived `age_group` column.

use std::collections::HashMap;

use cetl_core::{AgeGroup, Batch, Record};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "cetl-transform";

const PREVIEW_ROWS: usize = 5;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("expected a JSON array of objects, found {found}")]
    UnexpectedShape { found: &'static str },
    #[error("record {index}: expected a JSON object, found {found}")]
    NotAnObject { index: usize, found: &'static str },
    #[error("record {index}: missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("record {index}: field `{field}` {reason}")]
    InvalidField {
        index: usize,
        field: &'static str,
        reason: String,
    },
    #[error("record {index}: id {id} already used by record {first_index}")]
    DuplicateId {
        index: usize,
        id: i32,
        first_index: usize,
    },
}

/// Bracket for a single age. See [`AgeGroup::from_age`].
pub fn age_group(age: i32) -> AgeGroup {
    AgeGroup::from_age(age)
}

/// Convert extracted JSON into a batch.
///
/// `None` (or JSON `null`) means there is nothing to transform and yields
/// `Ok(None)`. A lone object is treated as a one-record batch; an empty array
/// yields an empty batch.
pub fn transform(data: Option<JsonValue>) -> Result<Option<Batch>, TransformError> {
    let items = match data {
        None | Some(JsonValue::Null) => {
            info!("no data to transform");
            return Ok(None);
        }
        Some(JsonValue::Array(items)) => items,
        Some(JsonValue::Object(obj)) => vec![JsonValue::Object(obj)],
        Some(other) => {
            return Err(TransformError::UnexpectedShape {
                found: json_kind(&other),
            })
        }
    };

    let mut first_seen: HashMap<i32, usize> = HashMap::with_capacity(items.len());
    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let record = match &item {
            JsonValue::Object(obj) => parse_record(index, obj)?,
            other => {
                return Err(TransformError::NotAnObject {
                    index,
                    found: json_kind(other),
                })
            }
        };
        if let Some(&first_index) = first_seen.get(&record.id()) {
            return Err(TransformError::DuplicateId {
                index,
                id: record.id(),
                first_index,
            });
        }
        first_seen.insert(record.id(), index);
        records.push(record);
    }

    let batch = Batch::new(records);
    info!(records = batch.len(), "data transformed");
    for record in batch.iter().take(PREVIEW_ROWS) {
        debug!(
            id = record.id(),
            name = record.name().unwrap_or_default(),
            age = record.age(),
            age_group = %record.age_group(),
            "preview"
        );
    }
    Ok(Some(batch))
}

fn parse_record(index: usize, obj: &Map<String, JsonValue>) -> Result<Record, TransformError> {
    let id = integer_field(index, obj, "id")?;
    let age = integer_field(index, obj, "age")?;
    let name = match obj.get("name") {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(TransformError::InvalidField {
                index,
                field: "name",
                reason: format!("expected a string, found {}", json_kind(other)),
            })
        }
    };
    Ok(Record::new(id, name, age))
}

fn integer_field(
    index: usize,
    obj: &Map<String, JsonValue>,
    field: &'static str,
) -> Result<i32, TransformError> {
    let invalid = |reason: String| TransformError::InvalidField {
        index,
        field,
        reason,
    };

    let number = match obj.get(field) {
        None | Some(JsonValue::Null) => return Err(TransformError::MissingField { index, field }),
        Some(JsonValue::Number(n)) => n,
        Some(other) => {
            return Err(invalid(format!(
                "expected a number, found {}",
                json_kind(other)
            )))
        }
    };

    if let Some(i) = number.as_i64() {
        return i32::try_from(i).map_err(|_| invalid(format!("value {i} is out of range")));
    }

    // Integral floats such as `28.0` are accepted; `28.5` is not.
    match number.as_f64() {
        Some(f) if f.fract() != 0.0 => Err(invalid(format!("value {f} is not an integer"))),
        Some(f) if f >= i32::MIN as f64 && f <= i32::MAX as f64 => Ok(f as i32),
        _ => Err(invalid(format!("value {number} is out of range"))),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
