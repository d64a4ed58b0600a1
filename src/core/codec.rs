//! Purpose: Split items into indexed column values plus a JSON payload, and back.
//! Exports: `Item`, `EncodedItem`, `encode`, `decode`, `float_value`, `item_from_value`.
//! Role: The only place where JSON values become SQL values.
//! Invariants: The payload carries the whole item; indexed columns are never read back.
//! Invariants: Integers and floats stay distinct; key order survives the payload.
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Number, Value};

use crate::core::error::{Error, ErrorKind};
use crate::core::schema::TableSchema;

/// A stored record: field names mapped to JSON values.
pub type Item = Map<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub struct EncodedItem {
    /// One value per index spec, in schema order.
    pub indexed: Vec<SqlValue>,
    pub payload: String,
}

pub fn encode(schema: &TableSchema, item: &Item) -> Result<EncodedItem, Error> {
    let mut indexed = Vec::with_capacity(schema.indices().len());
    for spec in schema.indices() {
        let value = match item.get(spec.field()) {
            None | Some(Value::Null) if spec.is_unique() => {
                return Err(Error::new(ErrorKind::SchemaViolation)
                    .with_message(format!("item does not have required field '{}'", spec.field()))
                    .with_table(schema.name()));
            }
            None => SqlValue::Null,
            Some(value) => index_value(value).map_err(|reason| {
                Error::new(ErrorKind::SchemaViolation)
                    .with_message(format!("field '{}' cannot be indexed: {reason}", spec.field()))
                    .with_table(schema.name())
            })?,
        };
        indexed.push(value);
    }

    let payload = serde_json::to_string(item).map_err(|err| {
        Error::new(ErrorKind::InvalidValue)
            .with_message("item is not JSON serializable")
            .with_source(err)
    })?;

    Ok(EncodedItem { indexed, payload })
}

pub fn decode(payload: &str) -> Result<Item, Error> {
    serde_json::from_str(payload).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("stored item payload is not a JSON object")
            .with_source(err)
    })
}

/// Builds a JSON number from a float, rejecting NaN and infinities.
pub fn float_value(value: f64) -> Result<Value, Error> {
    Number::from_f64(value).map(Value::Number).ok_or_else(|| {
        Error::new(ErrorKind::InvalidValue)
            .with_message(format!("{value} has no JSON representation"))
    })
}

pub fn item_from_value(value: Value) -> Result<Item, Error> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::new(ErrorKind::SchemaViolation)
            .with_message(format!("expected each item to be an object, got {}", type_name(&other)))),
    }
}

/// Converts a filter argument into a bound parameter.
pub(crate) fn param_value(value: &Value) -> Result<SqlValue, Error> {
    index_value(value).map_err(|reason| {
        Error::new(ErrorKind::Usage).with_message(format!("invalid query argument: {reason}"))
    })
}

fn index_value(value: &Value) -> Result<SqlValue, String> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => number_value(n),
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => {
            Err(format!("{} values are not scalar", type_name(value)))
        }
    }
}

fn number_value(n: &Number) -> Result<SqlValue, String> {
    if let Some(i) = n.as_i64() {
        return Ok(SqlValue::Integer(i));
    }
    if n.is_u64() {
        return Err(format!("{n} exceeds the 64-bit signed integer range"));
    }
    match n.as_f64() {
        Some(f) if f.is_finite() => Ok(SqlValue::Real(f)),
        _ => Err(format!("{n} is not a finite number")),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
