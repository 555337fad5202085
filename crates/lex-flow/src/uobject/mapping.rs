//! Single-row tables viewed as key/value mappings.

use crate::error::{FlowError, Result};
use polars::prelude::*;
use serde_json::Value;

/// Key/value view of a one-row table, keyed by column name.
pub type Mapping = serde_json::Map<String, Value>;

/// Build a one-row table with one column per mapping entry, in key order.
pub fn mapping_to_table(mapping: &Mapping) -> Result<DataFrame> {
    let mut columns = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = PlSmallStr::from(key.as_str());
        let column = match value {
            Value::Null => Column::full_null(name, 1, &DataType::Null),
            Value::Bool(b) => Column::new(name, &[*b]),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Column::new(name, &[i])
                } else if let Some(u) = n.as_u64() {
                    Column::new(name, &[u])
                } else {
                    Column::new(name, &[n.as_f64().unwrap_or(f64::NAN)])
                }
            }
            Value::String(s) => Column::new(name, &[s.as_str()]),
            Value::Array(_) | Value::Object(_) => {
                return Err(FlowError::backing_store(format!(
                    "Mapping entry '{key}' is nested and cannot be stored as a column"
                )));
            }
        };
        columns.push(column);
    }
    Ok(DataFrame::new(columns)?)
}

/// Read the only row of `df` back as a mapping.
///
/// Tables with any height other than one cannot be viewed as a mapping,
/// except for a table without columns, which yields an empty mapping.
pub fn table_to_mapping(df: &DataFrame) -> Result<Mapping> {
    let mut mapping = Mapping::new();
    if df.width() == 0 {
        return Ok(mapping);
    }
    if df.height() != 1 {
        return Err(FlowError::Conversion {
            from: super::StorageMethod::Columnar,
            to: super::TargetFormat::Mapping,
        }
        .with_context(format!(
            "A table with {} rows has no mapping view",
            df.height()
        )));
    }
    for column in df.get_columns() {
        mapping.insert(column.name().to_string(), any_value_to_json(column.get(0)?));
    }
    Ok(mapping)
}

fn any_value_to_json(value: AnyValue<'_>) -> Value {
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::Int8(v) => Value::from(v),
        AnyValue::Int16(v) => Value::from(v),
        AnyValue::Int32(v) => Value::from(v),
        AnyValue::Int64(v) => Value::from(v),
        AnyValue::UInt8(v) => Value::from(v),
        AnyValue::UInt16(v) => Value::from(v),
        AnyValue::UInt32(v) => Value::from(v),
        AnyValue::UInt64(v) => Value::from(v),
        AnyValue::Float32(v) => Value::from(v),
        AnyValue::Float64(v) => Value::from(v),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::StringOwned(s) => Value::String(s.to_string()),
        other => Value::String(other.to_string()),
    }
}
