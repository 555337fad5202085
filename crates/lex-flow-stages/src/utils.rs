//! Shared helpers for the stage implementations.

use lex_flow::{Outputs, UObject};
use polars::prelude::*;
use std::collections::BTreeSet;

// =============================================================================
// Data Type Utilities
// =============================================================================

/// Check if a DataType is numeric (integer or float).
#[inline]
pub fn is_numeric_dtype(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
    )
}

#[inline]
pub fn is_float_dtype(dtype: &DataType) -> bool {
    matches!(dtype, DataType::Float32 | DataType::Float64)
}

#[inline]
pub fn is_string_dtype(dtype: &DataType) -> bool {
    matches!(dtype, DataType::String)
}

// =============================================================================
// Series Transformation Utilities
// =============================================================================

/// Replace nulls and NaNs in a numeric Series with `fill_value`.
///
/// Integer columns stay integer when `fill_value` has no fractional part;
/// otherwise the column is widened to Float64. An integral fill value that
/// the column type cannot hold is an error.
pub fn fill_numeric_missing(series: &Series, fill_value: f64) -> PolarsResult<Series> {
    let integral = fill_value.fract() == 0.0;
    if !is_float_dtype(series.dtype()) && integral {
        let dtype = series.dtype();
        let filled = if dtype.is_unsigned_integer() {
            if fill_value < 0.0 || fill_value >= u64::MAX as f64 {
                return Err(fill_does_not_fit(series, fill_value));
            }
            series
                .cast(&DataType::UInt64)?
                .u64()?
                .fill_null_with_values(fill_value as u64)?
                .into_series()
        } else {
            if fill_value < i64::MIN as f64 || fill_value >= i64::MAX as f64 {
                return Err(fill_does_not_fit(series, fill_value));
            }
            series
                .cast(&DataType::Int64)?
                .i64()?
                .fill_null_with_values(fill_value as i64)?
                .into_series()
        };
        return filled
            .strict_cast(dtype)
            .map_err(|_| fill_does_not_fit(series, fill_value));
    }

    let values = series.cast(&DataType::Float64)?;
    let filled: Float64Chunked = values
        .f64()?
        .into_iter()
        .map(|v| match v {
            Some(x) if !x.is_nan() => Some(x),
            _ => Some(fill_value),
        })
        .collect();
    let filled = filled.with_name(series.name().clone()).into_series();
    if series.dtype() == &DataType::Float32 {
        filled.cast(&DataType::Float32)
    } else {
        Ok(filled)
    }
}

fn fill_does_not_fit(series: &Series, fill_value: f64) -> PolarsError {
    PolarsError::ComputeError(
        format!(
            "fill value {} does not fit column '{}' of type {}",
            fill_value,
            series.name(),
            series.dtype()
        )
        .into(),
    )
}

// =============================================================================
// Port Utilities
// =============================================================================

/// Owned port names.
pub fn keys<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}

/// Insert `df` under `key` if the scheduler asked for it.
pub fn emit_table(
    outputs: &mut Outputs,
    requested: &BTreeSet<String>,
    key: &str,
    df: impl FnOnce() -> PolarsResult<DataFrame>,
) -> PolarsResult<()> {
    if requested.contains(key) {
        outputs.insert(key.to_string(), UObject::table(df()?));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_numeric_dtype() {
        assert!(is_numeric_dtype(&DataType::Int64));
        assert!(is_numeric_dtype(&DataType::Float32));
        assert!(!is_numeric_dtype(&DataType::String));
        assert!(!is_numeric_dtype(&DataType::Boolean));
    }

    #[test]
    fn test_fill_numeric_missing_keeps_integers() {
        let series = Series::new("a".into(), &[Some(1i64), None, Some(3)]);
        let filled = fill_numeric_missing(&series, -1.0).unwrap();
        assert_eq!(filled.dtype(), &DataType::Int64);
        let values: Vec<Option<i64>> = filled.i64().unwrap().into_iter().collect();
        assert_eq!(values, vec![Some(1), Some(-1), Some(3)]);
    }

    #[test]
    fn test_fill_numeric_missing_keeps_large_unsigned_values() {
        let big = i64::MAX as u64 + 10;
        let series = Series::new("u".into(), &[Some(big), None]);
        let filled = fill_numeric_missing(&series, 7.0).unwrap();
        assert_eq!(filled.dtype(), &DataType::UInt64);
        let values: Vec<Option<u64>> = filled.u64().unwrap().into_iter().collect();
        assert_eq!(values, vec![Some(big), Some(7)]);
    }

    #[test]
    fn test_fill_numeric_missing_rejects_values_outside_the_type() {
        let unsigned = Series::new("u".into(), &[Some(1u8), None]);
        let err = fill_numeric_missing(&unsigned, -1.0).unwrap_err();
        assert!(err.to_string().contains("does not fit column 'u'"));

        let small = Series::new("s".into(), &[Some(1i8), None]);
        assert!(fill_numeric_missing(&small, 300.0).is_err());
        assert!(fill_numeric_missing(&small, -5.0).is_ok());
    }

    #[test]
    fn test_fill_numeric_missing_replaces_nan() {
        let series = Series::new("f".into(), &[Some(1.5f64), Some(f64::NAN), None]);
        let filled = fill_numeric_missing(&series, 0.0).unwrap();
        let values: Vec<Option<f64>> = filled.f64().unwrap().into_iter().collect();
        assert_eq!(values, vec![Some(1.5), Some(0.0), Some(0.0)]);
    }

    #[test]
    fn test_emit_table_skips_unrequested() {
        let mut outputs = Outputs::new();
        let requested = BTreeSet::from(["a".to_string()]);
        emit_table(&mut outputs, &requested, "a", || df!("x" => &[1i32])).unwrap();
        emit_table(&mut outputs, &requested, "b", || df!("x" => &[2i32])).unwrap();
        assert_eq!(outputs.keys().collect::<Vec<_>>(), vec!["a"]);
    }
}
