//! Narrowing of temporal columns for the durable container encoding.
//!
//! Temporal columns are stored as their Int64 physical value. Each narrowed
//! column is described by a [`DtColumn`] so it can be widened back to the
//! exact original type at the same position under the same name.

use crate::error::{FlowError, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// Original type of a narrowed temporal column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalTag {
    Date,
    DatetimeMs,
    DatetimeUs,
    DatetimeNs,
    DurationMs,
    DurationUs,
    DurationNs,
    Time,
}

impl TemporalTag {
    /// Tag for `dtype`, or `None` when the column is not temporal.
    /// The time zone of a datetime is kept apart, in [`DtColumn::tz`].
    pub fn from_dtype(dtype: &DataType) -> Option<Self> {
        let tag = match dtype {
            DataType::Date => Self::Date,
            DataType::Datetime(TimeUnit::Milliseconds, _) => Self::DatetimeMs,
            DataType::Datetime(TimeUnit::Microseconds, _) => Self::DatetimeUs,
            DataType::Datetime(TimeUnit::Nanoseconds, _) => Self::DatetimeNs,
            DataType::Duration(TimeUnit::Milliseconds) => Self::DurationMs,
            DataType::Duration(TimeUnit::Microseconds) => Self::DurationUs,
            DataType::Duration(TimeUnit::Nanoseconds) => Self::DurationNs,
            DataType::Time => Self::Time,
            _ => return None,
        };
        Some(tag)
    }

    /// The zone-naive type this tag stands for.
    pub fn dtype(self) -> DataType {
        match self {
            Self::Date => DataType::Date,
            Self::DatetimeMs => DataType::Datetime(TimeUnit::Milliseconds, None),
            Self::DatetimeUs => DataType::Datetime(TimeUnit::Microseconds, None),
            Self::DatetimeNs => DataType::Datetime(TimeUnit::Nanoseconds, None),
            Self::DurationMs => DataType::Duration(TimeUnit::Milliseconds),
            Self::DurationUs => DataType::Duration(TimeUnit::Microseconds),
            Self::DurationNs => DataType::Duration(TimeUnit::Nanoseconds),
            Self::Time => DataType::Time,
        }
    }

    fn datetime_unit(self) -> Option<TimeUnit> {
        match self {
            Self::DatetimeMs => Some(TimeUnit::Milliseconds),
            Self::DatetimeUs => Some(TimeUnit::Microseconds),
            Self::DatetimeNs => Some(TimeUnit::Nanoseconds),
            _ => None,
        }
    }
}

/// Metadata row for one narrowed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtColumn {
    pub col_num: usize,
    pub dtype: TemporalTag,

    /// Time zone of a zone-aware datetime column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
}

/// Replace every temporal column with its Int64 physical representation.
pub fn narrow(df: &DataFrame) -> Result<(DataFrame, Vec<DtColumn>)> {
    let mut narrowed = df.clone();
    let mut dt_cols = Vec::new();

    for (col_num, column) in df.get_columns().iter().enumerate() {
        let Some(tag) = TemporalTag::from_dtype(column.dtype()) else {
            continue;
        };
        let tz = match column.dtype() {
            DataType::Datetime(_, Some(tz)) => Some(tz.to_string()),
            _ => None,
        };
        let series = column.as_materialized_series();
        let physical = series.to_physical_repr().cast(&DataType::Int64)?;
        narrowed.replace(series.name(), physical)?;
        dt_cols.push(DtColumn {
            col_num,
            dtype: tag,
            tz,
        });
    }

    Ok((narrowed, dt_cols))
}

/// Undo [`narrow`].
pub fn widen(mut df: DataFrame, dt_cols: &[DtColumn]) -> Result<DataFrame> {
    for dt_col in dt_cols {
        let column = df.get_columns().get(dt_col.col_num).ok_or_else(|| {
            FlowError::backing_store(format!(
                "Temporal metadata refers to missing column {}",
                dt_col.col_num
            ))
        })?;
        let series = column.as_materialized_series().clone();
        if series.dtype() != &DataType::Int64 {
            return Err(FlowError::backing_store(format!(
                "Narrowed column '{}' has type {}, expected i64",
                series.name(),
                series.dtype()
            )));
        }
        let widened = match (dt_col.dtype, dt_col.dtype.datetime_unit()) {
            (TemporalTag::Date, _) => series.cast(&DataType::Int32)?.cast(&DataType::Date)?,
            (_, Some(unit)) => {
                let tz = TimeZone::opt_try_new(dt_col.tz.as_deref())?;
                series.i64()?.clone().into_datetime(unit, tz).into_series()
            }
            (tag, None) => series.cast(&tag.dtype())?,
        };
        let name = series.name().clone();
        df.replace(&name, widened)?;
    }
    Ok(df)
}
