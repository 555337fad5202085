use crate::utils::{is_string_dtype, keys};
use chrono::{NaiveDate, NaiveDateTime};
use lex_flow::{Inputs, Outputs, Result, RunContext, Stage, UObject};
use polars::prelude::*;
use std::collections::BTreeSet;
use tracing::debug;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Converts string columns holding ISO-8601 dates to `Date`, and columns
/// holding ISO-8601 date-times to millisecond `Datetime`.
///
/// A column is converted only when every non-null value parses; columns with
/// no values at all are left alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timify;

impl Timify {
    pub fn new() -> Self {
        Self
    }
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s.trim(), fmt).ok())
}

/// Try each representation in turn; `None` when the column is not temporal.
fn timify(series: &Series) -> PolarsResult<Option<Series>> {
    let values = series.str()?;
    if values.null_count() == values.len() {
        return Ok(None);
    }

    let dates: Option<Vec<Option<i32>>> = values
        .into_iter()
        .map(|v| match v {
            None => Some(None),
            Some(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
                .ok()
                .map(|d| Some((d - epoch()).num_days() as i32)),
        })
        .collect();
    if let Some(days) = dates {
        let series = Series::new(series.name().clone(), days).cast(&DataType::Date)?;
        return Ok(Some(series));
    }

    let stamps: Option<Vec<Option<i64>>> = values
        .into_iter()
        .map(|v| match v {
            None => Some(None),
            Some(s) => parse_datetime(s).map(|dt| Some(dt.and_utc().timestamp_millis())),
        })
        .collect();
    if let Some(millis) = stamps {
        let series = Series::new(series.name().clone(), millis)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?;
        return Ok(Some(series));
    }
    Ok(None)
}

impl Stage for Timify {
    fn input_keys(&self) -> Vec<String> {
        keys(["in"])
    }

    fn output_keys(&self) -> Vec<String> {
        keys(["out"])
    }

    fn run(&self, ctx: &RunContext, _: &BTreeSet<String>, mut inputs: Inputs) -> Result<Outputs> {
        let df = inputs.take("in")?.to_table(ctx.storage())?;
        let mut columns = Vec::with_capacity(df.width());
        for col in df.get_columns() {
            if is_string_dtype(col.dtype())
                && let Some(converted) = timify(col.as_materialized_series())?
            {
                debug!("Column '{}' is now {}", col.name(), converted.dtype());
                columns.push(converted.into_column());
            } else {
                columns.push(col.clone());
            }
        }
        Ok(Outputs::from([(
            "out".to_string(),
            UObject::table(DataFrame::new(columns)?),
        )]))
    }
}
