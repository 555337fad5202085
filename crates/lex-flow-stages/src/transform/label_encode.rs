use crate::utils::{is_string_dtype, keys};
use lex_flow::{Inputs, Outputs, Result, RunContext, Stage, UObject};
use polars::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Replaces every string column of `in` with integer category codes.
///
/// Codes follow the sorted order of the distinct values, starting at 0.
/// Nulls stay null.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelEncode;

impl LabelEncode {
    pub fn new() -> Self {
        Self
    }
}

fn encode(series: &Series) -> PolarsResult<Series> {
    let values = series.str()?;
    let categories: BTreeMap<&str, i64> = values
        .into_iter()
        .flatten()
        .collect::<BTreeSet<&str>>()
        .into_iter()
        .zip(0i64..)
        .collect();
    debug!(
        "Encoding '{}' with {} categories",
        series.name(),
        categories.len()
    );
    let codes: Vec<Option<i64>> = values
        .into_iter()
        .map(|v| v.and_then(|s| categories.get(s).copied()))
        .collect();
    Ok(Series::new(series.name().clone(), codes))
}

impl Stage for LabelEncode {
    fn input_keys(&self) -> Vec<String> {
        keys(["in"])
    }

    fn output_keys(&self) -> Vec<String> {
        keys(["out"])
    }

    fn run(&self, ctx: &RunContext, _: &BTreeSet<String>, mut inputs: Inputs) -> Result<Outputs> {
        let df = inputs.take("in")?.to_table(ctx.storage())?;
        let columns = df
            .get_columns()
            .iter()
            .map(|col| {
                if is_string_dtype(col.dtype()) {
                    encode(col.as_materialized_series()).map(Column::from)
                } else {
                    Ok(col.clone())
                }
            })
            .collect::<PolarsResult<Vec<_>>>()?;
        Ok(Outputs::from([(
            "out".to_string(),
            UObject::table(DataFrame::new(columns)?),
        )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_uses_sorted_categories() {
        let series = Series::new("color".into(), &[Some("red"), Some("blue"), None, Some("red")]);
        let codes = encode(&series).unwrap();
        let codes: Vec<Option<i64>> = codes.i64().unwrap().into_iter().collect();
        assert_eq!(codes, vec![Some(1), Some(0), None, Some(1)]);
    }
}
