use crate::utils::{fill_numeric_missing, is_numeric_dtype, keys};
use lex_flow::{FlowError, Inputs, Outputs, Result, RunContext, Stage, UObject};
use polars::prelude::*;
use std::collections::BTreeSet;

/// Replaces nulls and NaNs in numeric columns of `in` with a constant.
///
/// Non-numeric columns pass through untouched.
#[derive(Debug, Clone, Copy)]
pub struct FillNa {
    value: f64,
}

impl FillNa {
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

impl Stage for FillNa {
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
                if !is_numeric_dtype(col.dtype()) {
                    return Ok(col.clone());
                }
                fill_numeric_missing(col.as_materialized_series(), self.value)
                    .map(Column::from)
                    .map_err(|e| FlowError::stage_failed(self.name(), e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let filled = DataFrame::new(columns)?;
        Ok(Outputs::from([("out".to_string(), UObject::table(filled))]))
    }
}
