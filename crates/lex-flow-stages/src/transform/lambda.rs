use crate::utils::keys;
use lex_flow::{FlowError, Inputs, Outputs, Result, RunContext, Stage, UObject};
use polars::prelude::DataFrame;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Tables handed to a [`Lambda`] function, keyed by input port.
pub type LambdaInputs = BTreeMap<String, DataFrame>;

type LambdaFn = dyn Fn(LambdaInputs) -> anyhow::Result<Vec<DataFrame>> + Send + Sync;

/// Wraps a function of tables as a stage.
///
/// The function receives every input as a table and returns one table per
/// output key, in the order the keys were given.
#[derive(Clone)]
pub struct Lambda {
    label: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    func: Arc<LambdaFn>,
}

impl Lambda {
    pub fn new<I, O, S, T, F>(inputs: I, outputs: O, func: F) -> Self
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
        F: Fn(LambdaInputs) -> anyhow::Result<Vec<DataFrame>> + Send + Sync + 'static,
    {
        Self {
            label: "Lambda".to_string(),
            inputs: keys(inputs),
            outputs: keys(outputs),
            func: Arc::new(func),
        }
    }

    /// Name shown in logs and progress updates instead of `Lambda`.
    pub fn named(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl fmt::Debug for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lambda")
            .field("label", &self.label)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl Stage for Lambda {
    fn name(&self) -> &str {
        &self.label
    }

    fn input_keys(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn output_keys(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn run(&self, ctx: &RunContext, _: &BTreeSet<String>, mut inputs: Inputs) -> Result<Outputs> {
        let mut tables = LambdaInputs::new();
        for key in &self.inputs {
            tables.insert(key.clone(), inputs.take(key)?.to_table(ctx.storage())?);
        }

        let results = (self.func)(tables)
            .map_err(|e| FlowError::stage_failed(&self.label, format!("{e:#}")))?;
        if results.len() != self.outputs.len() {
            return Err(FlowError::stage_failed(
                &self.label,
                format!(
                    "function returned {} tables for {} outputs",
                    results.len(),
                    self.outputs.len()
                ),
            ));
        }

        Ok(self
            .outputs
            .iter()
            .cloned()
            .zip(results.into_iter().map(UObject::table))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_lambda_error_keeps_chain() {
        let stage = Lambda::new(Vec::<String>::new(), ["out"], |_| {
            Err(anyhow::anyhow!("disk full")).context("writing scratch")
        })
        .named("Scratch");
        let err = stage
            .run(
                &RunContext::default(),
                &BTreeSet::new(),
                Inputs::new("Scratch", BTreeMap::new()),
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Stage 'Scratch' failed: writing scratch: disk full"
        );
    }

    #[test]
    fn test_lambda_output_count_checked() {
        let stage = Lambda::new(Vec::<String>::new(), ["a", "b"], |_| Ok(Vec::new()));
        let err = stage
            .run(
                &RunContext::default(),
                &BTreeSet::new(),
                Inputs::new("Lambda", BTreeMap::new()),
            )
            .unwrap_err();
        assert!(err.to_string().contains("0 tables for 2 outputs"));
    }
}
