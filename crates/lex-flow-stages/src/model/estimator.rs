//! Estimator contract shared by the model-selection meta stages.

use crate::utils::keys;
use lex_flow::{FlowError, Inputs, Mapping, Outputs, Result, RunContext, Stage, UObject};
use polars::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Input ports every estimator stage must declare.
pub const ESTIMATOR_INPUTS: [&str; 4] = ["X_train", "y_train", "X_test", "y_test"];

/// Builds estimator stages from a parameter mapping.
///
/// An estimator is a [`Stage`] with the inputs in [`ESTIMATOR_INPUTS`] whose
/// outputs include a score port holding a 1x1 table. Higher scores are
/// better. Fitting and scoring are entirely up to the estimator.
pub trait EstimatorFactory: Send + Sync {
    fn build(&self, params: &Mapping) -> Result<Arc<dyn Stage>>;
}

impl<F> EstimatorFactory for F
where
    F: Fn(&Mapping) -> Result<Arc<dyn Stage>> + Send + Sync,
{
    fn build(&self, params: &Mapping) -> Result<Arc<dyn Stage>> {
        self(params)
    }
}

/// Check that `stage` can serve as an estimator scored on `score_key`.
pub(crate) fn check_estimator(stage: &dyn Stage, score_key: &str) -> Result<()> {
    let inputs = stage.input_keys();
    if let Some(missing) = ESTIMATOR_INPUTS
        .iter()
        .find(|k| !inputs.iter().any(|i| i == *k))
    {
        return Err(FlowError::InvalidConfig(format!(
            "Estimator '{}' has no input '{}'",
            stage.name(),
            missing
        )));
    }
    if !stage.output_keys().iter().any(|k| k == score_key) {
        return Err(FlowError::InvalidConfig(format!(
            "Estimator '{}' has no score output '{}'",
            stage.name(),
            score_key
        )));
    }
    Ok(())
}

/// Read the single cell of a 1x1 score table.
pub(crate) fn read_score(stage: &str, key: &str, df: &DataFrame) -> Result<f64> {
    if df.shape() != (1, 1) {
        return Err(FlowError::stage_failed(
            stage,
            format!("score '{}' must be a 1x1 table, got {:?}", key, df.shape()),
        ));
    }
    let value = df.get_columns()[0].get(0)?;
    value
        .try_extract::<f64>()
        .map_err(|e| FlowError::stage_failed(stage, format!("score '{key}' is not numeric: {e}")))
}

/// Emits a fixed parameter mapping on `out`.
pub(crate) struct ParamsRead {
    params: Mapping,
}

impl ParamsRead {
    pub(crate) fn new(params: Mapping) -> Self {
        Self { params }
    }
}

impl Stage for ParamsRead {
    fn input_keys(&self) -> Vec<String> {
        Vec::new()
    }

    fn output_keys(&self) -> Vec<String> {
        keys(["out"])
    }

    fn run(&self, _: &RunContext, _: &BTreeSet<String>, _: Inputs) -> Result<Outputs> {
        let mut out = UObject::writer();
        out.from_mapping(&self.params)?;
        Ok(Outputs::from([("out".to_string(), out)]))
    }
}
