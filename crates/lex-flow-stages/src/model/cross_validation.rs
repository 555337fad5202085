use super::estimator::{EstimatorFactory, check_estimator, read_score};
use crate::transform::{Identity, KFold, Partitioner};
use crate::utils::keys;
use lex_flow::{
    Expansion, FlowError, Inputs, Mapping, MetaStage, Outputs, Pipeline, Result, RunContext, Stage,
    StageKind, UObject,
};
use polars::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Mean estimator score over k folds of the training data.
///
/// Ports: `X_train`, `y_train` → `score` (1x1 table).
///
/// Expands into an [`Identity`] entry, a [`KFold`] split, one estimator per
/// fold (fit on the fold's train rows, scored on its test rows), and a
/// reducer averaging the fold scores.
#[derive(Clone)]
pub struct CrossValidationScore {
    factory: Arc<dyn EstimatorFactory>,
    score_key: String,
    params: Mapping,
    folds: usize,
    partitioner: Arc<dyn Partitioner>,
}

impl CrossValidationScore {
    pub fn new(
        factory: Arc<dyn EstimatorFactory>,
        score_key: impl Into<String>,
        params: Mapping,
        folds: usize,
        partitioner: Arc<dyn Partitioner>,
    ) -> Self {
        Self {
            factory,
            score_key: score_key.into(),
            params,
            folds,
            partitioner,
        }
    }
}

impl MetaStage for CrossValidationScore {
    fn input_keys(&self) -> Vec<String> {
        keys(["X_train", "y_train"])
    }

    fn output_keys(&self) -> Vec<String> {
        keys(["score"])
    }

    fn expand(&self) -> Result<Expansion> {
        if self.folds < 2 {
            return Err(FlowError::InvalidConfig(format!(
                "Cross validation needs at least 2 folds, got {}",
                self.folds
            )));
        }
        let mut p = Pipeline::new();
        let entry = p.add(Identity::new(["X_train", "y_train"]));
        let kfold = p.add(KFold::new(2, self.folds, self.partitioner.clone()));
        let reduce = p.add(MeanScore { folds: self.folds });

        p.connect(entry.port("X_train_out"), kfold.port(KFold::input_key(0)))?;
        p.connect(entry.port("y_train_out"), kfold.port(KFold::input_key(1)))?;

        for fold in 0..self.folds {
            let estimator = self.factory.build(&self.params)?;
            check_estimator(estimator.as_ref(), &self.score_key)?;
            let node = p.add_shared(StageKind::Runnable(estimator))?;
            p.connect(kfold.port(KFold::train_key(0, fold)), node.port("X_train"))?;
            p.connect(kfold.port(KFold::train_key(1, fold)), node.port("y_train"))?;
            p.connect(kfold.port(KFold::test_key(0, fold)), node.port("X_test"))?;
            p.connect(kfold.port(KFold::test_key(1, fold)), node.port("y_test"))?;
            p.connect(node.port(&self.score_key), reduce.port(MeanScore::input_key(fold)))?;
        }
        debug!("Expanded cross validation over {} folds", self.folds);

        Ok(Expansion {
            pipeline: p,
            entry,
            exit: reduce,
        })
    }
}

impl std::fmt::Debug for CrossValidationScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossValidationScore")
            .field("score_key", &self.score_key)
            .field("params", &self.params)
            .field("folds", &self.folds)
            .finish_non_exhaustive()
    }
}

/// Averages `score0 .. score{n-1}` into `score`.
struct MeanScore {
    folds: usize,
}

impl MeanScore {
    fn input_key(fold: usize) -> String {
        format!("score{fold}")
    }
}

impl Stage for MeanScore {
    fn input_keys(&self) -> Vec<String> {
        (0..self.folds).map(Self::input_key).collect()
    }

    fn output_keys(&self) -> Vec<String> {
        keys(["score"])
    }

    fn run(&self, ctx: &RunContext, _: &BTreeSet<String>, mut inputs: Inputs) -> Result<Outputs> {
        let mut total = 0.0;
        for fold in 0..self.folds {
            let key = Self::input_key(fold);
            let df = inputs.take(&key)?.to_table(ctx.storage())?;
            total += read_score(self.name(), &key, &df)?;
        }
        let mean = total / self.folds as f64;
        debug!("Mean score over {} folds: {}", self.folds, mean);
        let df = df!("score" => &[mean])?;
        Ok(Outputs::from([("score".to_string(), UObject::table(df))]))
    }
}
