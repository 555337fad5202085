use super::cross_validation::CrossValidationScore;
use super::estimator::{ESTIMATOR_INPUTS, EstimatorFactory, ParamsRead, check_estimator, read_score};
use crate::transform::{ContiguousFolds, Identity, Partitioner};
use lex_flow::{
    Expansion, FlowError, Inputs, Mapping, MetaStage, Outputs, Pipeline, Result, RunContext, Stage,
    UObject,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Output port carrying the winning parameter mapping.
pub const PARAMS_KEY: &str = "params";

/// Cartesian product of a parameter grid, first parameter varying slowest.
pub fn param_combinations(grid: &[(String, Vec<Value>)]) -> Vec<Mapping> {
    let mut combos = vec![Mapping::new()];
    for (name, values) in grid {
        combos = combos
            .into_iter()
            .flat_map(|combo| {
                values.iter().map(move |value| {
                    let mut next = combo.clone();
                    next.insert(name.clone(), value.clone());
                    next
                })
            })
            .collect();
    }
    combos
}

/// Exhaustive search over a parameter grid.
///
/// Ports: `X_train`, `y_train`, `X_test`, `y_test` → every output of the
/// estimator plus `params`.
///
/// Each parameter combination is scored with a nested
/// [`CrossValidationScore`] on the training data. The estimator built with
/// the best-scoring combination (first one on ties) is then fit on the full
/// training data and applied to the test data.
#[derive(Clone)]
pub struct GridSearch {
    factory: Arc<dyn EstimatorFactory>,
    score_key: String,
    combos: Vec<Mapping>,
    folds: usize,
    partitioner: Arc<dyn Partitioner>,
    estimator_outputs: Vec<String>,
}

impl GridSearch {
    /// Fails when the estimator built from the first combination does not
    /// satisfy the estimator contract.
    pub fn new(
        factory: Arc<dyn EstimatorFactory>,
        score_key: impl Into<String>,
        grid: Vec<(String, Vec<Value>)>,
        folds: usize,
    ) -> Result<Self> {
        let score_key = score_key.into();
        let combos = param_combinations(&grid);
        let Some(first) = combos.first() else {
            return Err(FlowError::InvalidConfig(
                "Parameter grid has no combinations".to_string(),
            ));
        };
        let probe = factory.build(first)?;
        check_estimator(probe.as_ref(), &score_key)?;
        let estimator_outputs = probe.output_keys();
        if estimator_outputs.iter().any(|k| k == PARAMS_KEY) {
            return Err(FlowError::InvalidConfig(format!(
                "Estimator '{}' already has an output named '{}'",
                probe.name(),
                PARAMS_KEY
            )));
        }

        Ok(Self {
            factory,
            score_key,
            combos,
            folds,
            partitioner: Arc::new(ContiguousFolds),
            estimator_outputs,
        })
    }

    /// Use `partitioner` for the cross-validation folds.
    pub fn with_partitioner(mut self, partitioner: impl Partitioner + 'static) -> Self {
        self.partitioner = Arc::new(partitioner);
        self
    }

    pub fn combinations(&self) -> &[Mapping] {
        &self.combos
    }
}

impl MetaStage for GridSearch {
    fn input_keys(&self) -> Vec<String> {
        crate::utils::keys(ESTIMATOR_INPUTS)
    }

    fn output_keys(&self) -> Vec<String> {
        let mut keys = self.estimator_outputs.clone();
        keys.push(PARAMS_KEY.to_string());
        keys
    }

    fn expand(&self) -> Result<Expansion> {
        let mut p = Pipeline::new();
        let entry = p.add(Identity::new(ESTIMATOR_INPUTS));
        let reduce = p.add(BestParams {
            candidates: self.combos.len(),
        });
        let last = p.add(BestEstimator {
            factory: self.factory.clone(),
            outputs: self.estimator_outputs.clone(),
        });

        for (i, params) in self.combos.iter().enumerate() {
            let cv = p.add_meta(CrossValidationScore::new(
                self.factory.clone(),
                self.score_key.clone(),
                params.clone(),
                self.folds,
                self.partitioner.clone(),
            ));
            p.connect(entry.port("X_train_out"), cv.port("X_train"))?;
            p.connect(entry.port("y_train_out"), cv.port("y_train"))?;
            p.connect(cv.port("score"), reduce.port(BestParams::score_key(i)))?;

            let source = p.add(ParamsRead::new(params.clone()));
            p.connect(source.port("out"), reduce.port(BestParams::params_key(i)))?;
        }

        for key in ESTIMATOR_INPUTS {
            p.connect(entry.port(Identity::output_key(key)), last.port(key))?;
        }
        p.connect(reduce.port(PARAMS_KEY), last.port(BestEstimator::PARAMS_IN))?;
        debug!("Expanded grid search over {} combinations", self.combos.len());

        Ok(Expansion {
            pipeline: p,
            entry,
            exit: last,
        })
    }
}

impl std::fmt::Debug for GridSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridSearch")
            .field("score_key", &self.score_key)
            .field("combos", &self.combos)
            .field("folds", &self.folds)
            .finish_non_exhaustive()
    }
}

/// Picks the parameter mapping with the highest score.
struct BestParams {
    candidates: usize,
}

impl BestParams {
    fn score_key(i: usize) -> String {
        format!("score_in{i}")
    }

    fn params_key(i: usize) -> String {
        format!("params_in{i}")
    }
}

impl Stage for BestParams {
    fn input_keys(&self) -> Vec<String> {
        (0..self.candidates)
            .map(Self::score_key)
            .chain((0..self.candidates).map(Self::params_key))
            .collect()
    }

    fn output_keys(&self) -> Vec<String> {
        vec![PARAMS_KEY.to_string()]
    }

    fn run(&self, ctx: &RunContext, _: &BTreeSet<String>, mut inputs: Inputs) -> Result<Outputs> {
        let mut best: Option<(usize, f64)> = None;
        for i in 0..self.candidates {
            let key = Self::score_key(i);
            let df = inputs.take(&key)?.to_table(ctx.storage())?;
            let score = read_score(self.name(), &key, &df)?;
            debug!("Candidate {} scored {}", i, score);
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((i, score));
            }
        }
        let Some((winner, score)) = best else {
            return Err(FlowError::stage_failed(self.name(), "no candidates to compare"));
        };
        info!("Best parameters: candidate {} with score {}", winner, score);

        let params = inputs.take(&Self::params_key(winner))?;
        Ok(Outputs::from([(PARAMS_KEY.to_string(), params.into_output()?)]))
    }
}

/// Builds the estimator from the winning parameters and runs it inline.
struct BestEstimator {
    factory: Arc<dyn EstimatorFactory>,
    outputs: Vec<String>,
}

impl BestEstimator {
    const PARAMS_IN: &'static str = "params_in";
}

impl Stage for BestEstimator {
    fn input_keys(&self) -> Vec<String> {
        let mut keys = crate::utils::keys(ESTIMATOR_INPUTS);
        keys.push(Self::PARAMS_IN.to_string());
        keys
    }

    fn output_keys(&self) -> Vec<String> {
        let mut keys = self.outputs.clone();
        keys.push(PARAMS_KEY.to_string());
        keys
    }

    fn run(
        &self,
        ctx: &RunContext,
        outputs_requested: &BTreeSet<String>,
        mut inputs: Inputs,
    ) -> Result<Outputs> {
        let params = inputs.take(Self::PARAMS_IN)?.to_mapping(ctx.storage())?;
        let estimator = self.factory.build(&params)?;

        let mut estimator_outputs: BTreeSet<String> = outputs_requested
            .iter()
            .filter(|k| k.as_str() != PARAMS_KEY)
            .cloned()
            .collect();
        let mut outputs = if estimator_outputs.is_empty() {
            Outputs::new()
        } else {
            let mut values = BTreeMap::new();
            for key in ESTIMATOR_INPUTS {
                values.insert(key.to_string(), inputs.take(key)?);
            }
            let forwarded = Inputs::new(estimator.name(), values);
            estimator_outputs.retain(|k| self.outputs.contains(k));
            estimator
                .run(ctx, &estimator_outputs, forwarded)
                .map_err(|e| e.with_context(format!("Estimator '{}' failed", estimator.name())))?
        };

        if outputs_requested.contains(PARAMS_KEY) {
            let mut out = UObject::writer();
            out.from_mapping(&params)?;
            outputs.insert(PARAMS_KEY.to_string(), out);
        }
        Ok(outputs)
    }
}
