//! Model-selection stages driven by a toy estimator.

use lex_flow::{
    FlowError, Inputs, Mapping, Outputs, Pipeline, Result, RunContext, RunEvent, Stage,
    StorageContext, UObject,
};
use lex_flow_stages::model::{ESTIMATOR_INPUTS, PARAMS_KEY};
use lex_flow_stages::{CrossValidationScore, EstimatorFactory, GridSearch, TableRead};
use parking_lot::Mutex;
use polars::prelude::*;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;

// ============================================================================
// Fixtures
// ============================================================================

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn values(df: &DataFrame) -> Vec<f64> {
    df.get_columns()[0]
        .cast(&DataType::Float64)
        .unwrap()
        .f64()
        .unwrap()
        .into_no_null_iter()
        .collect()
}

/// Predicts `mean(y_train) + offset` for every test row.
/// Scores with the negated mean absolute error.
struct MeanOffset {
    offset: f64,
}

impl Stage for MeanOffset {
    fn input_keys(&self) -> Vec<String> {
        ESTIMATOR_INPUTS.iter().map(|k| k.to_string()).collect()
    }

    fn output_keys(&self) -> Vec<String> {
        vec!["score".to_string(), "y_pred".to_string()]
    }

    fn run(
        &self,
        ctx: &RunContext,
        outputs_requested: &BTreeSet<String>,
        mut inputs: Inputs,
    ) -> Result<Outputs> {
        let y_train = values(&inputs.take("y_train")?.to_table(ctx.storage())?);
        let y_test = values(&inputs.take("y_test")?.to_table(ctx.storage())?);
        let prediction = y_train.iter().sum::<f64>() / y_train.len() as f64 + self.offset;

        let mut outputs = Outputs::new();
        if outputs_requested.contains("y_pred") {
            let df = df!("y_pred" => vec![prediction; y_test.len()])?;
            outputs.insert("y_pred".to_string(), UObject::table(df));
        }
        if outputs_requested.contains("score") {
            let error: f64 = y_test.iter().map(|y| (prediction - y).abs()).sum::<f64>()
                / y_test.len() as f64;
            let df = df!("score" => &[-error])?;
            outputs.insert("score".to_string(), UObject::table(df));
        }
        Ok(outputs)
    }
}

/// Has no `y_test` input.
struct Incomplete;

impl Stage for Incomplete {
    fn input_keys(&self) -> Vec<String> {
        vec!["X_train".to_string(), "y_train".to_string(), "X_test".to_string()]
    }

    fn output_keys(&self) -> Vec<String> {
        vec!["score".to_string()]
    }

    fn run(&self, _: &RunContext, _: &BTreeSet<String>, _: Inputs) -> Result<Outputs> {
        Ok(Outputs::new())
    }
}

fn mean_offset_factory() -> Arc<dyn EstimatorFactory> {
    Arc::new(|params: &Mapping| -> Result<Arc<dyn Stage>> {
        let offset = params.get("offset").and_then(Value::as_f64).unwrap_or(0.0);
        Ok(Arc::new(MeanOffset { offset }))
    })
}

fn offset_grid() -> Vec<(String, Vec<Value>)> {
    vec![("offset".to_string(), vec![json!(-1), json!(0), json!(2)])]
}

fn constant_target(rows: usize, value: f64) -> DataFrame {
    df!("y" => vec![value; rows]).unwrap()
}

fn features(rows: usize) -> DataFrame {
    df!("x" => (0..rows).map(|r| r as f64).collect::<Vec<_>>()).unwrap()
}

// ============================================================================
// Grid search
// ============================================================================

#[test]
fn test_grid_search_picks_best_params_and_predicts() {
    init_logging();
    let search = GridSearch::new(mean_offset_factory(), "score", offset_grid(), 3).unwrap();
    assert_eq!(search.combinations().len(), 3);

    let mut p = Pipeline::new();
    let x_train = p.add(TableRead::new(features(9)));
    let y_train = p.add(TableRead::new(constant_target(9, 5.0)));
    let x_test = p.add(TableRead::new(features(4)));
    let y_test = p.add(TableRead::new(constant_target(4, 5.0)));
    let grid = p.add_meta(search);
    p.connect(x_train.port("out"), grid.port("X_train")).unwrap();
    p.connect(y_train.port("out"), grid.port("y_train")).unwrap();
    p.connect(x_test.port("out"), grid.port("X_test")).unwrap();
    p.connect(y_test.port("out"), grid.port("y_test")).unwrap();

    let labels = Arc::new(Mutex::new(Vec::new()));
    let sink = labels.clone();
    p.on_progress(move |update| {
        if update.event == RunEvent::StageCompleted {
            sink.lock().extend(update.stage);
        }
    });

    let mut outputs = p
        .run(Some(&[grid.port(PARAMS_KEY), grid.port("y_pred")]))
        .unwrap();

    let storage = StorageContext::default();
    let params = outputs
        .take(&grid.port(PARAMS_KEY))
        .unwrap()
        .to_mapping(&storage)
        .unwrap();
    assert_eq!(params.get("offset").and_then(Value::as_f64), Some(0.0));

    let y_pred = outputs
        .take(&grid.port("y_pred"))
        .unwrap()
        .to_table(&storage)
        .unwrap();
    assert_eq!(values(&y_pred), vec![5.0; 4]);

    let labels = labels.lock();
    assert!(
        labels
            .iter()
            .any(|l| l == "GridSearch/CrossValidationScore/KFold")
    );
    // One fitted estimator per fold per combination.
    let fitted = labels
        .iter()
        .filter(|l| l.as_str() == "GridSearch/CrossValidationScore/MeanOffset")
        .count();
    assert_eq!(fitted, 9);
}

#[test]
fn test_grid_search_rejects_incomplete_estimator() {
    let factory: Arc<dyn EstimatorFactory> =
        Arc::new(|_: &Mapping| -> Result<Arc<dyn Stage>> { Ok(Arc::new(Incomplete)) });

    let err = GridSearch::new(factory, "score", offset_grid(), 3).unwrap_err();
    assert!(matches!(err, FlowError::InvalidConfig(_)));
    assert!(err.to_string().contains("y_test"));
}

#[test]
fn test_grid_search_rejects_unknown_score_key() {
    let err = GridSearch::new(mean_offset_factory(), "accuracy", offset_grid(), 3).unwrap_err();
    assert!(matches!(err, FlowError::InvalidConfig(_)));
}

// ============================================================================
// Cross validation
// ============================================================================

#[test]
fn test_cross_validation_score_averages_folds() {
    init_logging();
    let mut params = Mapping::new();
    params.insert("offset".to_string(), json!(2));
    let cv = CrossValidationScore::new(
        mean_offset_factory(),
        "score",
        params,
        4,
        Arc::new(lex_flow_stages::ContiguousFolds),
    );

    let mut p = Pipeline::new();
    let x = p.add(TableRead::new(features(8)));
    let y = p.add(TableRead::new(constant_target(8, 1.5)));
    let node = p.add_meta(cv);
    p.connect(x.port("out"), node.port("X_train")).unwrap();
    p.connect(y.port("out"), node.port("y_train")).unwrap();

    let mut outputs = p.run(Some(&[node.port("score")])).unwrap();
    let score = outputs
        .take(&node.port("score"))
        .unwrap()
        .to_table(&StorageContext::default())
        .unwrap();
    assert_eq!(score.shape(), (1, 1));
    assert_eq!(values(&score), vec![-2.0]);
}

#[test]
fn test_cross_validation_needs_two_folds() {
    let cv = CrossValidationScore::new(
        mean_offset_factory(),
        "score",
        Mapping::new(),
        1,
        Arc::new(lex_flow_stages::ContiguousFolds),
    );

    let mut p = Pipeline::new();
    let x = p.add(TableRead::new(features(4)));
    let y = p.add(TableRead::new(constant_target(4, 0.0)));
    let node = p.add_meta(cv);
    p.connect(x.port("out"), node.port("X_train")).unwrap();
    p.connect(y.port("out"), node.port("y_train")).unwrap();

    let err = p.run(Some(&[node.port("score")])).unwrap_err();
    assert!(err.to_string().contains("at least 2 folds"));
}
