//! Stages that cut one table into several.

use crate::utils::{emit_table, keys};
use lex_flow::{FlowError, Inputs, Outputs, Result, RunContext, Stage};
use polars::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Column split
// =============================================================================

/// Splits the columns of `in` into `selected` (the listed columns, in the
/// listed order) and `rest` (everything else, in input order).
#[derive(Debug, Clone)]
pub struct SplitColumns {
    columns: Vec<String>,
}

impl SplitColumns {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: keys(columns),
        }
    }
}

impl Stage for SplitColumns {
    fn input_keys(&self) -> Vec<String> {
        keys(["in"])
    }

    fn output_keys(&self) -> Vec<String> {
        keys(["selected", "rest"])
    }

    fn run(
        &self,
        ctx: &RunContext,
        outputs_requested: &BTreeSet<String>,
        mut inputs: Inputs,
    ) -> Result<Outputs> {
        let df = inputs.take("in")?.to_table(ctx.storage())?;
        let mut outputs = Outputs::new();
        emit_table(&mut outputs, outputs_requested, "selected", || {
            df.select(self.columns.iter().map(String::as_str))
        })?;
        emit_table(&mut outputs, outputs_requested, "rest", || {
            let rest: Vec<PlSmallStr> = df
                .get_column_names()
                .into_iter()
                .filter(|name| !self.columns.iter().any(|c| c == name.as_str()))
                .cloned()
                .collect();
            df.select(rest)
        })?;
        Ok(outputs)
    }
}

// =============================================================================
// K-fold split
// =============================================================================

/// Decides which rows form the test set of each fold.
pub trait Partitioner: Send + Sync {
    /// Test-row indices for each of `folds` folds over `rows` rows.
    ///
    /// Every row must appear in exactly one fold.
    fn test_folds(&self, rows: usize, folds: usize) -> Vec<Vec<usize>>;
}

impl<P: Partitioner + ?Sized> Partitioner for Arc<P> {
    fn test_folds(&self, rows: usize, folds: usize) -> Vec<Vec<usize>> {
        (**self).test_folds(rows, folds)
    }
}

/// Consecutive blocks of rows; the first `rows % folds` folds get one extra row.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContiguousFolds;

impl Partitioner for ContiguousFolds {
    fn test_folds(&self, rows: usize, folds: usize) -> Vec<Vec<usize>> {
        contiguous((0..rows).collect(), folds)
    }
}

/// Rows shuffled with a seeded generator, then cut into contiguous folds.
/// Indices within a fold are sorted, so output rows keep their input order.
#[derive(Debug, Clone, Copy)]
pub struct ShuffledFolds {
    pub seed: u64,
}

impl ShuffledFolds {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl Partitioner for ShuffledFolds {
    fn test_folds(&self, rows: usize, folds: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..rows).collect();
        let mut rng = StdRng::seed_from_u64(self.seed);
        order.shuffle(&mut rng);
        let mut parts = contiguous(order, folds);
        for part in &mut parts {
            part.sort_unstable();
        }
        parts
    }
}

fn contiguous(order: Vec<usize>, folds: usize) -> Vec<Vec<usize>> {
    let base = order.len() / folds;
    let extra = order.len() % folds;
    let mut parts = Vec::with_capacity(folds);
    let mut rest = order.as_slice();
    for fold in 0..folds {
        let size = base + usize::from(fold < extra);
        let (head, tail) = rest.split_at(size);
        parts.push(head.to_vec());
        rest = tail;
    }
    parts
}

/// Splits `n_arrays` aligned tables into train/test pairs for each fold.
///
/// Inputs are `in0 .. in{n-1}`; outputs are `train{i}_{f}` and `test{i}_{f}`
/// for array `i` and fold `f`. All inputs must have the same number of rows.
#[derive(Clone)]
pub struct KFold {
    n_arrays: usize,
    folds: usize,
    partitioner: Arc<dyn Partitioner>,
}

impl KFold {
    pub fn new(n_arrays: usize, folds: usize, partitioner: impl Partitioner + 'static) -> Self {
        Self {
            n_arrays,
            folds,
            partitioner: Arc::new(partitioner),
        }
    }

    /// Rows in file order, no shuffling.
    pub fn contiguous(n_arrays: usize, folds: usize) -> Self {
        Self::new(n_arrays, folds, ContiguousFolds)
    }

    pub fn shuffled(n_arrays: usize, folds: usize, seed: u64) -> Self {
        Self::new(n_arrays, folds, ShuffledFolds::new(seed))
    }

    pub fn input_key(array: usize) -> String {
        format!("in{array}")
    }

    pub fn train_key(array: usize, fold: usize) -> String {
        format!("train{array}_{fold}")
    }

    pub fn test_key(array: usize, fold: usize) -> String {
        format!("test{array}_{fold}")
    }
}

impl std::fmt::Debug for KFold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KFold")
            .field("n_arrays", &self.n_arrays)
            .field("folds", &self.folds)
            .finish_non_exhaustive()
    }
}

/// Check that `test_folds` splits `0..rows` into `folds` non-empty,
/// non-overlapping sets.
fn check_partition(
    test_folds: &[Vec<usize>],
    rows: usize,
    folds: usize,
) -> std::result::Result<(), String> {
    if test_folds.len() != folds {
        return Err(format!(
            "partitioner returned {} folds, expected {}",
            test_folds.len(),
            folds
        ));
    }
    let mut seen = vec![false; rows];
    for (fold, test_rows) in test_folds.iter().enumerate() {
        if test_rows.is_empty() {
            return Err(format!("fold {fold} has no test rows"));
        }
        for &row in test_rows {
            let Some(slot) = seen.get_mut(row) else {
                return Err(format!("fold {fold} refers to row {row} of {rows}"));
            };
            if *slot {
                return Err(format!("row {row} is in more than one fold"));
            }
            *slot = true;
        }
    }
    if let Some(row) = seen.iter().position(|&s| !s) {
        return Err(format!("row {row} is in no fold"));
    }
    Ok(())
}

fn take_rows(df: &DataFrame, rows: &[usize]) -> PolarsResult<DataFrame> {
    let idx = IdxCa::from_vec(
        "idx".into(),
        rows.iter().map(|&r| r as IdxSize).collect(),
    );
    df.take(&idx)
}

impl Stage for KFold {
    fn input_keys(&self) -> Vec<String> {
        (0..self.n_arrays).map(Self::input_key).collect()
    }

    fn output_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(2 * self.n_arrays * self.folds);
        for array in 0..self.n_arrays {
            for fold in 0..self.folds {
                keys.push(Self::train_key(array, fold));
                keys.push(Self::test_key(array, fold));
            }
        }
        keys
    }

    fn run(
        &self,
        ctx: &RunContext,
        outputs_requested: &BTreeSet<String>,
        mut inputs: Inputs,
    ) -> Result<Outputs> {
        let tables = (0..self.n_arrays)
            .map(|i| inputs.take(&Self::input_key(i))?.to_table(ctx.storage()))
            .collect::<Result<Vec<_>>>()?;

        let rows = tables.first().map_or(0, DataFrame::height);
        if let Some(i) = tables.iter().position(|t| t.height() != rows) {
            return Err(FlowError::stage_failed(
                self.name(),
                format!(
                    "input '{}' has {} rows but 'in0' has {}",
                    Self::input_key(i),
                    tables[i].height(),
                    rows
                ),
            ));
        }
        if self.folds < 2 || self.folds > rows {
            return Err(FlowError::stage_failed(
                self.name(),
                format!("cannot cut {} rows into {} folds", rows, self.folds),
            ));
        }

        let test_folds = self.partitioner.test_folds(rows, self.folds);
        check_partition(&test_folds, rows, self.folds)
            .map_err(|reason| FlowError::stage_failed(self.name(), reason))?;
        let mut outputs = Outputs::new();
        for (fold, test_rows) in test_folds.iter().enumerate() {
            let in_test: BTreeSet<usize> = test_rows.iter().copied().collect();
            let train_rows: Vec<usize> = (0..rows).filter(|r| !in_test.contains(r)).collect();
            debug!(
                "Fold {}: {} train rows, {} test rows",
                fold,
                train_rows.len(),
                test_rows.len()
            );
            for (array, table) in tables.iter().enumerate() {
                emit_table(&mut outputs, outputs_requested, &Self::train_key(array, fold), || {
                    take_rows(table, &train_rows)
                })?;
                emit_table(&mut outputs, outputs_requested, &Self::test_key(array, fold), || {
                    take_rows(table, test_rows)
                })?;
            }
        }
        Ok(outputs)
    }
}
