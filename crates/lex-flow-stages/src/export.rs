//! Sink stages. Both have side effects and produce no outputs.

use crate::utils::keys;
use lex_flow::{Inputs, Outputs, Result, RunContext, Stage};
use parking_lot::Mutex;
use polars::prelude::DataFrame;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const IN: &str = "in";

/// Writes `in` to a CSV file with a header row.
#[derive(Debug, Clone)]
pub struct CsvWrite {
    path: PathBuf,
}

impl CsvWrite {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Stage for CsvWrite {
    fn input_keys(&self) -> Vec<String> {
        keys([IN])
    }

    fn output_keys(&self) -> Vec<String> {
        Vec::new()
    }

    fn has_side_effects(&self) -> bool {
        true
    }

    fn run(&self, ctx: &RunContext, _: &BTreeSet<String>, mut inputs: Inputs) -> Result<Outputs> {
        inputs.take(IN)?.to_csv(ctx.storage(), &self.path)?;
        info!("Wrote {}", self.path.display());
        Ok(Outputs::new())
    }
}

/// Shared slot that receives the table captured by a [`TableWrite`].
#[derive(Debug, Clone, Default)]
pub struct TableSink {
    slot: Arc<Mutex<Option<DataFrame>>>,
}

impl TableSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last captured table, leaving the sink empty.
    pub fn take(&self) -> Option<DataFrame> {
        self.slot.lock().take()
    }

    pub fn get(&self) -> Option<DataFrame> {
        self.slot.lock().clone()
    }

    fn put(&self, df: DataFrame) {
        *self.slot.lock() = Some(df);
    }
}

/// Captures `in` as a table into a [`TableSink`] held by the caller.
#[derive(Debug, Clone)]
pub struct TableWrite {
    sink: TableSink,
}

impl TableWrite {
    pub fn new() -> Self {
        Self::with_sink(TableSink::new())
    }

    pub fn with_sink(sink: TableSink) -> Self {
        Self { sink }
    }

    /// Handle to read the captured table after the run.
    pub fn sink(&self) -> TableSink {
        self.sink.clone()
    }
}

impl Default for TableWrite {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for TableWrite {
    fn input_keys(&self) -> Vec<String> {
        keys([IN])
    }

    fn output_keys(&self) -> Vec<String> {
        Vec::new()
    }

    fn has_side_effects(&self) -> bool {
        true
    }

    fn run(&self, ctx: &RunContext, _: &BTreeSet<String>, mut inputs: Inputs) -> Result<Outputs> {
        let df = inputs.take(IN)?.to_table(ctx.storage())?;
        self.sink.put(df);
        Ok(Outputs::new())
    }
}
