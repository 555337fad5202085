//! Source stages: bring tables into a pipeline.

use crate::utils::keys;
use lex_flow::{ConnParams, FlowError, Inputs, Outputs, Result, RunContext, Stage, UObject};
use polars::prelude::DataFrame;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::debug;

const OUT: &str = "out";

/// Emits a fixed in-memory table on `out`.
#[derive(Debug, Clone)]
pub struct TableRead {
    df: DataFrame,
}

impl TableRead {
    pub fn new(df: DataFrame) -> Self {
        Self { df }
    }
}

impl Stage for TableRead {
    fn input_keys(&self) -> Vec<String> {
        Vec::new()
    }

    fn output_keys(&self) -> Vec<String> {
        keys([OUT])
    }

    fn run(&self, _ctx: &RunContext, _: &BTreeSet<String>, _inputs: Inputs) -> Result<Outputs> {
        Ok(Outputs::from([(OUT.to_string(), UObject::table(self.df.clone()))]))
    }
}

/// Reads a CSV file with a header row onto `out`.
#[derive(Debug, Clone)]
pub struct CsvRead {
    path: PathBuf,
}

impl CsvRead {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Stage for CsvRead {
    fn input_keys(&self) -> Vec<String> {
        Vec::new()
    }

    fn output_keys(&self) -> Vec<String> {
        keys([OUT])
    }

    fn run(&self, _ctx: &RunContext, _: &BTreeSet<String>, _inputs: Inputs) -> Result<Outputs> {
        let mut out = UObject::writer();
        out.from_csv(&self.path)?;
        debug!("Read {}", self.path.display());
        Ok(Outputs::from([(OUT.to_string(), out)]))
    }
}

/// Exposes existing tables of a database, one output port per table.
///
/// Outputs are references; no rows are read until a consumer converts them.
#[derive(Debug, Clone)]
pub struct SqlRead {
    db_url: String,
    conn_params: ConnParams,
    tables: Vec<String>,
}

impl SqlRead {
    pub fn new<I, S>(db_url: impl Into<String>, conn_params: ConnParams, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            db_url: db_url.into(),
            conn_params,
            tables: keys(tables),
        }
    }
}

impl Stage for SqlRead {
    fn input_keys(&self) -> Vec<String> {
        Vec::new()
    }

    fn output_keys(&self) -> Vec<String> {
        self.tables.clone()
    }

    fn run(
        &self,
        ctx: &RunContext,
        outputs_requested: &BTreeSet<String>,
        _inputs: Inputs,
    ) -> Result<Outputs> {
        let conn = ctx.storage().pool().acquire(&self.db_url, &self.conn_params)?;
        let mut outputs = Outputs::new();
        for table in self.tables.iter().filter(|t| outputs_requested.contains(*t)) {
            if !conn.has_table(table) {
                return Err(FlowError::stage_failed(
                    self.name(),
                    format!("table '{}' not found in {}", table, self.db_url),
                ));
            }
            let mut out = UObject::writer();
            out.from_relational(&self.db_url, self.conn_params.clone(), table, false)?;
            outputs.insert(table.clone(), out);
        }
        Ok(outputs)
    }
}
