//! Stage Library for lex-flow Pipelines
//!
//! Concrete stages built on the public [`lex_flow`] API.
//!
//! # Overview
//!
//! - [`fetch`]: bring tables in from memory, CSV files or a database
//! - [`export`]: write tables out (side-effecting)
//! - [`transform`]: column rewrites, row and column splits, SQL, closures
//! - [`model`]: cross-validation and grid search over user-supplied estimators
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use lex_flow::Pipeline;
//! use lex_flow_stages::{CsvRead, CsvWrite, Query};
//!
//! let mut p = Pipeline::new();
//! let read = p.add(CsvRead::new("people.csv"));
//! let adults = p.add(Query::new("age >= 18")?);
//! let write = p.add(CsvWrite::new("adults.csv"));
//! p.connect(read.port("out"), adults.port("in"))?;
//! p.connect(adults.port("out"), write.port("in"))?;
//!
//! // CsvWrite has side effects, so it runs without being requested.
//! p.run(None)?;
//! ```

pub mod export;
pub mod fetch;
pub mod model;
pub mod transform;
pub mod utils;

// Re-exports for convenient access
pub use export::{CsvWrite, TableSink, TableWrite};
pub use fetch::{CsvRead, SqlRead, TableRead};
pub use model::{CrossValidationScore, EstimatorFactory, GridSearch};
pub use transform::{
    ContiguousFolds, FillNa, Identity, KFold, LabelEncode, Lambda, LambdaInputs, Partitioner,
    Query, RenameCols, RunSql, ShuffledFolds, SplitColumns, Timify,
};
