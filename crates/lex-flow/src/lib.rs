//! Stage Graph Library
//!
//! Build directed pipelines of data-processing stages that exchange tables
//! through a write-once, read-once intermediate value, then run them in
//! dependency order.
//!
//! # Overview
//!
//! - **Intermediate values**: [`UObject`] holds exactly one payload (columnar
//!   table, relational table reference, or external file path) and converts
//!   it on demand when read.
//! - **Stages**: anything implementing [`Stage`] (or [`MetaStage`], backed by
//!   its own sub-pipeline) with named input and output ports.
//! - **Scheduling**: [`Pipeline::run`] orders stages topologically, asks each
//!   one only for the outputs somebody consumes, and hands every value to its
//!   consumers as independent copies.
//! - **Storage**: relational references are served by a [`RelationalBackend`];
//!   the built-in [`CatalogBackend`] runs SQL through Polars.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use lex_flow::{Pipeline, PipelineConfig};
//!
//! let mut pipeline = Pipeline::with_config(PipelineConfig::default());
//! let read = pipeline.add(CsvRead::new("employees.csv"));
//! let clean = pipeline.add(FillNa::new(0.0));
//! pipeline.connect(read.port("out"), clean.port("in"))?;
//!
//! let mut outputs = pipeline.run(Some(&[clean.port("out")]))?;
//! let ctx = lex_flow::RunContext::default();
//! let table = outputs.take(&clean.port("out")).unwrap().to_table(ctx.storage())?;
//! ```
//!
//! # Progress Reporting
//!
//! ```rust,ignore
//! pipeline.on_progress(|update| {
//!     println!("[{:?}] {}", update.event, update.message);
//! });
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod ids;
pub mod pipeline;
pub mod stage;
pub mod storage;
pub mod uobject;

// Re-exports for convenient access
pub use config::{
    ConfigValidationError, HandoffMode, PipelineConfig, PipelineConfigBuilder, SideEffectPolicy,
};
pub use context::RunContext;
pub use error::{ErrorKind, FlowError, Result, ResultExt};
pub use ids::{IdGenerator, SequentialIdGenerator, UuidIdGenerator};
pub use pipeline::{
    ClosureProgressReporter, Edge, NodeId, Pipeline, PortRef, ProgressReporter, ProgressUpdate,
    RunEvent, RunOutputs,
};
pub use stage::{Expansion, Inputs, MetaStage, Outputs, Stage, StageKind};
pub use storage::{
    CatalogBackend, ConnParams, Connection, ConnectionPool, RelationalBackend, SqlTableInfo,
    StorageContext,
};
pub use uobject::{
    Mapping, Phase, RelationalRef, RelationalRequest, StorageMethod, TargetFormat, UObject,
};
