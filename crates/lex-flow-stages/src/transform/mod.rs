//! Table-to-table stages.
//!
//! - [`Identity`]: forward inputs unchanged
//! - [`RenameCols`], [`FillNa`], [`LabelEncode`], [`Timify`]: column rewrites
//! - [`SplitColumns`], [`Query`], [`KFold`]: split one table into several
//! - [`RunSql`]: SQL over relational references
//! - [`Lambda`]: wrap a function of tables

mod fill_na;
mod identity;
mod label_encode;
mod lambda;
pub mod query;
mod rename;
mod split;
mod sql;
mod timify;

pub use fill_na::FillNa;
pub use identity::Identity;
pub use label_encode::LabelEncode;
pub use lambda::{Lambda, LambdaInputs};
pub use query::Query;
pub use rename::RenameCols;
pub use split::{ContiguousFolds, KFold, Partitioner, ShuffledFolds, SplitColumns};
pub use sql::RunSql;
pub use timify::Timify;
