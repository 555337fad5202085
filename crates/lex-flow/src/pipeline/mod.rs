//! Pipeline module.
//!
//! This module provides the stage graph, meta-stage expansion and the
//! scheduler that runs it.

mod flatten;
mod graph;
pub mod progress;
mod scheduler;

pub use graph::{Edge, NodeId, Pipeline, PortRef};
pub use progress::{ClosureProgressReporter, ProgressReporter, ProgressUpdate, RunEvent};
pub use scheduler::RunOutputs;
