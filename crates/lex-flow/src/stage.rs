//! Stage and meta-stage contracts.
//!
//! A [`Stage`] maps the values on its input ports to values on the output
//! ports the scheduler asks for. A [`MetaStage`] exposes the same ports but is
//! backed by a sub-pipeline that the scheduler splices into the outer graph.

use crate::context::RunContext;
use crate::error::{FlowError, Result};
use crate::pipeline::{NodeId, Pipeline};
use crate::uobject::UObject;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Values produced by one stage invocation, keyed by output port.
pub type Outputs = BTreeMap<String, UObject>;

/// Last path segment of a type name, without generic arguments.
pub(crate) fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// A runnable pipeline node.
///
/// Implementations carry only constructor-time configuration; every call to
/// [`Stage::run`] is independent.
pub trait Stage: Send + Sync {
    /// Display name used in logs, progress updates and errors.
    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }

    fn input_keys(&self) -> Vec<String>;

    fn output_keys(&self) -> Vec<String>;

    /// Stages that write files or tables return `true`. Depending on the
    /// configured policy they run even when no output is needed.
    fn has_side_effects(&self) -> bool {
        false
    }

    /// Produce at least the outputs in `outputs_requested`.
    ///
    /// `inputs` holds one Read-phase value per connected input port. Returned
    /// values must be finalized Write-phase instances.
    fn run(
        &self,
        ctx: &RunContext,
        outputs_requested: &BTreeSet<String>,
        inputs: Inputs,
    ) -> Result<Outputs>;
}

/// The sub-pipeline a meta stage stands for.
pub struct Expansion {
    pub pipeline: Pipeline,
    /// Node whose input ports receive the meta stage's inputs.
    pub entry: NodeId,
    /// Node whose output ports provide the meta stage's outputs.
    pub exit: NodeId,
}

/// A node backed by an embedded pipeline.
pub trait MetaStage: Send + Sync {
    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }

    fn input_keys(&self) -> Vec<String>;

    fn output_keys(&self) -> Vec<String>;

    /// Build the sub-pipeline. Must return an equivalent graph on every call
    /// and must not touch anything outside it.
    fn expand(&self) -> Result<Expansion>;
}

/// The closed set of node variants a pipeline holds.
#[derive(Clone)]
pub enum StageKind {
    Runnable(Arc<dyn Stage>),
    Meta(Arc<dyn MetaStage>),
}

impl StageKind {
    pub fn name(&self) -> &str {
        match self {
            Self::Runnable(stage) => stage.name(),
            Self::Meta(stage) => stage.name(),
        }
    }

    pub fn input_keys(&self) -> Vec<String> {
        match self {
            Self::Runnable(stage) => stage.input_keys(),
            Self::Meta(stage) => stage.input_keys(),
        }
    }

    pub fn output_keys(&self) -> Vec<String> {
        match self {
            Self::Runnable(stage) => stage.output_keys(),
            Self::Meta(stage) => stage.output_keys(),
        }
    }

    pub fn is_meta(&self) -> bool {
        matches!(self, Self::Meta(_))
    }

    /// Whether both handles point at the same stage instance.
    pub fn same_instance(&self, other: &StageKind) -> bool {
        match (self, other) {
            (Self::Runnable(a), Self::Runnable(b)) => Arc::ptr_eq(a, b),
            (Self::Meta(a), Self::Meta(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Input values for one stage invocation.
pub struct Inputs {
    stage: String,
    values: BTreeMap<String, UObject>,
}

impl Inputs {
    pub fn new(stage: impl Into<String>, values: BTreeMap<String, UObject>) -> Self {
        Self {
            stage: stage.into(),
            values,
        }
    }

    /// Remove the value delivered to `key`. Fails when the port is unconnected.
    pub fn take(&mut self, key: &str) -> Result<UObject> {
        self.values.remove(key).ok_or_else(|| {
            FlowError::stage_failed(&self.stage, format!("input '{key}' is not connected"))
        })
    }

    pub fn take_optional(&mut self, key: &str) -> Option<UObject> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for Inputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inputs")
            .field("stage", &self.stage)
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}
