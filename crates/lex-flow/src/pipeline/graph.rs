//! Pipeline graph construction: nodes, ports and edges.

use super::progress::{ClosureProgressReporter, ProgressReporter, ProgressUpdate};
use crate::config::PipelineConfig;
use crate::error::{FlowError, Result};
use crate::stage::{MetaStage, Stage, StageKind};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Handle to a node of a [`Pipeline`], in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// The port `key` on this node.
    pub fn port(self, key: impl Into<String>) -> PortRef {
        PortRef {
            node: self,
            key: key.into(),
        }
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named port on a node. Direction follows from where it is used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PortRef {
    pub node: NodeId,
    pub key: String,
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.key)
    }
}

/// Connection from an output port to an input port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub from: PortRef,
    pub to: PortRef,
}

/// A directed graph of stages connected through named ports.
pub struct Pipeline {
    pub(crate) config: PipelineConfig,
    pub(crate) nodes: Vec<StageKind>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) reporter: Option<Arc<dyn ProgressReporter>>,
}

static_assertions::assert_impl_all!(Pipeline: Send);

impl Pipeline {
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
            edges: Vec::new(),
            reporter: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Register a runnable stage.
    pub fn add(&mut self, stage: impl Stage + 'static) -> NodeId {
        self.push(StageKind::Runnable(Arc::new(stage)))
    }

    /// Register a meta stage. It is expanded when the pipeline runs.
    pub fn add_meta(&mut self, stage: impl MetaStage + 'static) -> NodeId {
        self.push(StageKind::Meta(Arc::new(stage)))
    }

    /// Register a stage held elsewhere. Adding the same instance twice is a
    /// graph error.
    pub fn add_shared(&mut self, stage: StageKind) -> Result<NodeId> {
        if let Some(existing) = self.nodes.iter().position(|n| n.same_instance(&stage)) {
            return Err(FlowError::graph(format!(
                "Stage '{}' is already node #{}",
                stage.name(),
                existing
            )));
        }
        Ok(self.push(stage))
    }

    fn push(&mut self, stage: StageKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        debug!("Added stage {} as node {}", stage.name(), id);
        self.nodes.push(stage);
        id
    }

    /// Connect output port `from` to input port `to`.
    ///
    /// Fails when either port is not declared by its stage, when `to` already
    /// has a producer, or when both ports are on the same node. Longer cycles
    /// are reported when the pipeline runs.
    pub fn connect(&mut self, from: PortRef, to: PortRef) -> Result<()> {
        let producer = self.node(from.node)?;
        if !producer.output_keys().contains(&from.key) {
            return Err(FlowError::graph(format!(
                "Stage '{}' has no output '{}'",
                producer.name(),
                from.key
            )));
        }
        let consumer = self.node(to.node)?;
        if !consumer.input_keys().contains(&to.key) {
            return Err(FlowError::graph(format!(
                "Stage '{}' has no input '{}'",
                consumer.name(),
                to.key
            )));
        }
        if from.node == to.node {
            return Err(FlowError::graph(format!(
                "Connecting {from} to {to} would make stage '{}' feed itself",
                producer.name()
            )));
        }
        if let Some(existing) = self.edges.iter().find(|e| e.to == to) {
            return Err(FlowError::graph(format!(
                "Input {to} is already connected to {}",
                existing.from
            )));
        }
        debug!("Connected {} -> {}", from, to);
        self.edges.push(Edge { from, to });
        Ok(())
    }

    fn node(&self, id: NodeId) -> Result<&StageKind> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| FlowError::graph(format!("Unknown node {id}")))
    }

    /// Receive a [`ProgressUpdate`] for every run event.
    pub fn on_progress<F>(&mut self, callback: F)
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.reporter = Some(Arc::new(ClosureProgressReporter::new(callback)));
    }

    pub fn set_progress_reporter(&mut self, reporter: Arc<dyn ProgressReporter>) {
        self.reporter = Some(reporter);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn stage(&self, id: NodeId) -> Option<&StageKind> {
        self.nodes.get(id.0)
    }

    pub fn stage_name(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(id.0).map(StageKind::name)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field(
                "nodes",
                &self.nodes.iter().map(StageKind::name).collect::<Vec<_>>(),
            )
            .field("edges", &self.edges)
            .finish_non_exhaustive()
    }
}
