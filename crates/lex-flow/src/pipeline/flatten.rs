//! Meta-stage expansion.
//!
//! Flattening walks the pipeline in insertion order. Runnable nodes are
//! copied; meta nodes are expanded and their sub-pipelines flattened in
//! place, recursively. Edges attached to a meta node's ports are rewired to
//! the matching ports of its entry (inputs) or exit (outputs) node.

use super::graph::{Pipeline, PortRef};
use crate::error::{FlowError, Result, ResultExt};
use crate::stage::{Stage, StageKind};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// A runnable stage in the expanded graph.
pub(crate) struct FlatNode {
    pub stage: Arc<dyn Stage>,
    /// Stage name, prefixed by the names of enclosing meta stages.
    pub label: String,
}

pub(crate) type FlatPort = (usize, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FlatEdge {
    pub from: FlatPort,
    pub to: FlatPort,
}

/// Where a node of the original pipeline ended up.
#[derive(Debug, Clone)]
pub(crate) enum Placement {
    Runnable(usize),
    Meta {
        entry: Box<Placement>,
        exit: Box<Placement>,
    },
}

impl Placement {
    fn input(&self, key: &str) -> FlatPort {
        match self {
            Self::Runnable(index) => (*index, key.to_string()),
            Self::Meta { entry, .. } => entry.input(key),
        }
    }

    fn output(&self, key: &str) -> FlatPort {
        match self {
            Self::Runnable(index) => (*index, key.to_string()),
            Self::Meta { exit, .. } => exit.output(key),
        }
    }
}

/// The pipeline with every meta stage expanded.
pub(crate) struct FlatGraph {
    pub nodes: Vec<FlatNode>,
    pub edges: Vec<FlatEdge>,
    /// Placement of each top-level node, indexed by `NodeId`.
    pub placements: Vec<Placement>,
}

impl FlatGraph {
    pub fn build(pipeline: &Pipeline) -> Result<Self> {
        let mut graph = FlatGraph {
            nodes: Vec::new(),
            edges: Vec::new(),
            placements: Vec::new(),
        };
        let max_depth = pipeline.config.max_expansion_depth;
        graph.placements = graph.splice(pipeline, "", 0, max_depth)?;

        let mut producers = HashSet::new();
        for edge in &graph.edges {
            if !producers.insert(&edge.to) {
                return Err(FlowError::graph(format!(
                    "Input '{}' of stage '{}' has more than one producer after expansion",
                    edge.to.1, graph.nodes[edge.to.0].label
                )));
            }
        }
        Ok(graph)
    }

    /// Resolve an output port of a top-level node to the expanded graph.
    pub fn output_port(&self, port: &PortRef) -> FlatPort {
        self.placements[port.node.0].output(&port.key)
    }

    fn splice(
        &mut self,
        pipeline: &Pipeline,
        prefix: &str,
        depth: usize,
        max_depth: usize,
    ) -> Result<Vec<Placement>> {
        let mut placements = Vec::with_capacity(pipeline.nodes.len());

        for kind in &pipeline.nodes {
            let label = format!("{prefix}{}", kind.name());
            match kind {
                StageKind::Runnable(stage) => {
                    self.nodes.push(FlatNode {
                        stage: stage.clone(),
                        label,
                    });
                    placements.push(Placement::Runnable(self.nodes.len() - 1));
                }
                StageKind::Meta(meta) => {
                    if depth + 1 > max_depth {
                        return Err(FlowError::graph(format!(
                            "Expanding '{label}' exceeds the maximum expansion depth of {max_depth}"
                        )));
                    }
                    let expansion = meta
                        .expand()
                        .context(format!("Failed to expand meta stage '{label}'"))?;
                    let inner = &expansion.pipeline;

                    let entry = inner.stage(expansion.entry).ok_or_else(|| {
                        FlowError::graph(format!("Entry node of '{label}' is not in its pipeline"))
                    })?;
                    let exit = inner.stage(expansion.exit).ok_or_else(|| {
                        FlowError::graph(format!("Exit node of '{label}' is not in its pipeline"))
                    })?;
                    let entry_inputs = entry.input_keys();
                    if let Some(key) = kind.input_keys().into_iter().find(|k| !entry_inputs.contains(k)) {
                        return Err(FlowError::graph(format!(
                            "Input '{key}' of '{label}' is not an input of entry stage '{}'",
                            entry.name()
                        )));
                    }
                    let exit_outputs = exit.output_keys();
                    if let Some(key) = kind.output_keys().into_iter().find(|k| !exit_outputs.contains(k)) {
                        return Err(FlowError::graph(format!(
                            "Output '{key}' of '{label}' is not an output of exit stage '{}'",
                            exit.name()
                        )));
                    }

                    let before = self.nodes.len();
                    let inner_placements =
                        self.splice(inner, &format!("{label}/"), depth + 1, max_depth)?;
                    debug!(
                        "Expanded {} into {} stages",
                        label,
                        self.nodes.len() - before
                    );
                    placements.push(Placement::Meta {
                        entry: Box::new(inner_placements[expansion.entry.0].clone()),
                        exit: Box::new(inner_placements[expansion.exit.0].clone()),
                    });
                }
            }
        }

        for edge in &pipeline.edges {
            self.edges.push(FlatEdge {
                from: placements[edge.from.node.0].output(&edge.from.key),
                to: placements[edge.to.node.0].input(&edge.to.key),
            });
        }

        Ok(placements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::context::RunContext;
    use crate::pipeline::NodeId;
    use crate::stage::{Expansion, Inputs, MetaStage, Outputs};
    use std::collections::BTreeSet;

    struct Pass;

    impl Stage for Pass {
        fn input_keys(&self) -> Vec<String> {
            vec!["in".to_string()]
        }

        fn output_keys(&self) -> Vec<String> {
            vec!["out".to_string()]
        }

        fn run(&self, _: &RunContext, _: &BTreeSet<String>, _: Inputs) -> Result<Outputs> {
            Ok(Outputs::new())
        }
    }

    /// Two chained `Pass` stages behind one port pair.
    struct Chain;

    impl MetaStage for Chain {
        fn input_keys(&self) -> Vec<String> {
            vec!["in".to_string()]
        }

        fn output_keys(&self) -> Vec<String> {
            vec!["out".to_string()]
        }

        fn expand(&self) -> Result<Expansion> {
            let mut pipeline = Pipeline::new();
            let first = pipeline.add(Pass);
            let second = pipeline.add(Pass);
            pipeline.connect(first.port("out"), second.port("in"))?;
            Ok(Expansion {
                pipeline,
                entry: first,
                exit: second,
            })
        }
    }

    /// Wraps a `Chain`, so expanding it needs two levels.
    struct Nested;

    impl MetaStage for Nested {
        fn input_keys(&self) -> Vec<String> {
            vec!["in".to_string()]
        }

        fn output_keys(&self) -> Vec<String> {
            vec!["out".to_string()]
        }

        fn expand(&self) -> Result<Expansion> {
            let mut pipeline = Pipeline::new();
            let chain = pipeline.add_meta(Chain);
            Ok(Expansion {
                pipeline,
                entry: chain,
                exit: chain,
            })
        }
    }

    #[test]
    fn test_meta_stage_is_spliced_in_place() {
        let mut pipeline = Pipeline::new();
        let source = pipeline.add(Pass);
        let chain = pipeline.add_meta(Chain);
        let sink = pipeline.add(Pass);
        pipeline.connect(source.port("out"), chain.port("in")).unwrap();
        pipeline.connect(chain.port("out"), sink.port("in")).unwrap();

        let flat = FlatGraph::build(&pipeline).unwrap();
        let labels: Vec<&str> = flat.nodes.iter().map(|n| n.label.as_str()).collect();
        assert_eq!(labels, vec!["Pass", "Chain/Pass", "Chain/Pass", "Pass"]);
        assert_eq!(
            flat.edges,
            vec![
                FlatEdge {
                    from: (1, "out".to_string()),
                    to: (2, "in".to_string())
                },
                FlatEdge {
                    from: (0, "out".to_string()),
                    to: (1, "in".to_string())
                },
                FlatEdge {
                    from: (2, "out".to_string()),
                    to: (3, "in".to_string())
                },
            ]
        );
        assert_eq!(flat.output_port(&chain.port("out")), (2, "out".to_string()));
    }

    #[test]
    fn test_nested_expansion_respects_depth() {
        let mut pipeline = Pipeline::new();
        pipeline.add_meta(Nested);
        let flat = FlatGraph::build(&pipeline).unwrap();
        assert_eq!(flat.nodes.len(), 2);
        assert_eq!(flat.nodes[0].label, "Nested/Chain/Pass");

        let config = PipelineConfig::builder().max_expansion_depth(1).build().unwrap();
        let mut shallow = Pipeline::with_config(config);
        shallow.add_meta(Nested);
        assert!(FlatGraph::build(&shallow).err().unwrap().is_graph_error());
    }

    struct BadEntry;

    impl MetaStage for BadEntry {
        fn input_keys(&self) -> Vec<String> {
            vec!["data".to_string()]
        }

        fn output_keys(&self) -> Vec<String> {
            vec!["out".to_string()]
        }

        fn expand(&self) -> Result<Expansion> {
            let mut pipeline = Pipeline::new();
            let only = pipeline.add(Pass);
            Ok(Expansion {
                pipeline,
                entry: only,
                exit: NodeId(only.index()),
            })
        }
    }

    #[test]
    fn test_meta_ports_must_exist_on_entry_and_exit() {
        let mut pipeline = Pipeline::new();
        pipeline.add_meta(BadEntry);
        assert!(FlatGraph::build(&pipeline).err().unwrap().is_graph_error());
    }
}
