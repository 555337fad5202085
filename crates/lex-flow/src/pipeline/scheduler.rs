//! Pipeline execution.
//!
//! A run proceeds in four steps:
//!
//! 1. Expand meta stages ([`FlatGraph`]).
//! 2. Order the expanded nodes topologically. Ready nodes run in insertion
//!    order; a cycle aborts the run before any stage executes.
//! 3. Walk the order backwards to find, for each node, the outputs someone
//!    needs: a requested final port or the input of a node that runs.
//! 4. Run each node with its demand set and hand every produced value to its
//!    consumers, one independent Read-phase copy per consumer.

use super::flatten::{FlatGraph, FlatPort};
use super::graph::{Pipeline, PortRef};
use super::progress::{ProgressUpdate, RunEvent};
use crate::config::{HandoffMode, PipelineConfig, SideEffectPolicy};
use crate::context::RunContext;
use crate::error::{FlowError, Result};
use crate::stage::{Inputs, Outputs};
use crate::uobject::{Phase, UObject};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, info, info_span, warn};

/// Values delivered to the requested final ports of a run.
#[derive(Debug, Default)]
pub struct RunOutputs {
    values: BTreeMap<PortRef, UObject>,
}

impl RunOutputs {
    /// Remove the Read-phase value delivered to `port`.
    pub fn take(&mut self, port: &PortRef) -> Option<UObject> {
        self.values.remove(port)
    }

    pub fn get(&self, port: &PortRef) -> Option<&UObject> {
        self.values.get(port)
    }

    pub fn ports(&self) -> impl Iterator<Item = &PortRef> {
        self.values.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Container files written during a persisted hand-off. Removed on drop.
struct ScratchFiles(Vec<PathBuf>);

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in self.0.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove scratch file {}: {}", path.display(), e);
            }
        }
    }
}

/// Where a produced value has to go.
struct Delivery {
    consumers: Vec<FlatPort>,
    finals: Vec<PortRef>,
}

impl Pipeline {
    /// Run the pipeline with a fresh [`RunContext`].
    ///
    /// `requested` lists the output ports whose values the caller wants
    /// back. With `None`, only stages with side effects and their upstream
    /// stages run.
    pub fn run(&self, requested: Option<&[PortRef]>) -> Result<RunOutputs> {
        let ctx = RunContext::from_config(&self.config);
        self.run_with(&ctx, requested)
    }

    /// Run the pipeline with services owned by the caller.
    ///
    /// Relational outputs stay convertible for as long as `ctx` lives.
    pub fn run_with(&self, ctx: &RunContext, requested: Option<&[PortRef]>) -> Result<RunOutputs> {
        let graph = FlatGraph::build(self)?;
        let order = topological_order(&graph)?;

        let mut finals: HashMap<FlatPort, Vec<PortRef>> = HashMap::new();
        for port in requested.unwrap_or_default() {
            let stage = self.stage(port.node).ok_or_else(|| {
                FlowError::graph(format!("Requested output {port} is on an unknown node"))
            })?;
            if !stage.output_keys().contains(&port.key) {
                return Err(FlowError::graph(format!(
                    "Requested output {port}: stage '{}' has no output '{}'",
                    stage.name(),
                    port.key
                )));
            }
            finals
                .entry(graph.output_port(port))
                .or_default()
                .push(port.clone());
        }

        let demand = compute_demand(&graph, &order, &finals, &self.config);
        let total = order.len();
        info!("Running pipeline: {} stages after expansion", total);
        self.report(ProgressUpdate::started(total));

        let mut executor = Executor {
            graph: &graph,
            config: &self.config,
            ctx,
            demand: &demand,
            finals: &finals,
            pending: HashMap::new(),
            results: BTreeMap::new(),
            scratch: ScratchFiles(Vec::new()),
        };

        for (position, &node) in order.iter().enumerate() {
            let label = &graph.nodes[node].label;
            let Some(wanted) = &demand[node] else {
                debug!("Skipping {}: no output is needed", label);
                self.report(ProgressUpdate::stage(
                    RunEvent::StageSkipped,
                    node,
                    label.as_str(),
                    position + 1,
                    total,
                ));
                continue;
            };

            self.report(ProgressUpdate::stage(
                RunEvent::StageStarted,
                node,
                label.as_str(),
                position,
                total,
            ));
            if let Err(e) = executor.execute(node, wanted) {
                warn!("Pipeline aborted at {}: {}", label, e);
                self.report(ProgressUpdate::failed(position, total, e.to_string()));
                return Err(e);
            }
            self.report(ProgressUpdate::stage(
                RunEvent::StageCompleted,
                node,
                label.as_str(),
                position + 1,
                total,
            ));
        }

        info!("Pipeline completed");
        self.report(ProgressUpdate::completed(total));
        Ok(RunOutputs {
            values: executor.results,
        })
    }

    fn report(&self, update: ProgressUpdate) {
        if let Some(reporter) = &self.reporter {
            reporter.report(update);
        }
    }
}

/// Kahn's algorithm with an insertion-order tie-break.
fn topological_order(graph: &FlatGraph) -> Result<Vec<usize>> {
    let n = graph.nodes.len();
    let mut indegree = vec![0usize; n];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for edge in &graph.edges {
        indegree[edge.to.0] += 1;
        successors[edge.from.0].push(edge.to.0);
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| indegree[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &next in &successors[node] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() < n {
        let stuck: Vec<&str> = (0..n)
            .filter(|&i| indegree[i] > 0)
            .map(|i| graph.nodes[i].label.as_str())
            .collect();
        return Err(FlowError::graph(format!(
            "Pipeline contains a cycle through: {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

/// For each node, the output keys to request, or `None` if it does not run.
fn compute_demand(
    graph: &FlatGraph,
    order: &[usize],
    finals: &HashMap<FlatPort, Vec<PortRef>>,
    config: &PipelineConfig,
) -> Vec<Option<BTreeSet<String>>> {
    let mut needed: HashSet<FlatPort> = finals.keys().cloned().collect();
    let mut demand = vec![None; graph.nodes.len()];

    for &node in order.iter().rev() {
        let stage = &graph.nodes[node].stage;
        let wanted: BTreeSet<String> = stage
            .output_keys()
            .into_iter()
            .filter(|key| needed.contains(&(node, key.clone())))
            .collect();
        let forced =
            stage.has_side_effects() && config.side_effect_policy == SideEffectPolicy::AlwaysRun;
        if wanted.is_empty() && !forced {
            continue;
        }
        for edge in graph.edges.iter().filter(|e| e.to.0 == node) {
            needed.insert(edge.from.clone());
        }
        debug!("{} demand: {:?}", graph.nodes[node].label, wanted);
        demand[node] = Some(wanted);
    }
    demand
}

struct Executor<'a> {
    graph: &'a FlatGraph,
    config: &'a PipelineConfig,
    ctx: &'a RunContext,
    demand: &'a [Option<BTreeSet<String>>],
    finals: &'a HashMap<FlatPort, Vec<PortRef>>,
    pending: HashMap<usize, BTreeMap<String, UObject>>,
    results: BTreeMap<PortRef, UObject>,
    scratch: ScratchFiles,
}

impl Executor<'_> {
    fn execute(&mut self, node: usize, wanted: &BTreeSet<String>) -> Result<()> {
        let graph = self.graph;
        let flat = &graph.nodes[node];
        let span = info_span!("stage", name = %flat.label, node);
        let _guard = span.enter();

        let inputs = Inputs::new(
            flat.stage.name(),
            self.pending.remove(&node).unwrap_or_default(),
        );
        let outputs = flat
            .stage
            .run(self.ctx, wanted, inputs)
            .map_err(|e| e.with_context(format!("Stage '{}' failed", flat.label)))?;
        self.deliver(node, wanted, outputs)
    }

    fn deliver(&mut self, node: usize, wanted: &BTreeSet<String>, outputs: Outputs) -> Result<()> {
        let graph = self.graph;
        let flat = &graph.nodes[node];
        if let Some(key) = wanted.iter().find(|k| !outputs.contains_key(*k)) {
            return Err(FlowError::MissingOutput {
                stage: flat.label.clone(),
                key: key.clone(),
            });
        }

        let declared = flat.stage.output_keys();
        for (key, value) in outputs {
            if !declared.contains(&key) {
                warn!("{} returned undeclared output '{}'; dropping it", flat.label, key);
                continue;
            }
            if value.phase() != Phase::Write || !value.is_finalized() {
                return Err(FlowError::state(format!(
                    "Stage '{}' returned output '{}' that is not a finalized write-phase value",
                    flat.label, key
                )));
            }

            let port = (node, key);
            let delivery = self.delivery(&port);
            if delivery.consumers.is_empty() && delivery.finals.is_empty() {
                debug!("Dropping unrequested output {}.{}", flat.label, port.1);
                continue;
            }
            let mut copies = self.hand_off(value, delivery.consumers.len() + delivery.finals.len())?;

            for to in delivery.consumers {
                if let Some(copy) = copies.pop() {
                    debug!(
                        "Delivering {}.{} to {}.{}",
                        flat.label, port.1, graph.nodes[to.0].label, to.1
                    );
                    self.pending.entry(to.0).or_default().insert(to.1, copy);
                }
            }
            for final_port in delivery.finals {
                if let Some(copy) = copies.pop() {
                    self.results.insert(final_port, copy);
                }
            }
        }
        Ok(())
    }

    fn delivery(&self, port: &FlatPort) -> Delivery {
        let consumers = self
            .graph
            .edges
            .iter()
            .filter(|e| e.from == *port && self.demand[e.to.0].is_some())
            .map(|e| e.to.clone())
            .collect();
        let finals = self.finals.get(port).cloned().unwrap_or_default();
        Delivery { consumers, finals }
    }

    /// Turn one produced value into `copies` independent Read-phase values.
    fn hand_off(&mut self, value: UObject, copies: usize) -> Result<Vec<UObject>> {
        let mut out = Vec::with_capacity(copies);
        match self.config.handoff {
            HandoffMode::InMemory => {
                for _ in 1..copies {
                    out.push(value.share()?);
                }
                out.push(value.promote_to_read()?);
            }
            HandoffMode::Persisted => {
                let path = value.persist(&self.config.scratch_dir, self.ctx.storage().ids())?;
                self.scratch.0.push(path.clone());
                for _ in 0..copies {
                    out.push(UObject::open(&path)?);
                }
            }
        }
        Ok(out)
    }
}
