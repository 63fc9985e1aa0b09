//! Task graph construction.
//!
//! A [`Graph`] is built single-threaded through `&mut self`, then shared with
//! an [`Executor`](crate::Executor) behind an `Arc`. Structure is validated
//! lazily: the first run computes a [`Plan`] and caches it, including a
//! validation failure, until the graph is mutated again.
//!
//! Edges leaving a condition node are *weak*. They never count toward the
//! successor's dependency counter, and cycles through them are how loops are
//! expressed. Any cycle made only of strong edges is a construction error.

mod node;
pub(crate) mod validate;

pub use node::{NodeHandle, NodeKind};

pub(crate) use node::{FlowFn, Node, Work};

use crate::error::{Error, Result};
use crate::flow::{DeviceFlow, Subgraph};
use crate::gpu::DeviceId;
use std::fmt::{self, Write as _};
use std::sync::{Arc, OnceLock};

/// Scheduling data derived from a validated graph.
#[derive(Debug)]
pub(crate) struct Plan {
    pub sources: Vec<usize>,
    pub strong_in_degree: Vec<usize>,
}

#[derive(Default)]
pub struct Graph {
    label: String,
    nodes: Vec<Node>,
    num_edges: usize,
    plan: OnceLock<Result<Arc<Plan>>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named<S: Into<String>>(label: S) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Add a host node running `f` on a worker thread.
    pub fn add_node<F>(&mut self, mut f: F) -> NodeHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.push(Work::Host(Box::new(move || {
            f();
            Ok(())
        })))
    }

    /// Add a host node whose error is reported through the run's future.
    pub fn add_fallible_node<F>(&mut self, f: F) -> NodeHandle
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        self.push(Work::Host(Box::new(f)))
    }

    /// Add a condition node. The returned index selects which successor, in
    /// edge insertion order, runs next. An out-of-range index ends the branch.
    pub fn add_condition<F>(&mut self, f: F) -> NodeHandle
    where
        F: FnMut() -> usize + Send + 'static,
    {
        self.push(Work::Condition(Box::new(f)))
    }

    /// Add a device-flow node bound to device 0.
    pub fn add_device_flow<F>(&mut self, f: F) -> NodeHandle
    where
        F: for<'a> FnMut(&mut DeviceFlow<'a>) -> Result<()> + Send + 'static,
    {
        self.add_device_flow_on(DeviceId::default(), f)
    }

    /// Add a device-flow node whose operations default to `device`.
    ///
    /// Each time the node executes, the callback records into a fresh
    /// subgraph.
    pub fn add_device_flow_on<F>(&mut self, device: DeviceId, f: F) -> NodeHandle
    where
        F: for<'a> FnMut(&mut DeviceFlow<'a>) -> Result<()> + Send + 'static,
    {
        self.push(Work::DeviceFlow {
            callback: Box::new(f),
            subgraph: Subgraph::new(device),
        })
    }

    /// Add a device-flow node on device 0 whose subgraph outlives the run.
    pub fn add_device_flow_persistent<F>(&mut self, f: F) -> NodeHandle
    where
        F: for<'a> FnMut(&mut DeviceFlow<'a>) -> Result<()> + Send + 'static,
    {
        self.add_device_flow_persistent_on(DeviceId::default(), f)
    }

    /// Add a device-flow node whose subgraph is kept across runs.
    ///
    /// Once it has been instantiated, later executions see the same topology
    /// and the executable graph compiled from it. The callback should check
    /// [`DeviceFlow::state`] and only update parameters once the subgraph has
    /// left `Building`. An execution that fails before instantiation discards
    /// what it recorded.
    pub fn add_device_flow_persistent_on<F>(&mut self, device: DeviceId, f: F) -> NodeHandle
    where
        F: for<'a> FnMut(&mut DeviceFlow<'a>) -> Result<()> + Send + 'static,
    {
        self.push(Work::DeviceFlow {
            callback: Box::new(f),
            subgraph: Subgraph::persistent(device),
        })
    }

    fn push(&mut self, work: Work) -> NodeHandle {
        self.invalidate();
        self.nodes.push(Node::new(work));
        NodeHandle(self.nodes.len() - 1)
    }

    /// `from` must finish before `to` starts.
    pub fn add_edge(&mut self, from: NodeHandle, to: NodeHandle) -> Result<()> {
        self.check(from)?;
        self.check(to)?;
        if from == to {
            return Err(Error::construction(format!(
                "self-loop on node {}",
                self.nodes[from.0].label(from.0)
            )));
        }
        self.invalidate();
        self.nodes[from.0].successors.push(to.0);
        self.nodes[to.0].predecessors.push(from.0);
        self.num_edges += 1;
        Ok(())
    }

    pub fn precede<I>(&mut self, from: NodeHandle, to: I) -> Result<()>
    where
        I: IntoIterator<Item = NodeHandle>,
    {
        for t in to {
            self.add_edge(from, t)?;
        }
        Ok(())
    }

    pub fn succeed<I>(&mut self, to: NodeHandle, from: I) -> Result<()>
    where
        I: IntoIterator<Item = NodeHandle>,
    {
        for f in from {
            self.add_edge(f, to)?;
        }
        Ok(())
    }

    /// Attach a name. Metadata only.
    pub fn name<S: Into<String>>(&mut self, node: NodeHandle, name: S) -> Result<()> {
        self.check(node)?;
        self.nodes[node.0].name = name.into();
        Ok(())
    }

    pub fn node_name(&self, node: NodeHandle) -> Option<&str> {
        self.nodes.get(node.0).map(|n| n.name.as_str())
    }

    pub fn kind(&self, node: NodeHandle) -> Option<NodeKind> {
        self.nodes.get(node.0).map(|n| n.kind)
    }

    pub fn successors(&self, node: NodeHandle) -> impl Iterator<Item = NodeHandle> + '_ {
        self.nodes
            .get(node.0)
            .into_iter()
            .flat_map(|n| n.successors.iter().map(|&s| NodeHandle(s)))
    }

    pub fn predecessors(&self, node: NodeHandle) -> impl Iterator<Item = NodeHandle> + '_ {
        self.nodes
            .get(node.0)
            .into_iter()
            .flat_map(|n| n.predecessors.iter().map(|&p| NodeHandle(p)))
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every edge, grouped by source node in insertion order.
    pub fn edges(&self) -> Vec<(NodeHandle, NodeHandle)> {
        self.nodes
            .iter()
            .enumerate()
            .flat_map(|(i, n)| n.successors.iter().map(move |&s| (NodeHandle(i), NodeHandle(s))))
            .collect()
    }

    /// One `"from" -> "to"` line per edge; weak edges are marked.
    pub fn dump_edges(&self) -> String {
        let mut out = String::new();
        for (from, to) in self.edges() {
            let src = &self.nodes[from.0];
            let weak = if src.kind == NodeKind::Condition { " [weak]" } else { "" };
            let _ = writeln!(
                out,
                "\"{}\" -> \"{}\"{}",
                src.label(from.0),
                self.nodes[to.0].label(to.0),
                weak
            );
        }
        out
    }

    /// Inspect the subgraph of a device-flow node, e.g. between runs.
    pub fn with_subgraph<R>(&self, node: NodeHandle, f: impl FnOnce(&Subgraph) -> R) -> Option<R> {
        let node = self.nodes.get(node.0)?;
        let work = node.work.lock();
        match &*work {
            Work::DeviceFlow { subgraph, .. } => Some(f(subgraph)),
            _ => None,
        }
    }

    /// Check that the strong edges form a DAG.
    pub fn validate(&self) -> Result<()> {
        self.plan().map(|_| ())
    }

    pub(crate) fn plan(&self) -> Result<Arc<Plan>> {
        self.plan.get_or_init(|| self.build_plan()).clone()
    }

    pub(crate) fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    fn build_plan(&self) -> Result<Arc<Plan>> {
        let strong: Vec<(usize, usize)> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind != NodeKind::Condition)
            .flat_map(|(i, n)| n.successors.iter().map(move |&s| (i, s)))
            .collect();

        if let Err(stuck) = validate::topological_order(self.nodes.len(), &strong) {
            let names: Vec<String> = stuck
                .iter()
                .take(8)
                .map(|&i| self.nodes[i].label(i))
                .collect();
            return Err(Error::construction(format!(
                "cycle detected among {} node(s): {}",
                stuck.len(),
                names.join(", ")
            )));
        }

        let mut strong_in_degree = vec![0usize; self.nodes.len()];
        for &(_, to) in &strong {
            strong_in_degree[to] += 1;
        }
        let sources = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.predecessors.is_empty())
            .map(|(i, _)| i)
            .collect();

        Ok(Arc::new(Plan {
            sources,
            strong_in_degree,
        }))
    }

    fn check(&self, node: NodeHandle) -> Result<()> {
        if node.0 >= self.nodes.len() {
            return Err(Error::invalid_argument(format!(
                "node handle {} out of range ({} nodes)",
                node.0,
                self.nodes.len()
            )));
        }
        Ok(())
    }

    fn invalidate(&mut self) {
        self.plan = OnceLock::new();
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("label", &self.label)
            .field("nodes", &self.nodes.len())
            .field("edges", &self.num_edges)
            .finish()
    }
}
