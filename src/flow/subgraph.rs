use crate::error::{Error, Result};
use crate::gpu::op::OpParams;
use crate::gpu::{DeviceId, DeviceOp, DeviceRuntime, ExecutableGraph, GraphTemplate, Location, OpKind};
use crate::graph::validate::topological_order;
use std::fmt::{self, Write as _};

/// Lifecycle of a [`Subgraph`]. Topology is frozen once it leaves `Building`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubgraphState {
    Building,
    Instantiated,
    Offloaded,
}

/// Handle to an operation recorded into a [`Subgraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpHandle(pub(crate) usize);

impl OpHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
pub(crate) struct OpNode {
    pub name: String,
    pub op: DeviceOp,
    /// Location of every address range the operation touches, resolved at
    /// record time.
    pub bindings: Vec<Location>,
    pub successors: Vec<usize>,
    pub predecessors: Vec<usize>,
}

impl OpNode {
    fn label(&self, index: usize) -> String {
        if self.name.is_empty() {
            format!("{}#{}", self.op.kind(), index)
        } else {
            self.name.clone()
        }
    }
}

/// Device operations recorded by one device-flow node, and the executable
/// graph compiled from them.
pub struct Subgraph {
    device: DeviceId,
    nodes: Vec<OpNode>,
    num_edges: usize,
    state: SubgraphState,
    exec: Option<Box<dyn ExecutableGraph>>,
    launches: u64,
    offloaded_this_run: bool,
    persistent: bool,
}

impl Subgraph {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            nodes: Vec::new(),
            num_edges: 0,
            state: SubgraphState::Building,
            exec: None,
            launches: 0,
            offloaded_this_run: false,
            persistent: false,
        }
    }

    /// A subgraph the executor keeps across runs instead of re-recording.
    pub fn persistent(device: DeviceId) -> Self {
        Self {
            persistent: true,
            ..Self::new(device)
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Default device for operations recorded without an explicit device.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn state(&self) -> SubgraphState {
        self.state
    }

    pub fn is_instantiated(&self) -> bool {
        self.exec.is_some()
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

    /// Completed launches over the subgraph's lifetime.
    pub fn launches(&self) -> u64 {
        self.launches
    }

    pub fn op(&self, handle: OpHandle) -> Option<&DeviceOp> {
        self.nodes.get(handle.0).map(|n| &n.op)
    }

    pub fn op_name(&self, handle: OpHandle) -> Option<&str> {
        self.nodes.get(handle.0).map(|n| n.name.as_str())
    }

    pub fn find(&self, name: &str) -> Option<OpHandle> {
        self.nodes.iter().position(|n| n.name == name).map(OpHandle)
    }

    pub fn edges(&self) -> Vec<(OpHandle, OpHandle)> {
        self.nodes
            .iter()
            .enumerate()
            .flat_map(|(i, n)| n.successors.iter().map(move |&s| (OpHandle(i), OpHandle(s))))
            .collect()
    }

    pub fn dump_edges(&self) -> String {
        let mut out = String::new();
        for (from, to) in self.edges() {
            let _ = writeln!(
                out,
                "\"{}\" -> \"{}\"",
                self.nodes[from.0].label(from.0),
                self.nodes[to.0].label(to.0)
            );
        }
        out
    }

    pub(crate) fn ensure_building(&self) -> Result<()> {
        if self.state != SubgraphState::Building {
            return Err(Error::topology(format!(
                "subgraph on {} is {:?}; its nodes and edges are frozen",
                self.device, self.state
            )));
        }
        Ok(())
    }

    pub(crate) fn push_op(&mut self, op: DeviceOp, bindings: Vec<Location>) -> Result<OpHandle> {
        self.ensure_building()?;
        self.nodes.push(OpNode {
            name: String::new(),
            op,
            bindings,
            successors: Vec::new(),
            predecessors: Vec::new(),
        });
        Ok(OpHandle(self.nodes.len() - 1))
    }

    pub(crate) fn add_edge(&mut self, from: OpHandle, to: OpHandle) -> Result<()> {
        self.ensure_building()?;
        self.check(from)?;
        self.check(to)?;
        if from == to {
            return Err(Error::construction(format!(
                "self-loop on operation {}",
                self.nodes[from.0].label(from.0)
            )));
        }
        self.nodes[from.0].successors.push(to.0);
        self.nodes[to.0].predecessors.push(from.0);
        self.num_edges += 1;
        Ok(())
    }

    pub(crate) fn set_name(&mut self, handle: OpHandle, name: String) -> Result<()> {
        self.check(handle)?;
        self.nodes[handle.0].name = name;
        Ok(())
    }

    /// Drop the recorded operations and the executable graph, returning to
    /// `Building`. The lifetime launch count is kept.
    pub(crate) fn reset(&mut self) {
        if !self.nodes.is_empty() {
            tracing::trace!(
                device = self.device.ordinal(),
                nodes = self.nodes.len(),
                state = ?self.state,
                "subgraph discarded"
            );
        }
        self.nodes.clear();
        self.num_edges = 0;
        self.exec = None;
        self.state = SubgraphState::Building;
        self.offloaded_this_run = false;
    }

    /// Compile the recorded operations. Does nothing once instantiated.
    pub(crate) fn instantiate(&mut self, runtime: &dyn DeviceRuntime) -> Result<()> {
        if self.exec.is_some() {
            return Ok(());
        }

        let edges: Vec<(usize, usize)> = self
            .edges()
            .into_iter()
            .map(|(a, b)| (a.0, b.0))
            .collect();
        let order = topological_order(self.nodes.len(), &edges).map_err(|stuck| {
            Error::construction(format!(
                "cycle among {} device operation(s) on {}",
                stuck.len(),
                self.device
            ))
        })?;
        let ops: Vec<DeviceOp> = self.nodes.iter().map(|n| n.op.clone()).collect();

        let exec = runtime.instantiate(GraphTemplate {
            device: self.device,
            ops: &ops,
            edges: &edges,
            order: &order,
        })?;

        tracing::debug!(
            device = self.device.ordinal(),
            nodes = self.nodes.len(),
            edges = self.num_edges,
            runtime = runtime.name(),
            "subgraph instantiated"
        );
        self.exec = Some(exec);
        self.state = SubgraphState::Instantiated;
        Ok(())
    }

    /// Launch once and wait for the device to finish.
    pub(crate) fn launch_once(&mut self) -> Result<()> {
        self.offloaded_this_run = true;
        let exec = self
            .exec
            .as_mut()
            .ok_or_else(|| Error::runtime("subgraph launched before instantiation"))?;

        // A failed enqueue can still leave earlier work in flight.
        let launched = exec.launch();
        let synced = exec.synchronize();
        launched?;
        synced?;

        self.launches += 1;
        self.state = SubgraphState::Offloaded;
        tracing::trace!(
            device = self.device.ordinal(),
            launches = self.launches,
            "subgraph launch completed"
        );
        Ok(())
    }

    pub(crate) fn begin_run(&mut self) {
        self.offloaded_this_run = false;
    }

    pub(crate) fn offloaded_this_run(&self) -> bool {
        self.offloaded_this_run
    }

    /// Replace the parameters of a recorded operation.
    ///
    /// The replacement must keep the operation's kind, device and the
    /// locations its pointers resolve to. Kernels must keep their function
    /// and fills their element size.
    pub(crate) fn update(
        &mut self,
        handle: OpHandle,
        op: DeviceOp,
        bindings: Vec<Location>,
    ) -> Result<()> {
        self.check(handle)?;
        let node = &self.nodes[handle.0];
        let label = node.label(handle.0);
        let current = &node.op;

        if !same_family(current.kind(), op.kind()) {
            return Err(Error::parameter_update(format!(
                "{} is a {} operation, cannot update it with {} parameters",
                label,
                current.kind(),
                op.kind()
            )));
        }
        if current.device != op.device {
            return Err(Error::device_mismatch(current.device, op.device));
        }
        if let Some((i, (was, now))) = node
            .bindings
            .iter()
            .zip(&bindings)
            .enumerate()
            .find(|(_, (was, now))| was != now)
        {
            tracing::debug!(op = %label, operand = i, "update rebinds operand");
            return Err(Error::device_mismatch(was, now));
        }
        match (&current.params, &op.params) {
            (OpParams::Kernel(old), OpParams::Kernel(new)) if old.identity() != new.identity() => {
                return Err(Error::parameter_update(format!(
                    "{} was recorded with kernel {:#x}, update uses {:#x}",
                    label,
                    old.identity(),
                    new.identity()
                )));
            }
            (OpParams::Fill { pattern: old, .. }, OpParams::Fill { pattern: new, .. })
                if old.element_size() != new.element_size() =>
            {
                return Err(Error::parameter_update(format!(
                    "{} fills {}-byte elements, update uses {}-byte elements",
                    label,
                    old.element_size(),
                    new.element_size()
                )));
            }
            _ => {}
        }

        if let Some(exec) = self.exec.as_mut() {
            exec.update(handle.0, &op)?;
        }
        tracing::debug!(op = %label, kind = %op.kind(), "operation parameters updated");
        self.nodes[handle.0].op = op;
        Ok(())
    }

    fn check(&self, handle: OpHandle) -> Result<()> {
        if handle.0 >= self.nodes.len() {
            return Err(Error::invalid_argument(format!(
                "operation handle {} out of range ({} operations)",
                handle.0,
                self.nodes.len()
            )));
        }
        Ok(())
    }
}

/// Copies switch between the host and device variants depending on where
/// their pointers live; the bindings check catches that case.
fn same_family(a: OpKind, b: OpKind) -> bool {
    let copy = |k| matches!(k, OpKind::DeviceCopy | OpKind::HostCopy);
    a == b || (copy(a) && copy(b))
}

impl fmt::Debug for Subgraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subgraph")
            .field("device", &self.device)
            .field("nodes", &self.nodes.len())
            .field("edges", &self.num_edges)
            .field("state", &self.state)
            .field("launches", &self.launches)
            .field("persistent", &self.persistent)
            .finish()
    }
}
