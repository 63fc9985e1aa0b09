use crate::error::Result;
use crate::flow::{DeviceFlow, Subgraph};
use parking_lot::Mutex;
use std::fmt;

/// Handle to a node of the [`Graph`](super::Graph) that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(pub(crate) usize);

impl NodeHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Host,
    DeviceFlow,
    /// Returns the index of the single successor to run next.
    Condition,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Host => "host",
            NodeKind::DeviceFlow => "device_flow",
            NodeKind::Condition => "condition",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) type HostFn = Box<dyn FnMut() -> Result<()> + Send + 'static>;
pub(crate) type ConditionFn = Box<dyn FnMut() -> usize + Send + 'static>;
pub(crate) type FlowFn = Box<dyn for<'a> FnMut(&mut DeviceFlow<'a>) -> Result<()> + Send + 'static>;

pub(crate) enum Work {
    Host(HostFn),
    Condition(ConditionFn),
    DeviceFlow { callback: FlowFn, subgraph: Subgraph },
}

impl Work {
    pub fn kind(&self) -> NodeKind {
        match self {
            Work::Host(_) => NodeKind::Host,
            Work::Condition(_) => NodeKind::Condition,
            Work::DeviceFlow { .. } => NodeKind::DeviceFlow,
        }
    }
}

pub(crate) struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub work: Mutex<Work>,
    pub successors: Vec<usize>,
    pub predecessors: Vec<usize>,
}

impl Node {
    pub fn new(work: Work) -> Self {
        Self {
            name: String::new(),
            kind: work.kind(),
            work: Mutex::new(work),
            successors: Vec::new(),
            predecessors: Vec::new(),
        }
    }

    /// Name for diagnostics; unnamed nodes are labelled by index.
    pub fn label(&self, index: usize) -> String {
        if self.name.is_empty() {
            format!("#{}", index)
        } else {
            self.name.clone()
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("successors", &self.successors)
            .field("predecessors", &self.predecessors)
            .finish()
    }
}
