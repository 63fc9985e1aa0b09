//! The seam between the task-graph runtime and a device driver.

use super::op::DeviceOp;
use super::{DeviceId, Location};
use crate::error::Result;
use std::fmt;

/// A recorded subgraph handed to [`DeviceRuntime::instantiate`].
///
/// `order` is a topological order of `ops` with respect to `edges`; the
/// caller has already rejected cycles.
#[derive(Debug, Clone, Copy)]
pub struct GraphTemplate<'a> {
    pub device: DeviceId,
    pub ops: &'a [DeviceOp],
    pub edges: &'a [(usize, usize)],
    pub order: &'a [usize],
}

/// Device driver interface.
///
/// Memory lives in one address space shared by all devices and the host, so
/// a single `u64` identifies any byte the runtime owns.
pub trait DeviceRuntime: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn device_count(&self) -> usize;

    fn allocate(&self, location: Location, bytes: usize) -> Result<u64>;

    fn free(&self, addr: u64) -> Result<()>;

    /// Location of the allocation that fully contains `[addr, addr + bytes)`.
    fn locate(&self, addr: u64, bytes: usize) -> Result<Location>;

    /// Synchronous host write, outside any device graph.
    fn write(&self, addr: u64, data: &[u8]) -> Result<()>;

    /// Synchronous host read, outside any device graph.
    fn read(&self, addr: u64, out: &mut [u8]) -> Result<()>;

    /// Compile a recorded subgraph into an executable graph. Expensive;
    /// callers do it once per subgraph.
    fn instantiate(&self, template: GraphTemplate<'_>) -> Result<Box<dyn ExecutableGraph>>;
}

/// An instantiated device graph. Topology is fixed at instantiation.
pub trait ExecutableGraph: Send + fmt::Debug {
    /// Enqueue one execution of the whole graph. Returns without waiting.
    fn launch(&mut self) -> Result<()>;

    /// Wait for every enqueued launch. Reports the first launch failure.
    fn synchronize(&mut self) -> Result<()>;

    /// Replace the parameters of node `index` for subsequent launches.
    fn update(&mut self, index: usize, op: &DeviceOp) -> Result<()>;

    fn node_count(&self) -> usize;

    /// Launches completed so far.
    fn completed_launches(&self) -> u64;
}
