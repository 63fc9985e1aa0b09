//! Host-side emulation of a graph-capable device runtime.
//!
//! Every device gets one stream thread. An instantiated graph executes its
//! operations in the topological order frozen at instantiation; a kernel is
//! executed by calling its function once for every thread of the launch
//! geometry, block by block.

mod memory;
mod stream;

use self::memory::{LaunchMemory, MemoryTable};
use self::stream::Stream;
use super::context::scoped_device;
use super::kernel::{Dim3, ThreadContext};
use super::op::{DeviceOp, KernelParams, OpParams};
use super::runtime::{DeviceRuntime, ExecutableGraph, GraphTemplate};
use super::{DeviceId, Location};
use crate::error::{Error, Result};
use crate::executor::panic_handler::panic_message;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub struct Emulator {
    devices: usize,
    memory: Arc<MemoryTable>,
    streams: Mutex<HashMap<DeviceId, Stream>>,
}

impl Emulator {
    pub fn new(devices: usize) -> Self {
        Self {
            devices: devices.max(1),
            memory: Arc::new(MemoryTable::new()),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Live allocations, device and host.
    pub fn allocation_count(&self) -> usize {
        self.memory.allocation_count()
    }

    fn check_device(&self, device: DeviceId) -> Result<()> {
        if device.index() >= self.devices {
            return Err(Error::invalid_argument(format!(
                "{} does not exist ({} emulated)",
                device, self.devices
            )));
        }
        Ok(())
    }

    fn stream(&self, device: DeviceId) -> Result<Stream> {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get(&device) {
            return Ok(stream.clone());
        }
        let stream = Stream::spawn(device)?;
        streams.insert(device, stream.clone());
        Ok(stream)
    }
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("devices", &self.devices)
            .field("allocations", &self.memory.allocation_count())
            .finish()
    }
}

impl DeviceRuntime for Emulator {
    fn name(&self) -> &str {
        "emulator"
    }

    fn device_count(&self) -> usize {
        self.devices
    }

    fn allocate(&self, location: Location, bytes: usize) -> Result<u64> {
        if bytes == 0 {
            return Err(Error::invalid_argument("cannot allocate zero bytes"));
        }
        if let Location::Device(device) = location {
            self.check_device(device)?;
        }
        self.memory.allocate(location, bytes)
    }

    fn free(&self, addr: u64) -> Result<()> {
        self.memory.free(addr)
    }

    fn locate(&self, addr: u64, bytes: usize) -> Result<Location> {
        self.memory.locate(addr, bytes)
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.memory.write(addr, data)
    }

    fn read(&self, addr: u64, out: &mut [u8]) -> Result<()> {
        self.memory.read(addr, out)
    }

    fn instantiate(&self, template: GraphTemplate<'_>) -> Result<Box<dyn ExecutableGraph>> {
        self.check_device(template.device)?;
        for op in template.ops {
            self.check_device(op.device)?;
            if let OpParams::Kernel(kernel) = &op.params {
                kernel.geometry.validate()?;
            }
        }
        if template.order.len() != template.ops.len() {
            return Err(Error::construction(format!(
                "topological order covers {} of {} nodes",
                template.order.len(),
                template.ops.len()
            )));
        }

        tracing::debug!(
            device = template.device.ordinal(),
            nodes = template.ops.len(),
            edges = template.edges.len(),
            "instantiating emulated graph"
        );

        Ok(Box::new(EmulatedGraph {
            device: template.device,
            ops: Arc::new(template.ops.to_vec()),
            order: Arc::new(template.order.to_vec()),
            memory: Arc::clone(&self.memory),
            stream: self.stream(template.device)?,
            in_flight: Vec::new(),
            completed: 0,
        }))
    }
}

struct EmulatedGraph {
    device: DeviceId,
    ops: Arc<Vec<DeviceOp>>,
    order: Arc<Vec<usize>>,
    memory: Arc<MemoryTable>,
    stream: Stream,
    in_flight: Vec<Receiver<Result<()>>>,
    completed: u64,
}

impl std::fmt::Debug for EmulatedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedGraph")
            .field("device", &self.device)
            .field("nodes", &self.ops.len())
            .field("in_flight", &self.in_flight.len())
            .field("completed", &self.completed)
            .finish()
    }
}

impl ExecutableGraph for EmulatedGraph {
    fn launch(&mut self) -> Result<()> {
        let (done_tx, done_rx) = bounded(1);
        let ops = Arc::clone(&self.ops);
        let order = Arc::clone(&self.order);
        let memory = Arc::clone(&self.memory);

        self.stream.submit(move || {
            let result = catch_unwind(AssertUnwindSafe(|| execute_graph(&memory, &ops, &order)))
                .unwrap_or_else(|payload| {
                    Err(Error::runtime(format!(
                        "kernel panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });
            let _ = done_tx.send(result);
        })?;

        tracing::trace!(device = self.device.ordinal(), "graph launch enqueued");
        self.in_flight.push(done_rx);
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        let mut first_error = None;
        for pending in self.in_flight.drain(..) {
            let outcome = pending
                .recv()
                .unwrap_or_else(|_| Err(Error::runtime("stream terminated during launch")));
            match outcome {
                Ok(()) => self.completed += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn update(&mut self, index: usize, op: &DeviceOp) -> Result<()> {
        if !self.in_flight.is_empty() {
            return Err(Error::parameter_update(
                "cannot update a graph with launches in flight",
            ));
        }
        let current = self.ops.get(index).ok_or_else(|| {
            Error::parameter_update(format!("graph has no node {}", index))
        })?;
        if current.kind() != op.kind() {
            return Err(Error::parameter_update(format!(
                "node {} is a {} operation, update is a {}",
                index,
                current.kind(),
                op.kind()
            )));
        }
        if current.device != op.device {
            return Err(Error::device_mismatch(current.device, op.device));
        }
        if let OpParams::Kernel(kernel) = &op.params {
            kernel.geometry.validate()?;
        }
        Arc::make_mut(&mut self.ops)[index] = op.clone();
        Ok(())
    }

    fn node_count(&self) -> usize {
        self.ops.len()
    }

    fn completed_launches(&self) -> u64 {
        self.completed
    }
}

fn execute_graph(memory: &MemoryTable, ops: &[DeviceOp], order: &[usize]) -> Result<()> {
    for &index in order {
        let op = &ops[index];
        let _device = scoped_device(op.device);
        execute_op(memory, op).map_err(|e| {
            let detail = match e {
                Error::RuntimeLaunch(msg) => msg,
                other => other.to_string(),
            };
            Error::runtime(format!("node {} ({}): {}", index, op.kind(), detail))
        })?;
    }
    Ok(())
}

fn execute_op(memory: &MemoryTable, op: &DeviceOp) -> Result<()> {
    match &op.params {
        OpParams::Kernel(kernel) => run_kernel(memory, op.device, kernel),
        OpParams::DeviceCopy { dst, src, bytes } | OpParams::HostCopy { dst, src, bytes } => {
            memory.copy(*dst, *src, *bytes)
        }
        OpParams::Memset { dst, value, bytes } => {
            memory.update(*dst, *bytes, |data| data.fill(*value))
        }
        OpParams::Fill { dst, pattern, count } => {
            memory.update(*dst, count * pattern.element_size(), |data| {
                pattern.write_into(data)
            })
        }
        OpParams::Zero { dst, bytes } => memory.update(*dst, *bytes, |data| data.fill(0)),
    }
}

fn run_kernel(memory: &MemoryTable, device: DeviceId, kernel: &KernelParams) -> Result<()> {
    let geometry = kernel.geometry;
    let view = LaunchMemory::new(memory);
    let fault = RefCell::new(None);

    for block_idx in coordinates(geometry.grid) {
        for thread_idx in coordinates(geometry.block) {
            let ctx = ThreadContext {
                device,
                grid_dim: geometry.grid,
                block_dim: geometry.block,
                block_idx,
                thread_idx,
                args: kernel.args.as_bytes(),
                memory: &view,
                fault: &fault,
            };
            (kernel.func)(&ctx);
        }
        if let Some(message) = fault.borrow_mut().take() {
            return Err(Error::runtime(format!(
                "kernel fault in block {:?}: {}",
                block_idx, message
            )));
        }
    }
    Ok(())
}

/// Row-major walk over every coordinate of `dim`.
fn coordinates(dim: Dim3) -> impl Iterator<Item = Dim3> {
    (0..dim.z).flat_map(move |z| {
        (0..dim.y).flat_map(move |y| (0..dim.x).map(move |x| Dim3::new(x, y, z)))
    })
}
