//! Kernel model: launch geometry, packed arguments and the per-thread view a
//! kernel body receives.
//!
//! Kernels are opaque to the runtime. A kernel is a plain function pointer
//! invoked once per thread of its launch geometry; its identity is the
//! function address.

use super::buffer::DevicePtr;
use super::DeviceId;
use crate::error::{Error, Result};
use bytemuck::{Pod, Zeroable};
use std::cell::RefCell;
use std::fmt;
use std::mem::size_of;

/// Kernel body. Called once per thread of the launch.
pub type KernelFn = fn(&ThreadContext<'_>);

pub(crate) fn kernel_identity(func: KernelFn) -> usize {
    func as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    pub fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Dim3::linear(x)
    }
}

impl From<(u32, u32)> for Dim3 {
    fn from((x, y): (u32, u32)) -> Self {
        Dim3::new(x, y, 1)
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Dim3::new(x, y, z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchGeometry {
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: u32,
}

impl LaunchGeometry {
    pub fn new(grid: impl Into<Dim3>, block: impl Into<Dim3>) -> Self {
        Self {
            grid: grid.into(),
            block: block.into(),
            shared_mem_bytes: 0,
        }
    }

    /// One-dimensional geometry covering `elements` threads in blocks of
    /// `block_size`.
    pub fn for_elements(elements: usize, block_size: u32) -> Self {
        let block_size = block_size.max(1);
        let blocks = (elements as u64).div_ceil(block_size as u64).max(1);
        Self::new(blocks.min(u32::MAX as u64) as u32, block_size)
    }

    pub fn with_shared_mem(mut self, bytes: u32) -> Self {
        self.shared_mem_bytes = bytes;
        self
    }

    pub fn total_threads(&self) -> u64 {
        self.grid.volume() * self.block.volume()
    }

    pub fn validate(&self) -> Result<()> {
        if self.grid.volume() == 0 || self.block.volume() == 0 {
            return Err(Error::invalid_argument(format!(
                "launch geometry has an empty dimension: grid {:?}, block {:?}",
                self.grid, self.block
            )));
        }
        Ok(())
    }
}

/// Kernel arguments packed into raw bytes at record time.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct KernelArgs {
    bytes: Vec<u8>,
}

impl KernelArgs {
    pub fn pack<A: Pod>(args: &A) -> Self {
        Self {
            bytes: bytemuck::bytes_of(args).to_vec(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for KernelArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KernelArgs({} bytes)", self.bytes.len())
    }
}

/// Byte-level memory access a runtime exposes to running kernels.
pub trait KernelMemory {
    fn read_bytes(&self, addr: u64, out: &mut [u8]) -> Result<()>;
    fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<()>;
}

/// What a kernel body sees for one thread of a launch.
///
/// Memory faults do not unwind: the first one is recorded, the faulting
/// access yields a zeroed value, and the launch reports a runtime error once
/// the kernel returns.
pub struct ThreadContext<'a> {
    pub(crate) device: DeviceId,
    pub(crate) grid_dim: Dim3,
    pub(crate) block_dim: Dim3,
    pub(crate) block_idx: Dim3,
    pub(crate) thread_idx: Dim3,
    pub(crate) args: &'a [u8],
    pub(crate) memory: &'a dyn KernelMemory,
    pub(crate) fault: &'a RefCell<Option<String>>,
}

impl<'a> ThreadContext<'a> {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn grid_dim(&self) -> Dim3 {
        self.grid_dim
    }

    pub fn block_dim(&self) -> Dim3 {
        self.block_dim
    }

    pub fn block_idx(&self) -> Dim3 {
        self.block_idx
    }

    pub fn thread_idx(&self) -> Dim3 {
        self.thread_idx
    }

    /// `blockIdx.x * blockDim.x + threadIdx.x`
    pub fn global_id_x(&self) -> usize {
        self.block_idx.x as usize * self.block_dim.x as usize + self.thread_idx.x as usize
    }

    /// Row-major index of this thread across the whole launch.
    pub fn global_linear_id(&self) -> usize {
        let block = ((self.block_idx.z as usize * self.grid_dim.y as usize)
            + self.block_idx.y as usize)
            * self.grid_dim.x as usize
            + self.block_idx.x as usize;
        let thread = ((self.thread_idx.z as usize * self.block_dim.y as usize)
            + self.thread_idx.y as usize)
            * self.block_dim.x as usize
            + self.thread_idx.x as usize;
        block * self.block_dim.volume() as usize + thread
    }

    /// Decode the packed launch arguments.
    pub fn args<A: Pod>(&self) -> A {
        match bytemuck::try_pod_read_unaligned(self.args) {
            Ok(args) => args,
            Err(_) => {
                self.record_fault(format!(
                    "kernel expected {} argument bytes, launch packed {}",
                    size_of::<A>(),
                    self.args.len()
                ));
                A::zeroed()
            }
        }
    }

    pub fn load<T: Pod>(&self, ptr: DevicePtr<T>, index: usize) -> T {
        let mut value = T::zeroed();
        let Some(addr) = self.element_addr(ptr, index) else {
            return value;
        };
        if let Err(e) = self
            .memory
            .read_bytes(addr, bytemuck::bytes_of_mut(&mut value))
        {
            self.record_fault(e.to_string());
        }
        value
    }

    pub fn store<T: Pod>(&self, ptr: DevicePtr<T>, index: usize, value: T) {
        let Some(addr) = self.element_addr(ptr, index) else {
            return;
        };
        if let Err(e) = self.memory.write_bytes(addr, bytemuck::bytes_of(&value)) {
            self.record_fault(e.to_string());
        }
    }

    fn element_addr<T>(&self, ptr: DevicePtr<T>, index: usize) -> Option<u64> {
        let addr = ptr.checked_add(index).map(|p| p.addr());
        if addr.is_none() {
            self.record_fault(format!("element {} past {:?} overflows the address space", index, ptr));
        }
        addr
    }

    fn record_fault(&self, message: String) {
        let mut fault = self.fault.borrow_mut();
        if fault.is_none() {
            *fault = Some(message);
        }
    }
}

impl fmt::Debug for ThreadContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("device", &self.device)
            .field("block_idx", &self.block_idx)
            .field("thread_idx", &self.thread_idx)
            .finish()
    }
}
