//! Device-side building blocks: identifiers, memory, kernels, operations and
//! the runtime seam that executes recorded device graphs.
//!
//! The crate ships one runtime, [`Emulator`], which runs device graphs on the
//! host. Other backends plug in by implementing [`DeviceRuntime`].

pub mod buffer;
pub mod context;
pub mod emulator;
pub mod kernel;
pub mod op;
pub mod runtime;

pub use buffer::{DeviceBuffer, DevicePtr};
pub use context::{current_device, scoped_device, ScopedDevice};
pub use emulator::Emulator;
pub use kernel::{Dim3, KernelArgs, KernelFn, KernelMemory, LaunchGeometry, ThreadContext};
pub use op::{DeviceOp, FillPattern, KernelParams, OpKind, OpParams};
pub use runtime::{DeviceRuntime, ExecutableGraph, GraphTemplate};

use std::fmt;

/// Ordinal of a device known to a [`DeviceRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub const fn new(ordinal: u32) -> Self {
        DeviceId(ordinal)
    }

    pub const fn ordinal(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {}", self.0)
    }
}

/// Where an allocation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// Page-locked host memory reachable by every device.
    Host,
    Device(DeviceId),
}

impl Location {
    pub fn is_host(&self) -> bool {
        matches!(self, Location::Host)
    }

    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Location::Host => None,
            Location::Device(id) => Some(*id),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Host => write!(f, "host"),
            Location::Device(id) => write!(f, "{}", id),
        }
    }
}
