//! Device operations recorded into a subgraph.

use super::kernel::{kernel_identity, KernelArgs, KernelFn, LaunchGeometry};
use super::DeviceId;
use crate::error::{Error, Result};
use bytemuck::Pod;
use std::fmt;
use std::mem::size_of;

/// Tag of a [`OpParams`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Kernel,
    DeviceCopy,
    HostCopy,
    Memset,
    Fill,
    Zero,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Kernel => "kernel",
            OpKind::DeviceCopy => "d2d_copy",
            OpKind::HostCopy => "host_copy",
            OpKind::Memset => "memset",
            OpKind::Fill => "fill",
            OpKind::Zero => "zero",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fill value for element sizes the device can set natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillPattern {
    U8(u8),
    U16(u16),
    U32(u32),
}

impl FillPattern {
    /// Reinterpret `value` as a fill pattern. Only 1, 2 and 4 byte elements
    /// are accepted.
    pub fn from_value<T: Pod>(value: T) -> Result<Self> {
        let bytes = bytemuck::bytes_of(&value);
        match size_of::<T>() {
            1 => Ok(FillPattern::U8(bytes[0])),
            2 => Ok(FillPattern::U16(u16::from_ne_bytes([bytes[0], bytes[1]]))),
            4 => Ok(FillPattern::U32(u32::from_ne_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ]))),
            other => Err(Error::invalid_argument(format!(
                "fill element size must be 1, 2 or 4 bytes, got {}",
                other
            ))),
        }
    }

    pub fn element_size(&self) -> usize {
        match self {
            FillPattern::U8(_) => 1,
            FillPattern::U16(_) => 2,
            FillPattern::U32(_) => 4,
        }
    }

    pub(crate) fn write_into(&self, out: &mut [u8]) {
        match *self {
            FillPattern::U8(v) => out.fill(v),
            FillPattern::U16(v) => {
                let pattern = v.to_ne_bytes();
                for chunk in out.chunks_exact_mut(2) {
                    chunk.copy_from_slice(&pattern);
                }
            }
            FillPattern::U32(v) => {
                let pattern = v.to_ne_bytes();
                for chunk in out.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&pattern);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct KernelParams {
    pub func: KernelFn,
    pub geometry: LaunchGeometry,
    pub args: KernelArgs,
}

impl KernelParams {
    pub fn identity(&self) -> usize {
        kernel_identity(self.func)
    }
}

impl PartialEq for KernelParams {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
            && self.geometry == other.geometry
            && self.args == other.args
    }
}

impl Eq for KernelParams {}

impl fmt::Debug for KernelParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelParams")
            .field("func", &format_args!("{:#x}", self.identity()))
            .field("geometry", &self.geometry)
            .field("args", &self.args)
            .finish()
    }
}

/// Operation-specific parameters. Pointers are raw addresses in the runtime's
/// unified address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpParams {
    Kernel(KernelParams),
    DeviceCopy { dst: u64, src: u64, bytes: usize },
    HostCopy { dst: u64, src: u64, bytes: usize },
    Memset { dst: u64, value: u8, bytes: usize },
    Fill { dst: u64, pattern: FillPattern, count: usize },
    Zero { dst: u64, bytes: usize },
}

impl OpParams {
    pub fn kind(&self) -> OpKind {
        match self {
            OpParams::Kernel(_) => OpKind::Kernel,
            OpParams::DeviceCopy { .. } => OpKind::DeviceCopy,
            OpParams::HostCopy { .. } => OpKind::HostCopy,
            OpParams::Memset { .. } => OpKind::Memset,
            OpParams::Fill { .. } => OpKind::Fill,
            OpParams::Zero { .. } => OpKind::Zero,
        }
    }
}

/// A recorded operation and the device it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOp {
    pub device: DeviceId,
    pub params: OpParams,
}

impl DeviceOp {
    pub fn new(device: DeviceId, params: OpParams) -> Self {
        Self { device, params }
    }

    pub fn kind(&self) -> OpKind {
        self.params.kind()
    }
}
