//! Device pointers and RAII buffers.

use super::runtime::DeviceRuntime;
use super::{DeviceId, Location};
use crate::error::{Error, Result};
use bytemuck::{Pod, Zeroable};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

/// Typed address in a runtime's unified address space.
///
/// A `DevicePtr` is plain data: it can be packed into kernel arguments and
/// copied freely. Whether it points at live memory is resolved by the
/// runtime when an operation is recorded or executed.
#[repr(transparent)]
pub struct DevicePtr<T> {
    addr: u64,
    _marker: PhantomData<T>,
}

impl<T> DevicePtr<T> {
    pub const NULL: Self = Self::from_addr(0);

    pub const fn from_addr(addr: u64) -> Self {
        Self {
            addr,
            _marker: PhantomData,
        }
    }

    pub const fn addr(&self) -> u64 {
        self.addr
    }

    pub const fn is_null(&self) -> bool {
        self.addr == 0
    }

    /// Pointer `count` elements past this one. Wraps on overflow; the
    /// result then fails to resolve like any other dangling address.
    pub fn add(self, count: usize) -> Self {
        let offset = (count as u64).wrapping_mul(size_of::<T>() as u64);
        Self::from_addr(self.addr.wrapping_add(offset))
    }

    /// Pointer `count` elements past this one, or `None` on overflow.
    pub fn checked_add(self, count: usize) -> Option<Self> {
        let offset = u64::try_from(count)
            .ok()?
            .checked_mul(size_of::<T>() as u64)?;
        self.addr.checked_add(offset).map(Self::from_addr)
    }

    pub fn cast<U>(self) -> DevicePtr<U> {
        DevicePtr::from_addr(self.addr)
    }

    /// Size in bytes of `count` elements.
    pub(crate) fn element_bytes(count: usize) -> Result<usize> {
        count.checked_mul(size_of::<T>()).ok_or_else(|| {
            Error::invalid_argument(format!(
                "{} elements of {} bytes overflow the address space",
                count,
                size_of::<T>()
            ))
        })
    }
}

impl<T> Clone for DevicePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DevicePtr<T> {}

impl<T> PartialEq for DevicePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<T> Eq for DevicePtr<T> {}

impl<T> Hash for DevicePtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl<T> fmt::Debug for DevicePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.addr)
    }
}

// SAFETY: `DevicePtr<T>` is `repr(transparent)` over a `u64`; the marker is
// zero-sized and every bit pattern is a valid (possibly dangling) address.
unsafe impl<T: 'static> Zeroable for DevicePtr<T> {}
unsafe impl<T: 'static> Pod for DevicePtr<T> {}

/// An allocation owned by a runtime, released on drop.
pub struct DeviceBuffer<T: Pod> {
    ptr: DevicePtr<T>,
    len: usize,
    location: Location,
    runtime: Arc<dyn DeviceRuntime>,
}

impl<T: Pod> DeviceBuffer<T> {
    /// Allocate `len` elements on `device`.
    pub fn alloc(runtime: &Arc<dyn DeviceRuntime>, device: DeviceId, len: usize) -> Result<Self> {
        Self::alloc_at(runtime, Location::Device(device), len)
    }

    /// Allocate `len` elements of page-locked host memory.
    pub fn alloc_host(runtime: &Arc<dyn DeviceRuntime>, len: usize) -> Result<Self> {
        Self::alloc_at(runtime, Location::Host, len)
    }

    /// Allocate on `location` and upload `data`.
    pub fn from_slice(
        runtime: &Arc<dyn DeviceRuntime>,
        location: Location,
        data: &[T],
    ) -> Result<Self> {
        let buffer = Self::alloc_at(runtime, location, data.len())?;
        buffer.copy_from_host(data)?;
        Ok(buffer)
    }

    fn alloc_at(runtime: &Arc<dyn DeviceRuntime>, location: Location, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::invalid_argument("cannot allocate zero-sized buffer"));
        }
        if size_of::<T>() == 0 {
            return Err(Error::invalid_argument("cannot allocate zero-sized elements"));
        }
        let addr = runtime.allocate(location, DevicePtr::<T>::element_bytes(len)?)?;
        Ok(Self {
            ptr: DevicePtr::from_addr(addr),
            len,
            location,
            runtime: Arc::clone(runtime),
        })
    }

    pub fn as_ptr(&self) -> DevicePtr<T> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len * size_of::<T>()
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// Synchronous upload, outside of any device graph.
    pub fn copy_from_host(&self, data: &[T]) -> Result<()> {
        if data.len() > self.len {
            return Err(Error::invalid_argument(format!(
                "{} elements do not fit in a buffer of {}",
                data.len(),
                self.len
            )));
        }
        self.runtime
            .write(self.ptr.addr(), bytemuck::cast_slice(data))
    }

    /// Synchronous download of the whole buffer.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); self.len];
        self.runtime
            .read(self.ptr.addr(), bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }
}

impl<T: Pod> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("location", &self.location)
            .finish()
    }
}

impl<T: Pod> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.free(self.ptr.addr()) {
            tracing::warn!(ptr = ?self.ptr, error = %e, "failed to release device buffer");
        }
    }
}
