//! Unified address space backing the emulator.

use crate::error::{Error, Result};
use crate::gpu::kernel::KernelMemory;
use crate::gpu::Location;
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const BASE_ADDR: u64 = 0x1000_0000;
const ALIGNMENT: u64 = 256;

pub(crate) struct Region {
    base: u64,
    len: usize,
    location: Location,
    data: Mutex<Vec<u8>>,
}

impl Region {
    fn offset_of(&self, addr: u64, bytes: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)? as usize;
        let end = offset.checked_add(bytes)?;
        (end <= self.len).then_some(offset)
    }
}

fn illegal_address(addr: u64, bytes: usize) -> Error {
    Error::runtime(format!("illegal address {:#x} (+{} bytes)", addr, bytes))
}

/// Allocation table. Allocations never overlap and are separated by at least
/// one alignment unit, so an out-of-bounds access never lands in a neighbour.
pub(crate) struct MemoryTable {
    regions: RwLock<BTreeMap<u64, Arc<Region>>>,
    next_addr: AtomicU64,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(BTreeMap::new()),
            next_addr: AtomicU64::new(BASE_ADDR),
        }
    }

    pub fn allocate(&self, location: Location, bytes: usize) -> Result<u64> {
        let too_large = || Error::invalid_argument(format!("cannot allocate {} bytes", bytes));
        let span = (bytes as u64)
            .checked_next_multiple_of(ALIGNMENT)
            .and_then(|span| span.checked_add(ALIGNMENT))
            .ok_or_else(too_large)?;
        let mut data = Vec::new();
        data.try_reserve_exact(bytes).map_err(|_| too_large())?;
        data.resize(bytes, 0u8);

        let base = self.next_addr.fetch_add(span, Ordering::Relaxed);
        let region = Region {
            base,
            len: bytes,
            location,
            data: Mutex::new(data),
        };
        self.regions.write().insert(base, Arc::new(region));
        Ok(base)
    }

    pub fn free(&self, addr: u64) -> Result<()> {
        self.regions
            .write()
            .remove(&addr)
            .map(|_| ())
            .ok_or_else(|| {
                Error::invalid_argument(format!("{:#x} is not the start of an allocation", addr))
            })
    }

    pub fn allocation_count(&self) -> usize {
        self.regions.read().len()
    }

    pub fn resolve(&self, addr: u64, bytes: usize) -> Result<(Arc<Region>, usize)> {
        let regions = self.regions.read();
        let (_, region) = regions
            .range(..=addr)
            .next_back()
            .ok_or_else(|| illegal_address(addr, bytes))?;
        let offset = region
            .offset_of(addr, bytes)
            .ok_or_else(|| illegal_address(addr, bytes))?;
        Ok((Arc::clone(region), offset))
    }

    pub fn locate(&self, addr: u64, bytes: usize) -> Result<Location> {
        self.resolve(addr, bytes).map(|(region, _)| region.location)
    }

    pub fn read(&self, addr: u64, out: &mut [u8]) -> Result<()> {
        let (region, offset) = self.resolve(addr, out.len())?;
        let data = region.data.lock();
        out.copy_from_slice(&data[offset..offset + out.len()]);
        Ok(())
    }

    pub fn write(&self, addr: u64, input: &[u8]) -> Result<()> {
        let (region, offset) = self.resolve(addr, input.len())?;
        let mut data = region.data.lock();
        data[offset..offset + input.len()].copy_from_slice(input);
        Ok(())
    }

    /// Overlapping ranges are copied as if through a temporary buffer.
    pub fn copy(&self, dst: u64, src: u64, bytes: usize) -> Result<()> {
        let mut staging = vec![0u8; bytes];
        self.read(src, &mut staging)?;
        self.write(dst, &staging)
    }

    pub fn update<F>(&self, addr: u64, bytes: usize, f: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let (region, offset) = self.resolve(addr, bytes)?;
        let mut data = region.data.lock();
        f(&mut data[offset..offset + bytes]);
        Ok(())
    }
}

impl KernelMemory for MemoryTable {
    fn read_bytes(&self, addr: u64, out: &mut [u8]) -> Result<()> {
        self.read(addr, out)
    }

    fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.write(addr, data)
    }
}

/// Memory view for a single kernel launch. Remembers the regions the kernel
/// already touched so repeated accesses skip the table lookup.
pub(crate) struct LaunchMemory<'a> {
    table: &'a MemoryTable,
    recent: RefCell<Vec<Arc<Region>>>,
}

impl<'a> LaunchMemory<'a> {
    pub fn new(table: &'a MemoryTable) -> Self {
        Self {
            table,
            recent: RefCell::new(Vec::new()),
        }
    }

    fn with_region<R>(
        &self,
        addr: u64,
        bytes: usize,
        f: impl FnOnce(&Region, usize) -> R,
    ) -> Result<R> {
        {
            let recent = self.recent.borrow();
            if let Some((region, offset)) = recent
                .iter()
                .find_map(|r| r.offset_of(addr, bytes).map(|o| (r, o)))
            {
                return Ok(f(region, offset));
            }
        }
        let (region, offset) = self.table.resolve(addr, bytes)?;
        let result = f(&region, offset);
        self.recent.borrow_mut().push(region);
        Ok(result)
    }
}

impl KernelMemory for LaunchMemory<'_> {
    fn read_bytes(&self, addr: u64, out: &mut [u8]) -> Result<()> {
        self.with_region(addr, out.len(), |region, offset| {
            let data = region.data.lock();
            out.copy_from_slice(&data[offset..offset + out.len()]);
        })
    }

    fn write_bytes(&self, addr: u64, input: &[u8]) -> Result<()> {
        self.with_region(addr, input.len(), |region, offset| {
            let mut data = region.data.lock();
            data[offset..offset + input.len()].copy_from_slice(input);
        })
    }
}
