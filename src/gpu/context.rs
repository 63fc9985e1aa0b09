//! Per-thread active device.
//!
//! The active device is only ever changed through [`ScopedDevice`], so the
//! previous device is restored on every exit path, unwinding included.

use super::DeviceId;
use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static CURRENT_DEVICE: Cell<Option<DeviceId>> = const { Cell::new(None) };
}

/// Device made active by the innermost live [`ScopedDevice`] on this thread.
pub fn current_device() -> Option<DeviceId> {
    CURRENT_DEVICE.with(|cell| cell.get())
}

/// Make `device` the calling thread's active device until the guard drops.
pub fn scoped_device(device: DeviceId) -> ScopedDevice {
    let previous = CURRENT_DEVICE.with(|cell| cell.replace(Some(device)));
    ScopedDevice {
        device,
        previous,
        _not_send: PhantomData,
    }
}

/// Guard returned by [`scoped_device`]. Bound to the thread that created it.
#[derive(Debug)]
#[must_use = "the previous device is restored as soon as the guard is dropped"]
pub struct ScopedDevice {
    device: DeviceId,
    previous: Option<DeviceId>,
    _not_send: PhantomData<*const ()>,
}

impl ScopedDevice {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn previous(&self) -> Option<DeviceId> {
        self.previous
    }
}

impl Drop for ScopedDevice {
    fn drop(&mut self) {
        CURRENT_DEVICE.with(|cell| cell.set(self.previous));
    }
}
