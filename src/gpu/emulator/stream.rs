//! In-order execution queue for one emulated device.

use crate::error::{Error, Result};
use crate::gpu::DeviceId;
use crossbeam_channel::{unbounded, Sender};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a device's stream thread. The thread exits once every handle
/// has been dropped and the queue has drained.
#[derive(Clone)]
pub(crate) struct Stream {
    device: DeviceId,
    sender: Sender<Job>,
}

impl Stream {
    pub fn spawn(device: DeviceId) -> Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        thread::Builder::new()
            .name(format!("veda-stream-{}", device.ordinal()))
            .spawn(move || {
                tracing::trace!(device = device.ordinal(), "stream started");
                for job in receiver.iter() {
                    job();
                }
                tracing::trace!(device = device.ordinal(), "stream stopped");
            })
            .map_err(|e| Error::runtime(format!("failed to start stream for {}: {}", device, e)))?;

        Ok(Self { device, sender })
    }

    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Box::new(job))
            .map_err(|_| Error::runtime(format!("stream for {} is closed", self.device)))
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.device)
            .field("queued", &self.sender.len())
            .finish()
    }
}
