use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Completion and cancellation state shared by a run and its future.
pub(crate) struct RunControl {
    cancelled: AtomicBool,
    skipped: AtomicBool,
    failed: AtomicBool,
    error: Mutex<Option<Error>>,
    done: Mutex<bool>,
    cond: Condvar,
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            skipped: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn completed(result: Result<()>) -> Self {
        let control = Self::new();
        if let Err(e) = result {
            control.record_error(e);
        }
        *control.done.lock() = true;
        control
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn mark_skipped(&self) {
        self.skipped.store(true, Ordering::Release);
    }

    pub fn has_error(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Keep the first error of the run.
    pub fn record_error(&self, e: Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(e);
            self.failed.store(true, Ordering::Release);
        }
    }

    pub fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    fn is_done(&self) -> bool {
        *self.done.lock()
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }

    fn outcome(&self) -> Result<()> {
        if let Some(e) = self.error.lock().clone() {
            return Err(e);
        }
        if self.is_cancelled() && self.skipped.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Handle to an in-flight graph run.
///
/// Dropping the future does not stop the run; the executor still waits for
/// it before shutting down.
pub struct RunFuture {
    control: Arc<RunControl>,
}

impl RunFuture {
    pub(crate) fn new(control: Arc<RunControl>) -> Self {
        Self { control }
    }

    pub(crate) fn ready(result: Result<()>) -> Self {
        Self::new(Arc::new(RunControl::completed(result)))
    }

    /// Block until every dispatched node has finished.
    pub fn wait(&self) {
        self.control.wait();
    }

    /// Returns `true` if the run finished within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.control.wait_until(Instant::now() + timeout)
    }

    pub fn is_done(&self) -> bool {
        self.control.is_done()
    }

    /// Stop dispatching nodes that have not started yet. Running nodes,
    /// including in-flight device launches, finish normally.
    pub fn cancel(&self) {
        self.control.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// Wait, then report the first node failure. A cancelled run that had to
    /// skip nodes reports [`Error::Cancelled`].
    pub fn get(self) -> Result<()> {
        self.control.wait();
        self.control.outcome()
    }
}

impl fmt::Debug for RunFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunFuture")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
