//! Graph execution on a work-stealing thread pool.
//!
//! Ready nodes are queued as tasks. A worker pops from its own FIFO queue
//! first, then from the global injector, then steals from a random peer.
//! Successors released by a node go to the queue of the worker that
//! released them.

pub mod cpu_pool;
mod future;
pub mod panic_handler;
mod run;
mod task;
mod worker;

pub use cpu_pool::CpuPool;
pub use future::RunFuture;
pub use panic_handler::{PanicHandler, PanicStrategy};

pub(crate) use task::Task;

use self::run::{RunState, Shared};
use crate::config::Config;
use crate::error::Result;
use crate::gpu::{DeviceRuntime, Emulator};
use crate::graph::Graph;
use crate::telemetry::Metrics;
use std::fmt;
use std::sync::Arc;

/// Runs [`Graph`]s. Any number of runs, of the same or different graphs, may
/// be in flight at once; they share the worker pool.
///
/// Dropping the executor waits for every in-flight run.
pub struct Executor {
    pool: CpuPool,
    shared: Arc<Shared>,
}

impl Executor {
    /// Executor backed by the built-in [`Emulator`] with
    /// `config.emulated_devices` devices.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let runtime: Arc<dyn DeviceRuntime> = Arc::new(Emulator::new(config.emulated_devices));
        Self::with_runtime(config, runtime)
    }

    pub fn with_runtime(config: Config, runtime: Arc<dyn DeviceRuntime>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new());
        let pool = CpuPool::new(&config, metrics.clone())?;
        let shared = Arc::new(Shared::new(
            pool.inner().clone(),
            runtime,
            PanicHandler::new(config.panic_strategy),
            metrics,
        ));

        tracing::info!(
            workers = pool.num_threads(),
            runtime = shared.runtime.name(),
            devices = shared.runtime.device_count(),
            "executor started"
        );

        Ok(Self { pool, shared })
    }

    /// Start one run of `graph`. Returns immediately.
    ///
    /// A graph whose strong edges contain a cycle yields a future that is
    /// already complete with a construction error.
    pub fn run(&self, graph: &Arc<Graph>) -> RunFuture {
        self.run_n(graph, 1)
    }

    /// Run `graph` `n` times back to back behind one future. Stops after the
    /// first iteration that fails or is cancelled.
    pub fn run_n(&self, graph: &Arc<Graph>, n: usize) -> RunFuture {
        let plan = match graph.plan() {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(graph = graph.label(), error = %e, "graph rejected");
                return RunFuture::ready(Err(e));
            }
        };
        if n == 0 || plan.sources.is_empty() {
            return RunFuture::ready(Ok(()));
        }
        RunState::start(Arc::clone(graph), plan, n, Arc::clone(&self.shared))
    }

    /// Block until no run is in flight.
    pub fn wait_for_all(&self) {
        self.shared.wait_idle();
    }

    pub fn active_runs(&self) -> usize {
        self.shared.active_runs()
    }

    pub fn num_workers(&self) -> usize {
        self.pool.num_threads()
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.shared.runtime
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Panics caught in nodes since the executor started.
    pub fn panic_count(&self) -> usize {
        self.shared.panic_handler.panic_count()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.wait_for_all();
        self.pool.shutdown();
        tracing::info!("executor stopped");
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("pool", &self.pool)
            .field("runtime", &self.shared.runtime)
            .field("active_runs", &self.active_runs())
            .finish()
    }
}
