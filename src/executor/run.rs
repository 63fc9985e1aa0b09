//! Per-run scheduling state and node dispatch.
//!
//! Every run owns one dependency counter per node, reset from the graph's
//! plan at the start of each iteration. A finished node decrements the
//! counters of its strong successors; the thread whose decrement reaches
//! zero is the only one that schedules that successor. Condition nodes skip
//! the counters and schedule the selected successor directly.

use super::cpu_pool::PoolInner;
use super::future::{RunControl, RunFuture};
use super::panic_handler::PanicHandler;
use super::task::Task;
use crate::error::{Error, Result};
use crate::flow::{DeviceFlow, Subgraph};
use crate::gpu::{scoped_device, DeviceRuntime};
use crate::graph::{FlowFn, Graph, Node, Plan, Work};
use crate::telemetry::Metrics;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// State shared by every run of one executor.
pub(crate) struct Shared {
    pub pool: Arc<PoolInner>,
    pub runtime: Arc<dyn DeviceRuntime>,
    pub panic_handler: PanicHandler,
    pub metrics: Arc<Metrics>,
    active: Mutex<usize>,
    idle: Condvar,
    next_run: AtomicU64,
}

impl Shared {
    pub fn new(
        pool: Arc<PoolInner>,
        runtime: Arc<dyn DeviceRuntime>,
        panic_handler: PanicHandler,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            runtime,
            panic_handler,
            metrics,
            active: Mutex::new(0),
            idle: Condvar::new(),
            next_run: AtomicU64::new(1),
        }
    }

    fn begin_run(&self) -> u64 {
        *self.active.lock() += 1;
        self.next_run.fetch_add(1, Ordering::Relaxed)
    }

    fn end_run(&self) {
        let mut active = self.active.lock();
        *active -= 1;
        if *active == 0 {
            self.idle.notify_all();
        }
    }

    pub fn active_runs(&self) -> usize {
        *self.active.lock()
    }

    pub fn wait_idle(&self) {
        let mut active = self.active.lock();
        while *active > 0 {
            self.idle.wait(&mut active);
        }
    }
}

/// Which successors a finished node releases.
enum Next {
    Strong,
    Branch(usize),
}

pub(crate) struct RunState {
    id: u64,
    graph: Arc<Graph>,
    plan: Arc<Plan>,
    shared: Arc<Shared>,
    join_counters: Vec<AtomicUsize>,
    pending: AtomicUsize,
    remaining: AtomicUsize,
    started: Instant,
    control: Arc<RunControl>,
}

impl RunState {
    /// Start `iterations` back-to-back executions of `graph`.
    pub fn start(
        graph: Arc<Graph>,
        plan: Arc<Plan>,
        iterations: usize,
        shared: Arc<Shared>,
    ) -> RunFuture {
        let control = Arc::new(RunControl::new());
        let id = shared.begin_run();
        let join_counters = plan
            .strong_in_degree
            .iter()
            .map(|&d| AtomicUsize::new(d))
            .collect();

        tracing::debug!(
            run = id,
            graph = graph.label(),
            nodes = graph.num_nodes(),
            iterations,
            "run started"
        );

        let state = Arc::new(RunState {
            id,
            graph,
            plan,
            shared,
            join_counters,
            pending: AtomicUsize::new(0),
            remaining: AtomicUsize::new(iterations),
            started: Instant::now(),
            control: control.clone(),
        });
        state.start_iteration();

        RunFuture::new(control)
    }

    fn start_iteration(self: &Arc<Self>) {
        for (counter, &degree) in self.join_counters.iter().zip(&self.plan.strong_in_degree) {
            counter.store(degree, Ordering::Relaxed);
        }
        self.pending
            .store(self.plan.sources.len(), Ordering::Release);
        for &source in &self.plan.sources {
            self.submit(source);
        }
    }

    fn submit(self: &Arc<Self>, node: usize) {
        let state = Arc::clone(self);
        self.shared.pool.submit(Task::new(move || state.invoke(node)));
    }

    fn schedule(self: &Arc<Self>, node: usize) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.submit(node);
    }

    fn invoke(self: &Arc<Self>, index: usize) {
        let node = self.graph.node(index);

        if self.control.is_cancelled() {
            self.control.mark_skipped();
            self.node_done();
            return;
        }

        // Loops re-enter nodes within one iteration.
        self.join_counters[index].store(self.plan.strong_in_degree[index], Ordering::Relaxed);

        let start = Instant::now();
        let outcome = self
            .shared
            .panic_handler
            .execute(&node.name, || self.execute(node))
            .unwrap_or_else(|panic| Err(Error::host_task(node.label(index), panic.message)));
        let elapsed_ns = start.elapsed().as_nanos() as u64;

        match outcome {
            Ok(next) => {
                self.shared.metrics.record_node_execution(elapsed_ns);
                self.release(node, next);
            }
            Err(e) => {
                self.shared.metrics.record_node_failure();
                tracing::warn!(run = self.id, node = %node.label(index), error = %e, "node failed");
                self.control.record_error(e);
            }
        }

        self.node_done();
    }

    fn execute(&self, node: &Node) -> Result<Next> {
        let mut work = node.work.lock();
        match &mut *work {
            Work::Host(f) => f().map(|()| Next::Strong),
            Work::Condition(f) => Ok(Next::Branch(f())),
            Work::DeviceFlow { callback, subgraph } => {
                self.run_device_flow(callback, subgraph).map(|()| Next::Strong)
            }
        }
    }

    fn run_device_flow(
        &self,
        callback: &mut FlowFn,
        subgraph: &mut Subgraph,
    ) -> Result<()> {
        let _device = scoped_device(subgraph.device());
        if !subgraph.is_persistent() {
            subgraph.reset();
        }
        subgraph.begin_run();
        let was_instantiated = subgraph.is_instantiated();
        let launches_before = subgraph.launches();

        let result = {
            let mut flow = DeviceFlow::new(subgraph, &self.shared.runtime);
            callback(&mut flow).and_then(|()| flow.finish())
        };

        if !was_instantiated && subgraph.is_instantiated() {
            self.shared.metrics.record_instantiation();
        }
        self.shared
            .metrics
            .record_launches(subgraph.launches().saturating_sub(launches_before));

        // Nothing recorded by a failed run may leak into the next one.
        if result.is_err() && !subgraph.is_instantiated() {
            subgraph.reset();
        }
        result
    }

    fn release(self: &Arc<Self>, node: &Node, next: Next) {
        if node.successors.is_empty() {
            return;
        }
        if self.control.is_cancelled() {
            self.control.mark_skipped();
            return;
        }

        match next {
            Next::Strong => {
                for &succ in &node.successors {
                    if self.join_counters[succ].fetch_sub(1, Ordering::AcqRel) == 1 {
                        self.schedule(succ);
                    }
                }
            }
            Next::Branch(choice) => {
                if let Some(&succ) = node.successors.get(choice) {
                    self.schedule(succ);
                } else {
                    tracing::trace!(
                        run = self.id,
                        choice,
                        successors = node.successors.len(),
                        "condition selected no successor"
                    );
                }
            }
        }
    }

    fn node_done(self: &Arc<Self>) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.iteration_done();
        }
    }

    fn iteration_done(self: &Arc<Self>) {
        let more = self.remaining.fetch_sub(1, Ordering::AcqRel) > 1;
        if more {
            if self.control.is_cancelled() {
                self.control.mark_skipped();
            } else if !self.control.has_error() {
                self.start_iteration();
                return;
            }
        }

        self.shared.metrics.record_run_completed();
        tracing::debug!(
            run = self.id,
            graph = self.graph.label(),
            failed = self.control.has_error(),
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "run finished"
        );
        self.control.complete();
        self.shared.end_run();
    }
}
