//! Metrics collection for graph execution.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Runtime metrics collector
#[derive(Debug)]
pub struct Metrics {
    nodes_executed: AtomicU64,
    nodes_failed: AtomicU64,
    tasks_stolen: AtomicU64,
    runs_completed: AtomicU64,

    subgraph_instantiations: AtomicU64,
    device_launches: AtomicU64,

    // node latency, nanoseconds
    latency_histogram: RwLock<Option<Histogram<u64>>>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        // 3 significant figures, up to one hour
        let histogram = Histogram::new_with_max(3_600_000_000_000, 3).ok();

        Self {
            nodes_executed: AtomicU64::new(0),
            nodes_failed: AtomicU64::new(0),
            tasks_stolen: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            subgraph_instantiations: AtomicU64::new(0),
            device_launches: AtomicU64::new(0),
            latency_histogram: RwLock::new(histogram),
            start_time: Instant::now(),
        }
    }

    pub fn record_node_execution(&self, duration_ns: u64) {
        self.nodes_executed.fetch_add(1, Ordering::Relaxed);

        if let Some(mut hist) = self.latency_histogram.try_write() {
            if let Some(hist) = hist.as_mut() {
                let _ = hist.record(duration_ns.max(1));
            }
        }
    }

    pub fn record_node_failure(&self) {
        self.nodes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_stolen(&self) {
        self.tasks_stolen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_instantiation(&self) {
        self.subgraph_instantiations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_launches(&self, count: u64) {
        self.device_launches.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let histogram = self.latency_histogram.read();
        let (avg, p50, p99, max) = match histogram.as_ref() {
            Some(h) if h.len() > 0 => (
                h.mean() as u64,
                h.value_at_quantile(0.50),
                h.value_at_quantile(0.99),
                h.max(),
            ),
            _ => (0, 0, 0, 0),
        };

        MetricsSnapshot {
            uptime: self.start_time.elapsed(),
            nodes_executed: self.nodes_executed.load(Ordering::Relaxed),
            nodes_failed: self.nodes_failed.load(Ordering::Relaxed),
            tasks_stolen: self.tasks_stolen.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            subgraph_instantiations: self.subgraph_instantiations.load(Ordering::Relaxed),
            device_launches: self.device_launches.load(Ordering::Relaxed),
            avg_latency_ns: avg,
            p50_latency_ns: p50,
            p99_latency_ns: p99,
            max_latency_ns: max,
        }
    }

    pub fn reset(&self) {
        self.nodes_executed.store(0, Ordering::Relaxed);
        self.nodes_failed.store(0, Ordering::Relaxed);
        self.tasks_stolen.store(0, Ordering::Relaxed);
        self.runs_completed.store(0, Ordering::Relaxed);
        self.subgraph_instantiations.store(0, Ordering::Relaxed);
        self.device_launches.store(0, Ordering::Relaxed);

        if let Some(hist) = self.latency_histogram.write().as_mut() {
            hist.reset();
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub uptime: Duration,
    pub nodes_executed: u64,
    pub nodes_failed: u64,
    pub tasks_stolen: u64,
    pub runs_completed: u64,
    pub subgraph_instantiations: u64,
    pub device_launches: u64,
    pub avg_latency_ns: u64,
    pub p50_latency_ns: u64,
    pub p99_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl MetricsSnapshot {
    pub fn nodes_per_second(&self) -> f64 {
        let seconds = self.uptime.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.nodes_executed as f64 / seconds
    }
}
