//! Execution metrics.
//!
//! With the `telemetry` feature disabled the same API compiles to no-ops.

#[cfg(feature = "telemetry")]
pub mod export;
#[cfg(feature = "telemetry")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub use export::{ConsoleExporter, JsonExporter, MetricsExporter};
#[cfg(feature = "telemetry")]
pub use metrics::{Metrics, MetricsSnapshot};

// Stub implementations when telemetry is disabled
#[cfg(not(feature = "telemetry"))]
pub mod metrics {
    use std::time::Duration;

    #[derive(Debug, Default)]
    pub struct Metrics;

    impl Metrics {
        pub fn new() -> Self {
            Self
        }
        pub fn record_node_execution(&self, _: u64) {}
        pub fn record_node_failure(&self) {}
        pub fn record_task_stolen(&self) {}
        pub fn record_run_completed(&self) {}
        pub fn record_instantiation(&self) {}
        pub fn record_launches(&self, _: u64) {}
        pub fn reset(&self) {}
        pub fn snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot::default()
        }
    }

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
            0.0
        }
    }
}

#[cfg(not(feature = "telemetry"))]
pub use metrics::{Metrics, MetricsSnapshot};
