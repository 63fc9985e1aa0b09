//! Writing metric snapshots out of the process.

use super::metrics::MetricsSnapshot;
use crate::error::{Error, Result};
use std::path::PathBuf;

pub trait MetricsExporter: Send + Sync {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()>;
}

/// Pretty-printed JSON written to a file, replacing previous contents.
#[derive(Debug, Clone)]
pub struct JsonExporter {
    output_path: PathBuf,
}

impl JsonExporter {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let record = ExportRecord::from(snapshot);
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| Error::telemetry(format!("JSON serialization failed: {}", e)))?;

        std::fs::write(&self.output_path, json).map_err(|e| {
            Error::telemetry(format!(
                "failed to write {}: {}",
                self.output_path.display(),
                e
            ))
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
struct ExportRecord {
    uptime_secs: f64,
    nodes_executed: u64,
    nodes_failed: u64,
    tasks_stolen: u64,
    runs_completed: u64,
    subgraph_instantiations: u64,
    device_launches: u64,
    avg_latency_us: f64,
    p50_latency_us: f64,
    p99_latency_us: f64,
    max_latency_us: f64,
    nodes_per_second: f64,
}

impl From<&MetricsSnapshot> for ExportRecord {
    fn from(s: &MetricsSnapshot) -> Self {
        Self {
            uptime_secs: s.uptime.as_secs_f64(),
            nodes_executed: s.nodes_executed,
            nodes_failed: s.nodes_failed,
            tasks_stolen: s.tasks_stolen,
            runs_completed: s.runs_completed,
            subgraph_instantiations: s.subgraph_instantiations,
            device_launches: s.device_launches,
            avg_latency_us: s.avg_latency_ns as f64 / 1_000.0,
            p50_latency_us: s.p50_latency_ns as f64 / 1_000.0,
            p99_latency_us: s.p99_latency_ns as f64 / 1_000.0,
            max_latency_us: s.max_latency_ns as f64 / 1_000.0,
            nodes_per_second: s.nodes_per_second(),
        }
    }
}

/// Human-readable summary on stdout.
#[derive(Debug, Clone, Default)]
pub struct ConsoleExporter {
    verbose: bool,
}

impl ConsoleExporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl MetricsExporter for ConsoleExporter {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        println!("=== veda-flow metrics ===");
        println!("Uptime: {:.2}s", snapshot.uptime.as_secs_f64());
        println!("Runs completed: {}", snapshot.runs_completed);
        println!(
            "Nodes executed: {} ({} failed)",
            snapshot.nodes_executed, snapshot.nodes_failed
        );
        println!("Tasks stolen: {}", snapshot.tasks_stolen);
        println!(
            "Device: {} instantiation(s), {} launch(es)",
            snapshot.subgraph_instantiations, snapshot.device_launches
        );

        if self.verbose {
            println!("\nNode latency:");
            println!("  Average: {:.2}μs", snapshot.avg_latency_ns as f64 / 1_000.0);
            println!("  P50: {:.2}μs", snapshot.p50_latency_ns as f64 / 1_000.0);
            println!("  P99: {:.2}μs", snapshot.p99_latency_ns as f64 / 1_000.0);
            println!("  Max: {:.2}μs", snapshot.max_latency_ns as f64 / 1_000.0);
        }

        println!("=========================");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample() -> MetricsSnapshot {
        MetricsSnapshot {
            uptime: Duration::from_secs(4),
            nodes_executed: 400,
            nodes_failed: 2,
            runs_completed: 10,
            device_launches: 20,
            subgraph_instantiations: 1,
            avg_latency_ns: 1500,
            ..Default::default()
        }
    }

    #[test]
    fn test_console_exporter() {
        assert!(ConsoleExporter::new(true).export(&sample()).is_ok());
    }

    #[test]
    fn test_json_exporter_writes_fields() {
        let path = std::env::temp_dir().join(format!(
            "veda_flow_metrics_{}.json",
            std::process::id()
        ));
        JsonExporter::new(&path).export(&sample()).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["nodes_executed"], 400);
        assert_eq!(value["device_launches"], 20);
        assert_eq!(value["nodes_per_second"], 100.0);
        assert_eq!(value["avg_latency_us"], 1.5);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_json_exporter_reports_bad_path() {
        let exporter = JsonExporter::new("/nonexistent-dir/metrics.json");
        assert!(matches!(
            exporter.export(&sample()),
            Err(Error::Telemetry(_))
        ));
    }
}
