//! veda-flow - heterogeneous task graphs with replayable device subgraphs
//!
//! Host work is expressed as a [`Graph`] of nodes with explicit dependency
//! edges and executed on a work-stealing pool by an [`Executor`]. Device work
//! is recorded inside device-flow nodes through a [`DeviceFlow`] builder into
//! a [`Subgraph`], instantiated once by a [`DeviceRuntime`], then launched as
//! many times as needed with in-place parameter updates.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use veda_flow::prelude::*;
//!
//! let executor = Executor::new(Config::default())?;
//! let mut graph = Graph::new();
//!
//! let a = graph.add_node(|| println!("a"));
//! let b = graph.add_node(|| println!("b"));
//! graph.precede(a, [b])?;
//!
//! executor.run(&Arc::new(graph)).get()?;
//! # Ok::<(), veda_flow::Error>(())
//! ```
//!
//! # Features
//!
//! - **Work Stealing**: per-worker FIFO queues with randomized stealing
//! - **Condition Nodes**: weak edges for branches and loops
//! - **Device Subgraphs**: record once, instantiate once, offload repeatedly
//! - **Emulated Devices**: a host-side [`DeviceRuntime`] for running device
//!   graphs without hardware
//! - **Telemetry**: node latency histograms and counters (optional)

// Lint configuration
#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod executor;
pub mod flow;
pub mod gpu;
pub mod graph;
pub mod prelude;
pub mod telemetry;

// Re-export key types at crate root
pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result};
pub use executor::{Executor, PanicStrategy, RunFuture};
pub use flow::{DeviceFlow, OpHandle, Subgraph, SubgraphState};
pub use gpu::{DeviceId, DeviceRuntime, Emulator};
pub use graph::{Graph, NodeHandle, NodeKind};
