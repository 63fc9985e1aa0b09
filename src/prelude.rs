pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{Error, Result};
pub use crate::executor::{Executor, PanicStrategy, RunFuture};
pub use crate::flow::{DeviceFlow, OpHandle, SubgraphState};
pub use crate::graph::{Graph, NodeHandle, NodeKind};

pub use crate::gpu::{
    current_device, scoped_device, DeviceBuffer, DeviceId, DevicePtr, DeviceRuntime, Dim3,
    Emulator, LaunchGeometry, Location, ThreadContext,
};

pub use crate::telemetry::{Metrics, MetricsSnapshot};
