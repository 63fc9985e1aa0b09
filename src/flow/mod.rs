//! Device subgraphs: recording, instantiation, offload and parameter updates.
//!
//! A [`Subgraph`] moves through `Building -> Instantiated -> Offloaded`.
//! Instantiation happens at most once, on the first offload. After that the
//! set of operations and edges is fixed and only operation parameters may
//! change, through the `update_*` methods of [`DeviceFlow`].

mod builder;
mod subgraph;

pub use builder::DeviceFlow;
pub use subgraph::{OpHandle, Subgraph, SubgraphState};
