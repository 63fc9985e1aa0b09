//! Condition nodes driving a loop around a device subgraph
//!
//! `check` inspects a host mirror of the device data and either branches
//! back into the device-flow node or exits. The subgraph is recorded on the
//! first pass and relaunched on every later one.

use bytemuck::{Pod, Zeroable};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use veda_flow::prelude::*;

const LEN: usize = 4096;
const THRESHOLD: f32 = 1.0;

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct HalveArgs {
    data: DevicePtr<f32>,
    n: u32,
    _pad: u32,
}

fn halve(ctx: &ThreadContext<'_>) {
    let args: HalveArgs = ctx.args();
    let i = ctx.global_id_x();
    if i < args.n as usize {
        ctx.store(args.data, i, ctx.load(args.data, i) * 0.5);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let executor = Executor::new(Config::builder().num_threads(2).build()?)?;
    let runtime = executor.runtime().clone();

    let initial: Vec<f32> = (0..LEN).map(|i| (i % 97) as f32 * 10.0).collect();
    let device = Arc::new(DeviceBuffer::from_slice(
        &runtime,
        Location::Device(DeviceId::new(0)),
        &initial,
    )?);
    let mirror = Arc::new(DeviceBuffer::<f32>::alloc_host(&runtime, LEN)?);
    let passes = Arc::new(AtomicUsize::new(0));

    let mut graph = Graph::named("halve_until_small");

    let start = graph.add_node(|| tracing::info!("loop starting"));

    let step = {
        let device = device.clone();
        let mirror = mirror.clone();
        let passes = passes.clone();
        graph.add_device_flow_persistent(move |flow: &mut DeviceFlow<'_>| {
            passes.fetch_add(1, Ordering::Relaxed);
            if flow.state() != SubgraphState::Building {
                return Ok(());
            }
            let args = HalveArgs {
                data: device.as_ptr(),
                n: LEN as u32,
                _pad: 0,
            };
            let kernel = flow.kernel(LaunchGeometry::for_elements(LEN, 128), halve, &args)?;
            let readback = flow.copy(mirror.as_ptr(), device.as_ptr(), LEN)?;
            flow.precede(kernel, [readback])?;
            Ok(())
        })
    };

    let check = {
        let mirror = mirror.clone();
        graph.add_condition(move || {
            let max = mirror
                .to_vec()
                .map(|v| v.into_iter().fold(0.0f32, f32::max))
                .unwrap_or(0.0);
            if max >= THRESHOLD {
                0
            } else {
                1
            }
        })
    };

    let done = {
        let passes = passes.clone();
        graph.add_node(move || {
            tracing::info!(passes = passes.load(Ordering::Relaxed), "values below threshold")
        })
    };

    graph.name(start, "start")?;
    graph.name(step, "halve")?;
    graph.name(check, "check")?;
    graph.name(done, "done")?;

    graph.precede(start, [step])?;
    graph.precede(step, [check])?;
    // branch 0 loops back, branch 1 exits
    graph.precede(check, [step, done])?;

    let graph = Arc::new(graph);
    graph.validate()?;
    print!("{}", graph.dump_edges());

    executor.run(&graph).get()?;

    let launches = graph.with_subgraph(step, |s| s.launches()).unwrap_or(0);
    println!(
        "passes = {}, launches = {}, max = {:?}",
        passes.load(Ordering::Relaxed),
        launches,
        mirror
            .to_vec()?
            .into_iter()
            .fold(0.0f32, f32::max)
    );
    Ok(())
}
