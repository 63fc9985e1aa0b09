//! SAXPY across a host/device task graph
//!
//! Two host nodes allocate pinned host buffers and device buffers in
//! parallel; a device-flow node then copies the inputs in, runs the kernel,
//! and copies the result back. The same graph is run several times with a
//! different scale factor, updating the recorded kernel in place. Buffers
//! are allocated on the first run and reused afterwards.

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use veda_flow::prelude::*;

const N: usize = 1 << 20;

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct SaxpyArgs {
    x: DevicePtr<f32>,
    y: DevicePtr<f32>,
    n: u64,
    a: f32,
    _pad: u32,
}

fn saxpy(ctx: &ThreadContext<'_>) {
    let args: SaxpyArgs = ctx.args();
    let i = ctx.global_id_x();
    if (i as u64) < args.n {
        let x = ctx.load(args.x, i);
        let y = ctx.load(args.y, i);
        ctx.store(args.y, i, args.a * x + y);
    }
}

#[derive(Default)]
struct Buffers {
    host_x: Option<DeviceBuffer<f32>>,
    host_y: Option<DeviceBuffer<f32>>,
    dev_x: Option<DeviceBuffer<f32>>,
    dev_y: Option<DeviceBuffer<f32>>,
}

fn ptr(buffer: &Option<DeviceBuffer<f32>>, what: &str) -> Result<DevicePtr<f32>> {
    buffer
        .as_ref()
        .map(DeviceBuffer::as_ptr)
        .ok_or_else(|| Error::invalid_argument(format!("{} not allocated", what)))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let executor = Executor::new(Config::default())?;
    let runtime = executor.runtime().clone();
    let buffers = Arc::new(Mutex::new(Buffers::default()));
    let scale = Arc::new(AtomicU32::new(2.0f32.to_bits()));

    let mut graph = Graph::named("saxpy");

    let host = {
        let rt = runtime.clone();
        let buffers = buffers.clone();
        graph.add_fallible_node(move || {
            let mut b = buffers.lock();
            match &b.host_y {
                Some(y) => y.copy_from_host(&vec![2.0; N])?,
                None => {
                    b.host_x = Some(DeviceBuffer::from_slice(&rt, Location::Host, &vec![1.0; N])?);
                    b.host_y = Some(DeviceBuffer::from_slice(&rt, Location::Host, &vec![2.0; N])?);
                }
            }
            Ok(())
        })
    };
    graph.name(host, "alloc_host")?;

    let device = {
        let rt = runtime.clone();
        let buffers = buffers.clone();
        graph.add_fallible_node(move || {
            let mut b = buffers.lock();
            if b.dev_x.is_none() {
                b.dev_x = Some(DeviceBuffer::alloc(&rt, DeviceId::new(0), N)?);
                b.dev_y = Some(DeviceBuffer::alloc(&rt, DeviceId::new(0), N)?);
            }
            Ok(())
        })
    };
    graph.name(device, "alloc_device")?;

    let compute = {
        let buffers = buffers.clone();
        let scale = scale.clone();
        graph.add_device_flow_persistent(move |flow: &mut DeviceFlow<'_>| {
            let b = buffers.lock();
            let (hx, hy) = (ptr(&b.host_x, "host x")?, ptr(&b.host_y, "host y")?);
            let (dx, dy) = (ptr(&b.dev_x, "device x")?, ptr(&b.dev_y, "device y")?);
            let args = SaxpyArgs {
                x: dx,
                y: dy,
                n: N as u64,
                a: f32::from_bits(scale.load(Ordering::Relaxed)),
                _pad: 0,
            };
            let geometry = LaunchGeometry::for_elements(N, 256);

            if let Some(kernel) = flow.find("saxpy") {
                return flow.update_kernel(kernel, geometry, saxpy, &args);
            }

            let h2d_x = flow.copy(dx, hx, N)?;
            let h2d_y = flow.copy(dy, hy, N)?;
            let kernel = flow.kernel(geometry, saxpy, &args)?;
            let d2h_y = flow.copy(hy, dy, N)?;
            flow.succeed(kernel, [h2d_x, h2d_y])?;
            flow.precede(kernel, [d2h_y])?;

            flow.name(h2d_x, "h2d_x")?;
            flow.name(h2d_y, "h2d_y")?;
            flow.name(kernel, "saxpy")?;
            flow.name(d2h_y, "d2h_y")?;
            Ok(())
        })
    };
    graph.name(compute, "saxpy_flow")?;
    graph.precede(host, [compute])?;
    graph.precede(device, [compute])?;

    let graph = Arc::new(graph);
    for a in [2.0f32, 3.0, 0.5] {
        scale.store(a.to_bits(), Ordering::Relaxed);
        let start = Instant::now();
        executor.run(&graph).get()?;

        let y = buffers
            .lock()
            .host_y
            .as_ref()
            .map(DeviceBuffer::to_vec)
            .transpose()?
            .unwrap_or_default();
        let expected = a * 1.0 + 2.0;
        let errors = y.iter().filter(|&&v| (v - expected).abs() > 1e-6).count();
        println!(
            "a = {:>4}: y[0] = {:?}, mismatches = {}, elapsed = {:?}",
            a,
            y.first(),
            errors,
            start.elapsed()
        );
    }

    println!("\nsubgraph edges:");
    if let Some(dump) = graph.with_subgraph(compute, |s| s.dump_edges()) {
        print!("{}", dump);
    }
    #[cfg(feature = "telemetry")]
    {
        use veda_flow::telemetry::{ConsoleExporter, MetricsExporter};
        ConsoleExporter::new(true).export(&executor.metrics().snapshot())?;
    }
    Ok(())
}
