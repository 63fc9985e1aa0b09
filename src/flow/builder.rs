use super::subgraph::{OpHandle, Subgraph, SubgraphState};
use crate::error::{Error, Result};
use crate::gpu::kernel::{KernelArgs, KernelFn, LaunchGeometry};
use crate::gpu::op::{FillPattern, KernelParams, OpParams};
use crate::gpu::{scoped_device, DeviceId, DeviceOp, DevicePtr, DeviceRuntime, Location};
use bytemuck::Pod;
use std::fmt;
use std::sync::Arc;

/// Builder and launcher for a device subgraph.
///
/// Device-flow nodes receive one inside their callback. Operations recorded
/// without an explicit device use the subgraph's device; the `*_on` variants
/// bind an operation to another device. An operation's device is the
/// thread's active device (see [`crate::gpu::current_device`]) while it is
/// recorded. Pointers are resolved against the runtime when an operation is
/// recorded, and whether they are valid on the device that uses them is left
/// to the caller.
///
/// If the callback returns without offloading, the executor launches the
/// subgraph once and waits for it. Unless the node was added as persistent,
/// the callback starts from an empty subgraph every time it is invoked.
pub struct DeviceFlow<'a> {
    subgraph: &'a mut Subgraph,
    runtime: &'a Arc<dyn DeviceRuntime>,
}

impl<'a> DeviceFlow<'a> {
    pub fn new(subgraph: &'a mut Subgraph, runtime: &'a Arc<dyn DeviceRuntime>) -> Self {
        Self { subgraph, runtime }
    }

    pub fn device(&self) -> DeviceId {
        self.subgraph.device()
    }

    pub fn state(&self) -> SubgraphState {
        self.subgraph.state()
    }

    pub fn num_nodes(&self) -> usize {
        self.subgraph.num_nodes()
    }

    pub fn num_edges(&self) -> usize {
        self.subgraph.num_edges()
    }

    pub fn subgraph(&self) -> &Subgraph {
        self.subgraph
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        self.runtime
    }

    /// Handle of the operation named `name`, e.g. to update it on a later run.
    pub fn find(&self, name: &str) -> Option<OpHandle> {
        self.subgraph.find(name)
    }

    // ---- recording ----

    pub fn kernel<A: Pod>(
        &mut self,
        geometry: LaunchGeometry,
        func: KernelFn,
        args: &A,
    ) -> Result<OpHandle> {
        self.kernel_on(self.device(), geometry, func, args)
    }

    pub fn kernel_on<A: Pod>(
        &mut self,
        device: DeviceId,
        geometry: LaunchGeometry,
        func: KernelFn,
        args: &A,
    ) -> Result<OpHandle> {
        self.record(device, |flow| flow.kernel_op(device, geometry, func, args))
    }

    /// Copy `count` elements of `T`.
    pub fn copy<T: Pod>(
        &mut self,
        dst: DevicePtr<T>,
        src: DevicePtr<T>,
        count: usize,
    ) -> Result<OpHandle> {
        self.copy_on(self.device(), dst, src, count)
    }

    pub fn copy_on<T: Pod>(
        &mut self,
        device: DeviceId,
        dst: DevicePtr<T>,
        src: DevicePtr<T>,
        count: usize,
    ) -> Result<OpHandle> {
        let bytes = DevicePtr::<T>::element_bytes(count)?;
        self.record(device, |flow| flow.copy_op(device, dst.addr(), src.addr(), bytes))
    }

    /// Copy `bytes` raw bytes.
    pub fn memcpy<D, S>(
        &mut self,
        dst: DevicePtr<D>,
        src: DevicePtr<S>,
        bytes: usize,
    ) -> Result<OpHandle> {
        self.memcpy_on(self.device(), dst, src, bytes)
    }

    pub fn memcpy_on<D, S>(
        &mut self,
        device: DeviceId,
        dst: DevicePtr<D>,
        src: DevicePtr<S>,
        bytes: usize,
    ) -> Result<OpHandle> {
        self.record(device, |flow| flow.copy_op(device, dst.addr(), src.addr(), bytes))
    }

    /// Set `count` elements to `value`. `T` must be 1, 2 or 4 bytes wide.
    pub fn fill<T: Pod>(&mut self, dst: DevicePtr<T>, value: T, count: usize) -> Result<OpHandle> {
        self.fill_on(self.device(), dst, value, count)
    }

    pub fn fill_on<T: Pod>(
        &mut self,
        device: DeviceId,
        dst: DevicePtr<T>,
        value: T,
        count: usize,
    ) -> Result<OpHandle> {
        self.record(device, |flow| flow.fill_op(device, dst, value, count))
    }

    /// Set `bytes` bytes to `value`.
    pub fn memset<T>(&mut self, dst: DevicePtr<T>, value: u8, bytes: usize) -> Result<OpHandle> {
        self.memset_on(self.device(), dst, value, bytes)
    }

    pub fn memset_on<T>(
        &mut self,
        device: DeviceId,
        dst: DevicePtr<T>,
        value: u8,
        bytes: usize,
    ) -> Result<OpHandle> {
        self.record(device, |flow| flow.memset_op(device, dst.addr(), value, bytes))
    }

    /// Zero `count` elements of `T`.
    pub fn zero<T: Pod>(&mut self, dst: DevicePtr<T>, count: usize) -> Result<OpHandle> {
        self.zero_on(self.device(), dst, count)
    }

    pub fn zero_on<T: Pod>(
        &mut self,
        device: DeviceId,
        dst: DevicePtr<T>,
        count: usize,
    ) -> Result<OpHandle> {
        let bytes = DevicePtr::<T>::element_bytes(count)?;
        self.record(device, |flow| flow.zero_op(device, dst.addr(), bytes))
    }

    // ---- edges ----

    /// `op` runs before every operation in `others`.
    pub fn precede<I>(&mut self, op: OpHandle, others: I) -> Result<()>
    where
        I: IntoIterator<Item = OpHandle>,
    {
        for other in others {
            self.subgraph.add_edge(op, other)?;
        }
        Ok(())
    }

    /// `op` runs after every operation in `others`.
    pub fn succeed<I>(&mut self, op: OpHandle, others: I) -> Result<()>
    where
        I: IntoIterator<Item = OpHandle>,
    {
        for other in others {
            self.subgraph.add_edge(other, op)?;
        }
        Ok(())
    }

    pub fn name<S: Into<String>>(&mut self, op: OpHandle, name: S) -> Result<()> {
        self.subgraph.set_name(op, name.into())
    }

    // ---- offload ----

    /// Instantiate if needed, launch once and wait for the device.
    pub fn offload(&mut self) -> Result<()> {
        self.subgraph.instantiate(self.runtime.as_ref())?;
        self.subgraph.launch_once()
    }

    /// Launch `n` times back to back, waiting for each launch before the next.
    pub fn offload_times(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        self.subgraph.instantiate(self.runtime.as_ref())?;
        for _ in 0..n {
            self.subgraph.launch_once()?;
        }
        Ok(())
    }

    /// Launch, wait, then ask `predicate` whether to stop. `predicate` runs on
    /// the calling thread exactly once per completed launch.
    pub fn offload_until<P>(&mut self, mut predicate: P) -> Result<()>
    where
        P: FnMut() -> bool,
    {
        self.subgraph.instantiate(self.runtime.as_ref())?;
        loop {
            self.subgraph.launch_once()?;
            if predicate() {
                return Ok(());
            }
        }
    }

    /// Launch once unless the subgraph already ran in this invocation, or
    /// has nothing to run.
    pub fn finish(&mut self) -> Result<()> {
        if self.subgraph.offloaded_this_run() || self.subgraph.is_empty() {
            return Ok(());
        }
        self.offload()
    }

    // ---- updates ----

    pub fn update_kernel<A: Pod>(
        &mut self,
        op: OpHandle,
        geometry: LaunchGeometry,
        func: KernelFn,
        args: &A,
    ) -> Result<()> {
        let device = self.recorded_device(op)?;
        let (new_op, bindings) = self.kernel_op(device, geometry, func, args)?;
        self.subgraph.update(op, new_op, bindings)
    }

    pub fn update_copy<T: Pod>(
        &mut self,
        op: OpHandle,
        dst: DevicePtr<T>,
        src: DevicePtr<T>,
        count: usize,
    ) -> Result<()> {
        let device = self.recorded_device(op)?;
        let bytes = DevicePtr::<T>::element_bytes(count)?;
        let (new_op, bindings) = self.copy_op(device, dst.addr(), src.addr(), bytes)?;
        self.subgraph.update(op, new_op, bindings)
    }

    pub fn update_memcpy<D, S>(
        &mut self,
        op: OpHandle,
        dst: DevicePtr<D>,
        src: DevicePtr<S>,
        bytes: usize,
    ) -> Result<()> {
        let device = self.recorded_device(op)?;
        let (new_op, bindings) = self.copy_op(device, dst.addr(), src.addr(), bytes)?;
        self.subgraph.update(op, new_op, bindings)
    }

    pub fn update_fill<T: Pod>(
        &mut self,
        op: OpHandle,
        dst: DevicePtr<T>,
        value: T,
        count: usize,
    ) -> Result<()> {
        let device = self.recorded_device(op)?;
        let (new_op, bindings) = self.fill_op(device, dst, value, count)?;
        self.subgraph.update(op, new_op, bindings)
    }

    pub fn update_memset<T>(
        &mut self,
        op: OpHandle,
        dst: DevicePtr<T>,
        value: u8,
        bytes: usize,
    ) -> Result<()> {
        let device = self.recorded_device(op)?;
        let (new_op, bindings) = self.memset_op(device, dst.addr(), value, bytes)?;
        self.subgraph.update(op, new_op, bindings)
    }

    pub fn update_zero<T: Pod>(&mut self, op: OpHandle, dst: DevicePtr<T>, count: usize) -> Result<()> {
        let device = self.recorded_device(op)?;
        let bytes = DevicePtr::<T>::element_bytes(count)?;
        let (new_op, bindings) = self.zero_op(device, dst.addr(), bytes)?;
        self.subgraph.update(op, new_op, bindings)
    }

    // ---- operation construction ----

    /// Record one operation with `device` active on the calling thread.
    fn record<F>(&mut self, device: DeviceId, build: F) -> Result<OpHandle>
    where
        F: FnOnce(&Self) -> Result<(DeviceOp, Vec<Location>)>,
    {
        self.subgraph.ensure_building()?;
        let _device = scoped_device(device);
        let (op, bindings) = build(self)?;
        self.subgraph.push_op(op, bindings)
    }

    fn recorded_device(&self, op: OpHandle) -> Result<DeviceId> {
        self.subgraph
            .op(op)
            .map(|recorded| recorded.device)
            .ok_or_else(|| Error::invalid_argument(format!("unknown operation handle {}", op.0)))
    }

    fn check_device(&self, device: DeviceId) -> Result<()> {
        let count = self.runtime.device_count();
        if device.index() >= count {
            return Err(Error::invalid_argument(format!(
                "{} does not exist ({} available)",
                device, count
            )));
        }
        Ok(())
    }

    fn locate(&self, what: &str, addr: u64, bytes: usize) -> Result<Location> {
        self.runtime.locate(addr, bytes).map_err(|_| {
            Error::invalid_argument(format!(
                "{} range {:#x}+{} is not inside a single allocation",
                what, addr, bytes
            ))
        })
    }

    fn kernel_op<A: Pod>(
        &self,
        device: DeviceId,
        geometry: LaunchGeometry,
        func: KernelFn,
        args: &A,
    ) -> Result<(DeviceOp, Vec<Location>)> {
        self.check_device(device)?;
        geometry.validate()?;
        let params = KernelParams {
            func,
            geometry,
            args: KernelArgs::pack(args),
        };
        Ok((DeviceOp::new(device, OpParams::Kernel(params)), Vec::new()))
    }

    fn copy_op(
        &self,
        device: DeviceId,
        dst: u64,
        src: u64,
        bytes: usize,
    ) -> Result<(DeviceOp, Vec<Location>)> {
        self.check_device(device)?;
        nonzero(bytes, "copy")?;
        let dst_loc = self.locate("copy destination", dst, bytes)?;
        let src_loc = self.locate("copy source", src, bytes)?;
        let params = if dst_loc.is_host() || src_loc.is_host() {
            OpParams::HostCopy { dst, src, bytes }
        } else {
            OpParams::DeviceCopy { dst, src, bytes }
        };
        Ok((DeviceOp::new(device, params), vec![dst_loc, src_loc]))
    }

    fn fill_op<T: Pod>(
        &self,
        device: DeviceId,
        dst: DevicePtr<T>,
        value: T,
        count: usize,
    ) -> Result<(DeviceOp, Vec<Location>)> {
        let pattern = FillPattern::from_value(value)?;
        self.check_device(device)?;
        nonzero(count, "fill")?;
        let bytes = DevicePtr::<T>::element_bytes(count)?;
        let dst_loc = self.locate("fill destination", dst.addr(), bytes)?;
        let params = OpParams::Fill {
            dst: dst.addr(),
            pattern,
            count,
        };
        Ok((DeviceOp::new(device, params), vec![dst_loc]))
    }

    fn memset_op(
        &self,
        device: DeviceId,
        dst: u64,
        value: u8,
        bytes: usize,
    ) -> Result<(DeviceOp, Vec<Location>)> {
        self.check_device(device)?;
        nonzero(bytes, "memset")?;
        let dst_loc = self.locate("memset destination", dst, bytes)?;
        Ok((
            DeviceOp::new(device, OpParams::Memset { dst, value, bytes }),
            vec![dst_loc],
        ))
    }

    fn zero_op(&self, device: DeviceId, dst: u64, bytes: usize) -> Result<(DeviceOp, Vec<Location>)> {
        self.check_device(device)?;
        nonzero(bytes, "zero")?;
        let dst_loc = self.locate("zero destination", dst, bytes)?;
        Ok((
            DeviceOp::new(device, OpParams::Zero { dst, bytes }),
            vec![dst_loc],
        ))
    }
}

fn nonzero(n: usize, what: &str) -> Result<()> {
    if n == 0 {
        return Err(Error::invalid_argument(format!("zero-sized {}", what)));
    }
    Ok(())
}

impl fmt::Debug for DeviceFlow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFlow")
            .field("subgraph", &self.subgraph)
            .field("runtime", &self.runtime.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::kernel::ThreadContext;
    use crate::gpu::{current_device, DeviceBuffer, Emulator, ExecutableGraph, GraphTemplate};
    use bytemuck::Zeroable;
    use parking_lot::Mutex;
    use std::cell::Cell;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct AddArgs {
        data: DevicePtr<i32>,
        n: u32,
        delta: i32,
    }

    fn add(ctx: &ThreadContext<'_>) {
        let args: AddArgs = ctx.args();
        let i = ctx.global_id_x();
        if i < args.n as usize {
            ctx.store(args.data, i, ctx.load(args.data, i) + args.delta);
        }
    }

    fn sub(ctx: &ThreadContext<'_>) {
        let args: AddArgs = ctx.args();
        let i = ctx.global_id_x();
        if i < args.n as usize {
            ctx.store(args.data, i, ctx.load(args.data, i) - args.delta);
        }
    }

    fn runtime(devices: usize) -> Arc<dyn DeviceRuntime> {
        Arc::new(Emulator::new(devices))
    }

    /// Emulator that remembers the active device on every `locate`.
    #[derive(Debug)]
    struct DeviceTracking {
        inner: Emulator,
        seen: Mutex<Vec<Option<DeviceId>>>,
    }

    impl DeviceRuntime for DeviceTracking {
        fn name(&self) -> &str {
            "device-tracking"
        }

        fn device_count(&self) -> usize {
            self.inner.device_count()
        }

        fn allocate(&self, location: Location, bytes: usize) -> Result<u64> {
            self.inner.allocate(location, bytes)
        }

        fn free(&self, addr: u64) -> Result<()> {
            self.inner.free(addr)
        }

        fn locate(&self, addr: u64, bytes: usize) -> Result<Location> {
            self.seen.lock().push(current_device());
            self.inner.locate(addr, bytes)
        }

        fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
            self.inner.write(addr, data)
        }

        fn read(&self, addr: u64, out: &mut [u8]) -> Result<()> {
            self.inner.read(addr, out)
        }

        fn instantiate(&self, template: GraphTemplate<'_>) -> Result<Box<dyn ExecutableGraph>> {
            self.inner.instantiate(template)
        }
    }

    #[test]
    fn test_fill_rejects_three_byte_elements_before_recording() {
        let rt = runtime(1);
        let buf = DeviceBuffer::<[u8; 3]>::alloc(&rt, DeviceId(0), 8).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);

        let result = flow.fill(buf.as_ptr(), [1, 2, 3], 8);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(flow.num_nodes(), 0);
        assert!(!flow.subgraph().is_instantiated());
    }

    #[test]
    fn test_zero_sized_operations_rejected() {
        let rt = runtime(1);
        let buf = DeviceBuffer::<u32>::alloc(&rt, DeviceId(0), 4).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);

        assert!(matches!(flow.zero(buf.as_ptr(), 0), Err(Error::InvalidArgument(_))));
        assert!(flow.memset(buf.as_ptr(), 1, 0).is_err());
        assert!(flow.copy(buf.as_ptr(), buf.as_ptr(), 0).is_err());
    }

    #[test]
    fn test_overflowing_sizes_rejected() {
        let rt = runtime(1);
        let buf = DeviceBuffer::<u32>::alloc(&rt, DeviceId(0), 4).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);
        let huge = usize::MAX / 2;

        assert!(matches!(
            flow.copy(buf.as_ptr(), buf.as_ptr(), huge),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(flow.zero(buf.as_ptr(), huge), Err(Error::InvalidArgument(_))));
        assert!(matches!(flow.fill(buf.as_ptr(), 1u32, huge), Err(Error::InvalidArgument(_))));
        assert_eq!(flow.num_nodes(), 0);

        let zero = flow.zero(buf.as_ptr(), 4).unwrap();
        assert!(matches!(
            flow.update_zero(zero, buf.as_ptr(), huge),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_recording_activates_operation_device() {
        let tracking = Arc::new(DeviceTracking {
            inner: Emulator::new(2),
            seen: Mutex::new(Vec::new()),
        });
        let rt: Arc<dyn DeviceRuntime> = tracking.clone();
        let buf = DeviceBuffer::<u32>::alloc(&rt, DeviceId(1), 4).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);

        let _outer = scoped_device(DeviceId(0));
        flow.zero_on(DeviceId(1), buf.as_ptr(), 4).unwrap();
        flow.zero(buf.as_ptr(), 4).unwrap();
        assert!(flow.memset_on(DeviceId(1), DevicePtr::<u8>::from_addr(0x42), 0, 1).is_err());

        assert_eq!(
            *tracking.seen.lock(),
            vec![Some(DeviceId(1)), Some(DeviceId(0)), Some(DeviceId(1))]
        );
        assert_eq!(current_device(), Some(DeviceId(0)));
    }

    #[test]
    fn test_unknown_pointer_rejected() {
        let rt = runtime(1);
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);
        let bogus = DevicePtr::<u32>::from_addr(0x42);
        assert!(matches!(flow.zero(bogus, 4), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_host_endpoint_makes_host_copy() {
        let rt = runtime(1);
        let host = DeviceBuffer::<u32>::alloc_host(&rt, 4).unwrap();
        let dev = DeviceBuffer::<u32>::alloc(&rt, DeviceId(0), 4).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);

        let h2d = flow.copy(dev.as_ptr(), host.as_ptr(), 4).unwrap();
        let d2d = flow.copy(dev.as_ptr(), dev.as_ptr(), 2).unwrap();
        assert_eq!(flow.subgraph().op(h2d).map(|o| o.kind()), Some(crate::gpu::OpKind::HostCopy));
        assert_eq!(flow.subgraph().op(d2d).map(|o| o.kind()), Some(crate::gpu::OpKind::DeviceCopy));
    }

    #[test]
    fn test_kernel_on_validates_device() {
        let rt = runtime(2);
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);
        let args = AddArgs::zeroed();
        let geometry = LaunchGeometry::new(1, 1);

        let on_one = flow.kernel_on(DeviceId(1), geometry, add, &args).unwrap();
        assert_eq!(flow.subgraph().op(on_one).map(|o| o.device), Some(DeviceId(1)));
        assert!(matches!(
            flow.kernel_on(DeviceId(2), geometry, add, &args),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_offload_freezes_topology() {
        let rt = runtime(1);
        let buf = DeviceBuffer::<u32>::alloc(&rt, DeviceId(0), 4).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);

        let a = flow.fill(buf.as_ptr(), 7u32, 4).unwrap();
        let b = flow.zero(buf.as_ptr(), 1).unwrap();
        flow.precede(a, [b]).unwrap();
        flow.offload().unwrap();

        assert_eq!(flow.state(), SubgraphState::Offloaded);
        assert!(matches!(flow.zero(buf.as_ptr(), 1), Err(Error::TopologyViolation(_))));
        assert!(matches!(flow.succeed(a, [b]), Err(Error::TopologyViolation(_))));
        assert_eq!(buf.to_vec().unwrap(), vec![0, 7, 7, 7]);
    }

    #[test]
    fn test_offload_times_counts_launches() {
        let rt = runtime(1);
        let buf = DeviceBuffer::<i32>::from_slice(&rt, Location::Device(DeviceId(0)), &[0; 8]).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);
        let args = AddArgs {
            data: buf.as_ptr(),
            n: 8,
            delta: 1,
        };
        flow.kernel(LaunchGeometry::for_elements(8, 4), add, &args).unwrap();

        flow.offload_times(0).unwrap();
        assert_eq!(flow.state(), SubgraphState::Building);

        flow.offload_times(5).unwrap();
        assert_eq!(flow.subgraph().launches(), 5);
        assert_eq!(buf.to_vec().unwrap(), vec![5; 8]);

        flow.finish().unwrap();
        assert_eq!(flow.subgraph().launches(), 5);
    }

    #[test]
    fn test_offload_until_calls_predicate_once_per_launch() {
        let rt = runtime(1);
        let buf = DeviceBuffer::<i32>::from_slice(&rt, Location::Host, &[0]).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);
        let args = AddArgs {
            data: buf.as_ptr(),
            n: 1,
            delta: 2,
        };
        flow.kernel(LaunchGeometry::new(1, 1), add, &args).unwrap();

        let calls = Cell::new(0);
        flow.offload_until(|| {
            calls.set(calls.get() + 1);
            calls.get() == 3
        })
        .unwrap();

        assert_eq!(calls.get(), 3);
        assert_eq!(flow.subgraph().launches(), 3);
        assert_eq!(buf.to_vec().unwrap(), vec![6]);
    }

    #[test]
    fn test_implicit_launch_only_without_offload() {
        let rt = runtime(1);
        let buf = DeviceBuffer::<u8>::alloc(&rt, DeviceId(0), 4).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        {
            let mut flow = DeviceFlow::new(&mut sg, &rt);
            flow.memset(buf.as_ptr(), 0xab, 4).unwrap();
            flow.finish().unwrap();
        }
        assert_eq!(sg.launches(), 1);
        assert_eq!(buf.to_vec().unwrap(), vec![0xab; 4]);

        let mut empty = Subgraph::new(DeviceId(0));
        DeviceFlow::new(&mut empty, &rt).finish().unwrap();
        assert_eq!(empty.launches(), 0);
        assert_eq!(empty.state(), SubgraphState::Building);
    }

    #[test]
    fn test_update_kernel_checks_identity() {
        let rt = runtime(1);
        let buf = DeviceBuffer::<i32>::from_slice(&rt, Location::Host, &[10; 4]).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);
        let geometry = LaunchGeometry::new(1, 4);
        let args = AddArgs {
            data: buf.as_ptr(),
            n: 4,
            delta: 1,
        };
        let k = flow.kernel(geometry, add, &args).unwrap();
        flow.offload().unwrap();

        assert!(matches!(
            flow.update_kernel(k, geometry, sub, &args),
            Err(Error::ParameterUpdate(_))
        ));

        flow.update_kernel(k, geometry, add, &AddArgs { delta: 5, ..args }).unwrap();
        flow.offload().unwrap();
        assert_eq!(buf.to_vec().unwrap(), vec![16; 4]);
        assert_eq!(flow.num_nodes(), 1);
        assert_eq!(flow.num_edges(), 0);
    }

    #[test]
    fn test_update_rejects_wrong_kind_and_device() {
        let rt = runtime(2);
        let on0 = DeviceBuffer::<u16>::alloc(&rt, DeviceId(0), 4).unwrap();
        let on1 = DeviceBuffer::<u16>::alloc(&rt, DeviceId(1), 4).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);

        let fill = flow.fill(on0.as_ptr(), 3u16, 4).unwrap();
        flow.offload().unwrap();

        assert!(matches!(
            flow.update_zero(fill, on0.as_ptr(), 4),
            Err(Error::ParameterUpdate(_))
        ));
        assert!(matches!(
            flow.update_fill(fill, on1.as_ptr(), 9u16, 4),
            Err(Error::DeviceMismatch { .. })
        ));
        assert!(matches!(
            flow.update_fill(fill, on0.as_ptr().cast::<u8>(), 1u8, 8),
            Err(Error::ParameterUpdate(_))
        ));

        flow.update_fill(fill, on0.as_ptr(), 9u16, 4).unwrap();
        flow.offload().unwrap();
        assert_eq!(on0.to_vec().unwrap(), vec![9; 4]);
    }

    #[test]
    fn test_edges_through_handles() {
        let rt = runtime(1);
        let buf = DeviceBuffer::<u32>::alloc(&rt, DeviceId(0), 4).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);

        let a = flow.zero(buf.as_ptr(), 4).unwrap();
        let b = flow.fill(buf.as_ptr(), 1u32, 2).unwrap();
        let c = flow.fill(buf.as_ptr().add(2), 2u32, 2).unwrap();
        flow.precede(a, [b, c]).unwrap();
        flow.name(a, "clear").unwrap();

        assert_eq!(flow.num_edges(), 2);
        assert_eq!(flow.find("clear"), Some(a));
        flow.offload().unwrap();
        assert_eq!(buf.to_vec().unwrap(), vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_update_memset_changes_value_and_destination() {
        let rt = runtime(1);
        let first = DeviceBuffer::<u8>::alloc(&rt, DeviceId(0), 8).unwrap();
        let second = DeviceBuffer::<u8>::alloc(&rt, DeviceId(0), 8).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);

        let set = flow.memset(first.as_ptr(), 0x11, 8).unwrap();
        let tail = flow.memset(first.as_ptr().add(6), 0x22, 2).unwrap();
        flow.precede(set, [tail]).unwrap();
        flow.offload().unwrap();
        assert_eq!(first.to_vec().unwrap(), [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x22, 0x22]);

        flow.update_memset(set, first.as_ptr(), 0x33, 4).unwrap();
        flow.offload().unwrap();
        assert_eq!(first.to_vec().unwrap(), [0x33, 0x33, 0x33, 0x33, 0x11, 0x11, 0x22, 0x22]);

        flow.update_memset(set, second.as_ptr(), 0x44, 8).unwrap();
        flow.offload().unwrap();
        assert_eq!(second.to_vec().unwrap(), vec![0x44; 8]);
        assert_eq!(first.to_vec().unwrap(), [0x33, 0x33, 0x33, 0x33, 0x11, 0x11, 0x22, 0x22]);

        assert_eq!(flow.num_nodes(), 2);
        assert_eq!(flow.num_edges(), 1);
        assert_eq!(flow.subgraph().launches(), 3);
    }

    #[test]
    fn test_update_memcpy_changes_source() {
        let rt = runtime(1);
        let a = DeviceBuffer::<u32>::from_slice(&rt, Location::Device(DeviceId(0)), &[1, 2, 3, 4]).unwrap();
        let b = DeviceBuffer::<u32>::from_slice(&rt, Location::Device(DeviceId(0)), &[5, 6, 7, 8]).unwrap();
        let out = DeviceBuffer::<u32>::alloc(&rt, DeviceId(0), 4).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);

        let copy = flow.memcpy(out.as_ptr(), a.as_ptr(), 16).unwrap();
        flow.offload().unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![1, 2, 3, 4]);

        flow.update_memcpy(copy, out.as_ptr(), b.as_ptr(), 8).unwrap();
        flow.offload().unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![5, 6, 3, 4]);

        let host = DeviceBuffer::<u32>::alloc_host(&rt, 4).unwrap();
        assert!(matches!(
            flow.update_memcpy(copy, out.as_ptr(), host.as_ptr(), 16),
            Err(Error::DeviceMismatch { .. })
        ));
        assert_eq!(flow.num_nodes(), 1);
        assert_eq!(flow.num_edges(), 0);
    }

    #[test]
    fn test_update_zero_changes_destination() {
        let rt = runtime(1);
        let a = DeviceBuffer::<u16>::from_slice(&rt, Location::Device(DeviceId(0)), &[9; 4]).unwrap();
        let b = DeviceBuffer::<u16>::from_slice(&rt, Location::Device(DeviceId(0)), &[9; 4]).unwrap();
        let mut sg = Subgraph::new(DeviceId(0));
        let mut flow = DeviceFlow::new(&mut sg, &rt);

        let fill = flow.fill(a.as_ptr(), 3u16, 4).unwrap();
        let zero = flow.zero(a.as_ptr(), 2).unwrap();
        flow.precede(fill, [zero]).unwrap();
        flow.offload().unwrap();
        assert_eq!(a.to_vec().unwrap(), vec![0, 0, 3, 3]);

        flow.update_fill(fill, b.as_ptr(), 3u16, 4).unwrap();
        flow.update_zero(zero, b.as_ptr().add(1), 3).unwrap();
        flow.offload().unwrap();
        assert_eq!(b.to_vec().unwrap(), vec![3, 0, 0, 0]);
        assert_eq!(a.to_vec().unwrap(), vec![0, 0, 3, 3]);

        assert_eq!(flow.num_nodes(), 2);
        assert_eq!(flow.num_edges(), 1);
    }
}
