//! In-process emulated device.
//!
//! Device memory lives in host `Vec`s keyed by synthetic addresses, streams
//! are counters of pending work, and library calls and kernels are evaluated
//! on the host. Queued work executes at enqueue time but only counts as
//! complete after `synchronize`, so ordering, idempotence and fault reporting
//! behave like a real asynchronous device. Fault injection hooks make every
//! failure path reachable from tests.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tessera_core::{Result, SimDeviceConfig, TesseraError};

use crate::runtime::{
    status, ComputeLibrary, DevicePtr, DeviceRuntime, KernelArgs, KernelId, LibraryCall, Occupancy,
    RawHandle, RawLaunch, RawStream,
};

/// First synthetic device address handed out.
const SIM_BASE_ADDR: u64 = 0x1000_0000;
/// Allocation granularity, matching the usual runtime alignment.
const SIM_ALLOC_ALIGN: u64 = 256;
/// Static shared memory available to one block.
const SIM_SHARED_MEM_PER_BLOCK: usize = 48 << 10;

/// Counters of work the emulated device has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub htod_copies: usize,
    pub dtoh_copies: usize,
    pub dtod_copies: usize,
    pub library_calls: usize,
    pub launches: usize,
    pub synchronizations: usize,
    pub streams_created: usize,
    pub streams_destroyed: usize,
    pub handles_created: usize,
    pub handles_destroyed: usize,
}

#[derive(Debug, Default)]
struct SimStream {
    pending: usize,
    fault: Option<i32>,
}

#[derive(Debug)]
struct SimHandle {
    library: ComputeLibrary,
    stream: RawStream,
}

#[derive(Debug, Default)]
struct FaultPlan {
    fail_alloc: bool,
    fail_stream_creation: bool,
    fail_handle_creation: bool,
    fail_pin: bool,
    library_status: Option<i32>,
    async_fault: Option<i32>,
}

#[derive(Debug)]
struct SimState {
    allocations: BTreeMap<u64, Vec<u8>>,
    allocated_bytes: usize,
    next_addr: u64,
    streams: HashMap<u64, SimStream>,
    next_stream: u64,
    handles: HashMap<u64, SimHandle>,
    next_handle: u64,
    pinned: HashMap<usize, usize>,
    stats: SimStats,
    faults: FaultPlan,
}

impl SimState {
    fn new() -> Self {
        let mut streams = HashMap::new();
        streams.insert(RawStream::DEFAULT.0, SimStream::default());
        Self {
            allocations: BTreeMap::new(),
            allocated_bytes: 0,
            next_addr: SIM_BASE_ADDR,
            streams,
            next_stream: 1,
            handles: HashMap::new(),
            next_handle: 1,
            pinned: HashMap::new(),
            stats: SimStats::default(),
            faults: FaultPlan::default(),
        }
    }

    /// Queue one operation on `stream`. Returns `false` when the operation
    /// faulted on the device and must not take effect.
    fn enqueue(&mut self, stream: RawStream, context: &str) -> Result<bool> {
        let s = self.streams.get_mut(&stream.0).ok_or_else(|| {
            TesseraError::device(status::INVALID_HANDLE, format!("{context}: unknown stream {}", stream.0))
        })?;
        if let Some(code) = s.fault {
            return Err(TesseraError::device(
                code,
                format!("{context}: stream {} faulted earlier", stream.0),
            ));
        }
        s.pending += 1;
        if let Some(code) = self.faults.async_fault.take() {
            s.fault = Some(code);
            return Ok(false);
        }
        Ok(true)
    }

    /// Locate `len` bytes at `ptr` inside one allocation.
    fn resolve(&self, ptr: DevicePtr, len: usize, context: &str) -> Result<(u64, usize)> {
        let invalid = || {
            TesseraError::device(
                status::ILLEGAL_ADDRESS,
                format!("{context}: {len} bytes at {ptr} are outside any allocation"),
            )
        };
        let (&base, buf) = self.allocations.range(..=ptr.0).next_back().ok_or_else(invalid)?;
        let offset = (ptr.0 - base) as usize;
        match offset.checked_add(len) {
            Some(end) if end <= buf.len() => Ok((base, offset)),
            _ => Err(invalid()),
        }
    }

    fn bytes(&self, ptr: DevicePtr, len: usize, context: &str) -> Result<&[u8]> {
        let (base, offset) = self.resolve(ptr, len, context)?;
        Ok(&self.allocations[&base][offset..offset + len])
    }

    fn bytes_mut(&mut self, ptr: DevicePtr, len: usize, context: &str) -> Result<&mut [u8]> {
        let (base, offset) = self.resolve(ptr, len, context)?;
        let buf = self.allocations.get_mut(&base).ok_or_else(|| {
            TesseraError::device(status::ILLEGAL_ADDRESS, format!("{context}: allocation vanished"))
        })?;
        Ok(&mut buf[offset..offset + len])
    }

    fn read_f32(&self, ptr: DevicePtr, n: usize, context: &str) -> Result<Vec<f32>> {
        let bytes = self.bytes(ptr, n * 4, context)?;
        Ok(bytes.chunks_exact(4).map(bytemuck::pod_read_unaligned::<f32>).collect())
    }

    fn write_f32(&mut self, ptr: DevicePtr, values: &[f32], context: &str) -> Result<()> {
        let dst = self.bytes_mut(ptr, values.len() * 4, context)?;
        dst.copy_from_slice(bytemuck::cast_slice(values));
        Ok(())
    }

    fn execute_library(&mut self, call: &LibraryCall) -> Result<()> {
        let context = call.name();
        match *call {
            LibraryCall::Scal { n, alpha, x } => {
                let v: Vec<f32> = self.read_f32(x, n, context)?.into_iter().map(|e| alpha * e).collect();
                self.write_f32(x, &v, context)
            }
            LibraryCall::Axpy { n, alpha, x, y } => {
                let xs = self.read_f32(x, n, context)?;
                let ys = self.read_f32(y, n, context)?;
                let v: Vec<f32> = xs.iter().zip(&ys).map(|(a, b)| alpha * a + b).collect();
                self.write_f32(y, &v, context)
            }
            LibraryCall::ReluForward { n, x, y } => {
                let v: Vec<f32> = self.read_f32(x, n, context)?.into_iter().map(|e| e.max(0.0)).collect();
                self.write_f32(y, &v, context)
            }
        }
    }

    fn execute_kernel(&mut self, args: &KernelArgs, launch: &RawLaunch) -> Result<()> {
        let context = args.kernel().name();
        match *args {
            KernelArgs::ScaleShift { n, alpha, beta, x, y } => {
                let n = n as usize;
                let xs = self.read_f32(x, n, context)?;
                let mut ys = self.read_f32(y, n, context)?;
                // Emulate the grid-stride loop one thread at a time.
                let threads = (launch.grid.volume() * launch.block.volume()) as usize;
                for tid in 0..threads.min(n) {
                    let mut i = tid;
                    while i < n {
                        ys[i] = alpha * xs[i] + beta;
                        i += threads;
                    }
                }
                self.write_f32(y, &ys, context)
            }
        }
    }
}

/// Emulated accelerator. See the module docs.
pub struct SimRuntime {
    config: SimDeviceConfig,
    device_index: usize,
    state: Mutex<SimState>,
}

impl SimRuntime {
    pub fn new(config: SimDeviceConfig) -> Self {
        Self::with_device_index(config, 0)
    }

    pub fn with_device_index(config: SimDeviceConfig, device_index: usize) -> Self {
        Self {
            config,
            device_index,
            state: Mutex::new(SimState::new()),
        }
    }

    pub fn config(&self) -> &SimDeviceConfig {
        &self.config
    }

    pub fn stats(&self) -> SimStats {
        self.state.lock().stats
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().allocated_bytes
    }

    /// Streams other than the default one.
    pub fn live_streams(&self) -> usize {
        self.state.lock().streams.len() - 1
    }

    pub fn live_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub fn pinned_ranges(&self) -> usize {
        self.state.lock().pinned.len()
    }

    /// Read `n` floats straight out of device memory, bypassing streams.
    pub fn peek_f32(&self, ptr: DevicePtr, n: usize) -> Result<Vec<f32>> {
        self.state.lock().read_f32(ptr, n, "peek")
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.state.lock().faults.fail_alloc = fail;
    }

    pub fn fail_stream_creation(&self, fail: bool) {
        self.state.lock().faults.fail_stream_creation = fail;
    }

    pub fn fail_handle_creation(&self, fail: bool) {
        self.state.lock().faults.fail_handle_creation = fail;
    }

    pub fn fail_host_pinning(&self, fail: bool) {
        self.state.lock().faults.fail_pin = fail;
    }

    /// Make the next library call return `code` synchronously.
    pub fn fail_next_library_call(&self, code: i32) {
        self.state.lock().faults.library_status = Some(code);
    }

    /// Make the next queued operation fault on the device with `code`.
    /// The enqueue itself succeeds; the fault shows up later.
    pub fn fault_next_operation(&self, code: i32) {
        self.state.lock().faults.async_fault = Some(code);
    }
}

impl Default for SimRuntime {
    fn default() -> Self {
        Self::new(SimDeviceConfig::default())
    }
}

impl DeviceRuntime for SimRuntime {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn device_index(&self) -> usize {
        self.device_index
    }

    fn create_stream(&self) -> Result<RawStream> {
        let mut state = self.state.lock();
        if state.faults.fail_stream_creation {
            return Err(TesseraError::device(status::OUT_OF_MEMORY, "stream create"));
        }
        let id = state.next_stream;
        state.next_stream += 1;
        state.streams.insert(id, SimStream::default());
        state.stats.streams_created += 1;
        Ok(RawStream(id))
    }

    fn destroy_stream(&self, stream: RawStream) -> Result<()> {
        if stream.is_default() {
            return Err(TesseraError::device(status::INVALID_HANDLE, "stream destroy: default stream"));
        }
        let mut state = self.state.lock();
        state.streams.remove(&stream.0).ok_or_else(|| {
            TesseraError::device(status::INVALID_HANDLE, format!("stream destroy: unknown stream {}", stream.0))
        })?;
        state.stats.streams_destroyed += 1;
        Ok(())
    }

    fn synchronize(&self, stream: RawStream) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.synchronizations += 1;
        let s = state.streams.get_mut(&stream.0).ok_or_else(|| {
            TesseraError::device(status::INVALID_HANDLE, format!("synchronize: unknown stream {}", stream.0))
        })?;
        s.pending = 0;
        match s.fault {
            Some(code) => Err(TesseraError::device(code, format!("synchronize stream {}", stream.0))),
            None => Ok(()),
        }
    }

    fn stream_is_idle(&self, stream: RawStream) -> Result<bool> {
        let state = self.state.lock();
        let s = state.streams.get(&stream.0).ok_or_else(|| {
            TesseraError::device(status::INVALID_HANDLE, format!("query: unknown stream {}", stream.0))
        })?;
        if let Some(code) = s.fault {
            return Err(TesseraError::device(code, format!("query stream {}", stream.0)));
        }
        Ok(s.pending == 0)
    }

    fn create_handle(&self, library: ComputeLibrary, stream: RawStream) -> Result<RawHandle> {
        let mut state = self.state.lock();
        if state.faults.fail_handle_creation {
            return Err(TesseraError::device(status::OUT_OF_MEMORY, format!("{library} handle create")));
        }
        if !state.streams.contains_key(&stream.0) {
            return Err(TesseraError::device(
                status::INVALID_HANDLE,
                format!("{library} handle create: unknown stream {}", stream.0),
            ));
        }
        let id = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(id, SimHandle { library, stream });
        state.stats.handles_created += 1;
        Ok(RawHandle(id))
    }

    fn destroy_handle(&self, library: ComputeLibrary, handle: RawHandle) -> Result<()> {
        let mut state = self.state.lock();
        match state.handles.get(&handle.0) {
            Some(h) if h.library == library => {}
            _ => {
                return Err(TesseraError::device(
                    status::INVALID_HANDLE,
                    format!("{library} handle destroy: unknown handle {}", handle.0),
                ))
            }
        }
        state.handles.remove(&handle.0);
        state.stats.handles_destroyed += 1;
        Ok(())
    }

    fn dispatch(&self, library: ComputeLibrary, handle: RawHandle, call: &LibraryCall) -> Result<()> {
        let mut state = self.state.lock();
        let stream = match state.handles.get(&handle.0) {
            Some(h) if h.library == library && call.library() == library => h.stream,
            Some(_) => {
                return Err(TesseraError::device(
                    status::INVALID_VALUE,
                    format!("{}: not a {library} operation", call.name()),
                ))
            }
            None => {
                return Err(TesseraError::device(
                    status::INVALID_HANDLE,
                    format!("{}: unknown {library} handle {}", call.name(), handle.0),
                ))
            }
        };
        if let Some(code) = state.faults.library_status.take() {
            return Err(TesseraError::device(code, call.name()));
        }
        state.stats.library_calls += 1;
        if state.enqueue(stream, call.name())? {
            state.execute_library(call)?;
        }
        Ok(())
    }

    fn alloc(&self, nbytes: usize) -> Result<DevicePtr> {
        let mut state = self.state.lock();
        if state.faults.fail_alloc || state.allocated_bytes + nbytes > self.config.memory_bytes {
            return Err(TesseraError::device(status::OUT_OF_MEMORY, format!("alloc({nbytes} bytes)")));
        }
        let addr = state.next_addr;
        let span = (nbytes as u64).max(1).div_ceil(SIM_ALLOC_ALIGN) * SIM_ALLOC_ALIGN;
        state.next_addr += span;
        state.allocations.insert(addr, vec![0u8; nbytes]);
        state.allocated_bytes += nbytes;
        Ok(DevicePtr(addr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state.lock();
        let buf = state.allocations.remove(&ptr.0).ok_or_else(|| {
            TesseraError::device(status::INVALID_VALUE, format!("free: {ptr} is not an allocation base"))
        })?;
        state.allocated_bytes -= buf.len();
        Ok(())
    }

    fn pin_host(&self, addr: usize, nbytes: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.faults.fail_pin {
            return Err(TesseraError::device(status::OUT_OF_MEMORY, format!("host register({nbytes} bytes)")));
        }
        if state.pinned.contains_key(&addr) {
            return Err(TesseraError::device(status::INVALID_VALUE, "host register: range already pinned"));
        }
        state.pinned.insert(addr, nbytes);
        Ok(())
    }

    fn unpin_host(&self, addr: usize) -> Result<()> {
        let mut state = self.state.lock();
        state
            .pinned
            .remove(&addr)
            .map(|_| ())
            .ok_or_else(|| TesseraError::device(status::INVALID_VALUE, "host unregister: range not pinned"))
    }

    unsafe fn memcpy_htod_async(&self, dst: DevicePtr, src: &[u8], stream: RawStream) -> Result<()> {
        let mut state = self.state.lock();
        state.resolve(dst, src.len(), "memcpy htod")?;
        state.stats.htod_copies += 1;
        if state.enqueue(stream, "memcpy htod")? {
            state.bytes_mut(dst, src.len(), "memcpy htod")?.copy_from_slice(src);
        }
        Ok(())
    }

    unsafe fn memcpy_dtoh_async(&self, dst: &mut [u8], src: DevicePtr, stream: RawStream) -> Result<()> {
        let mut state = self.state.lock();
        state.resolve(src, dst.len(), "memcpy dtoh")?;
        state.stats.dtoh_copies += 1;
        if state.enqueue(stream, "memcpy dtoh")? {
            dst.copy_from_slice(state.bytes(src, dst.len(), "memcpy dtoh")?);
        }
        Ok(())
    }

    fn memcpy_dtod_async(&self, dst: DevicePtr, src: DevicePtr, nbytes: usize, stream: RawStream) -> Result<()> {
        let mut state = self.state.lock();
        state.resolve(src, nbytes, "memcpy dtod")?;
        state.resolve(dst, nbytes, "memcpy dtod")?;
        state.stats.dtod_copies += 1;
        if state.enqueue(stream, "memcpy dtod")? {
            let staged = state.bytes(src, nbytes, "memcpy dtod")?.to_vec();
            state.bytes_mut(dst, nbytes, "memcpy dtod")?.copy_from_slice(&staged);
        }
        Ok(())
    }

    fn occupancy(&self, kernel: KernelId, shared_mem_bytes: usize) -> Result<Occupancy> {
        if shared_mem_bytes > SIM_SHARED_MEM_PER_BLOCK {
            return Err(TesseraError::device(
                status::INVALID_VALUE,
                format!("occupancy {}: {shared_mem_bytes} bytes of shared memory", kernel.name()),
            ));
        }
        let cfg = &self.config;
        let limit = kernel.max_threads_per_block().min(cfg.max_threads_per_block);
        let block_size = (limit / cfg.warp_size * cfg.warp_size).max(cfg.warp_size);
        let blocks_per_sm = (cfg.max_threads_per_multiprocessor / block_size).max(1);
        Ok(Occupancy {
            min_grid_size: cfg.multiprocessors * blocks_per_sm,
            block_size,
        })
    }

    fn launch(&self, args: &KernelArgs, launch: &RawLaunch) -> Result<()> {
        let block_threads = launch.block.volume();
        if launch.grid.volume() == 0
            || block_threads == 0
            || block_threads > self.config.max_threads_per_block as u64
            || launch.shared_mem_bytes as usize > SIM_SHARED_MEM_PER_BLOCK
        {
            return Err(TesseraError::device(
                status::INVALID_CONFIGURATION,
                format!("launch {}: {:?}", args.kernel().name(), launch),
            ));
        }
        let mut state = self.state.lock();
        state.stats.launches += 1;
        if state.enqueue(launch.stream, args.kernel().name())? {
            state.execute_kernel(args, launch)?;
        }
        Ok(())
    }
}
