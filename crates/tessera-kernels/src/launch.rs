//! Kernel launch geometry.
//!
//! [`make_policy`] asks the runtime's occupancy model for a block size and
//! derives a 1-D grid that covers `max_work_units`. Kernels are expected to
//! use a grid-stride loop, so the only hard requirement on the result is
//! `grid * block >= max_work_units`.

use tessera_core::{Result, TesseraError};

use crate::runtime::{Dim3, KernelArgs, KernelId, Occupancy, RawLaunch, SharedRuntime};
use crate::stream::ExecutionStream;

/// Smallest block the calculator shrinks to when the work is tiny.
pub const DEFAULT_MIN_BLOCK_SIZE: u32 = 64;

/// Grid and block sizes covering `max_work_units` with the occupancy
/// model's preferred block.
///
/// A block larger than the work is clamped to `max(min_block, max_work_units)`
/// (never above the model's block). The grid is the ceiling of the work over
/// the block, so `grid * block >= max_work_units` always holds.
pub fn compute_launch_dims(occupancy: Occupancy, max_work_units: usize, min_block: u32) -> Result<(u32, u32)> {
    if max_work_units == 0 {
        return Err(TesseraError::invalid("launch policy for zero work units"));
    }
    if occupancy.block_size == 0 {
        return Err(TesseraError::invalid("occupancy model returned a zero block size"));
    }
    let work = max_work_units as u64;
    let mut block = occupancy.block_size as u64;
    if block > work {
        block = (min_block as u64).max(work).min(block);
    }
    let grid = work.div_ceil(block);
    let grid = u32::try_from(grid)
        .map_err(|_| TesseraError::invalid(format!("{max_work_units} work units need a grid of {grid} blocks")))?;
    Ok((grid, block as u32))
}

/// Launch configuration of one kernel invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPolicy {
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: u32,
    /// `None` launches on the runtime's default stream.
    pub stream: Option<ExecutionStream>,
}

impl LaunchPolicy {
    /// Explicit geometry, no dynamic shared memory, default stream.
    pub fn new(grid: impl Into<Dim3>, block: impl Into<Dim3>) -> Self {
        Self {
            grid: grid.into(),
            block: block.into(),
            shared_mem_bytes: 0,
            stream: None,
        }
    }

    pub fn with_shared_mem(mut self, bytes: u32) -> Self {
        self.shared_mem_bytes = bytes;
        self
    }

    pub fn on_stream(mut self, stream: &ExecutionStream) -> Self {
        self.stream = Some(stream.clone());
        self
    }

    /// Total threads launched.
    pub fn threads(&self) -> u64 {
        self.grid.volume() * self.block.volume()
    }

    pub fn to_raw(&self) -> RawLaunch {
        RawLaunch {
            grid: self.grid,
            block: self.block,
            shared_mem_bytes: self.shared_mem_bytes,
            stream: self.stream.as_ref().map(ExecutionStream::raw).unwrap_or_default(),
        }
    }
}

/// Policy for `kernel` over `max_work_units` on `stream`, sized by the
/// runtime's occupancy model.
pub fn make_policy(
    stream: &ExecutionStream,
    kernel: KernelId,
    max_work_units: usize,
    shared_mem_bytes: u32,
    min_block: u32,
) -> Result<LaunchPolicy> {
    let occupancy = stream.runtime().occupancy(kernel, shared_mem_bytes as usize)?;
    let (grid, block) = compute_launch_dims(occupancy, max_work_units, min_block)?;
    tracing::trace!(
        kernel = kernel.name(),
        work = max_work_units,
        grid,
        block,
        "launch policy"
    );
    Ok(LaunchPolicy::new(grid, block)
        .with_shared_mem(shared_mem_bytes)
        .on_stream(stream))
}

/// Enqueue `args` with `policy` on `runtime`.
pub fn launch_kernel(runtime: &SharedRuntime, policy: &LaunchPolicy, args: &KernelArgs) -> Result<()> {
    if let Some(stream) = &policy.stream {
        if !stream.same_runtime(runtime) {
            return Err(TesseraError::invalid(format!(
                "{}: launch stream belongs to another runtime",
                args.kernel().name()
            )));
        }
    }
    let raw = policy.to_raw();
    tracing::trace!(
        kernel = args.kernel().name(),
        grid = raw.grid.x,
        block = raw.block.x,
        stream = raw.stream.0,
        "launch"
    );
    runtime.launch(args, &raw)
}
