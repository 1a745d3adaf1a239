//! Host/device buffer pairs with lazy, state-driven synchronisation.

use std::fmt;

use tessera_core::{HostTensor, Result, Shape};
use tessera_kernels::ops::{copy_dtoh, copy_htod};
use tessera_kernels::{DeviceBuffer, DeviceTensorSpan, DeviceTensorView, ExecutionStream, HostPin};

use crate::block::{Block, BlockArena, BlockRef, Coherence};

/// One logical tensor that lives on both host and device.
///
/// The host tensor, device allocation, stream and [`Coherence`] state live in
/// a shared block; clones and [`derive`](CoherentBuffer::derive)d buffers
/// alias that block, so marking or syncing through any alias is seen by all.
/// Copies always move the whole block.
///
/// Acquiring a read-only view brings the device up to date. Acquiring a
/// writable span assumes the device will be written and marks it ahead.
#[derive(Clone)]
pub struct CoherentBuffer {
    block: BlockRef,
    span: DeviceTensorSpan,
}

impl CoherentBuffer {
    /// Mirror `host` on the device of `stream`.
    ///
    /// Allocates a matching device buffer and pins the host range. Nothing is
    /// copied yet: the buffer starts host-ahead.
    pub fn from_host(arena: &BlockArena, host: HostTensor, stream: &ExecutionStream) -> Result<Self> {
        host.shape().check_rank()?;
        let runtime = stream.runtime();
        let mut device = DeviceBuffer::alloc_f32(runtime, host.numel())?;
        let span = device.span(host.shape().clone())?;
        let (addr, nbytes) = host.host_range();
        let pin = HostPin::pin(runtime, addr, nbytes)?;
        tracing::debug!(shape = %host.shape(), ptr = %device.ptr(), "wrapped host tensor");
        let block = arena.insert(Block {
            pin,
            device,
            stream: stream.clone(),
            coherence: Coherence::HostAhead,
            host,
        });
        Ok(Self { block, span })
    }

    /// Alias of the same block seen through `shape`, starting at the first
    /// element. Fails if `shape` does not fit this buffer.
    pub fn derive(&self, shape: impl Into<Shape>) -> Result<Self> {
        let span = self.span.subspan_flat(0, shape)?;
        Ok(Self {
            block: self.block.clone(),
            span,
        })
    }

    pub fn shape(&self) -> &Shape {
        self.span.shape()
    }

    pub fn coherence(&self) -> Result<Coherence> {
        self.block.with(|b| b.coherence)
    }

    pub fn host_dirty(&self) -> Result<bool> {
        self.coherence().map(Coherence::host_dirty)
    }

    pub fn device_dirty(&self) -> Result<bool> {
        self.coherence().map(Coherence::device_dirty)
    }

    /// The host tensor of the block (shares its buffer).
    pub fn host(&self) -> Result<HostTensor> {
        self.block.with(|b| b.host.clone())
    }

    /// Stream the block's copies run on.
    pub fn stream(&self) -> Result<ExecutionStream> {
        self.block.with(|b| b.stream.clone())
    }

    /// Buffers aliasing this block, this one included.
    pub fn alias_count(&self) -> usize {
        self.block.ref_count()
    }

    pub fn same_block(&self, other: &CoherentBuffer) -> bool {
        self.block.same_block(&other.block)
    }

    /// The host was written; the next device read must copy.
    pub fn mark_host_dirty(&self) -> Result<()> {
        self.block.with(|b| b.coherence = Coherence::HostAhead)
    }

    /// The device was written; the next host read must copy.
    pub fn mark_device_dirty(&self) -> Result<()> {
        self.block.with(|b| b.coherence = Coherence::DeviceAhead)
    }

    /// Run future copies on `stream`. Work already queued is unaffected.
    pub fn bind_stream(&self, stream: &ExecutionStream) -> Result<()> {
        self.block.with(|b| b.stream = stream.clone())
    }

    /// Copy host to device if the host is ahead.
    ///
    /// The copy is queued on the block's stream and reads the host buffer
    /// asynchronously: do not write the host tensor until that stream has
    /// been synchronized.
    pub fn sync_to_device(&self) -> Result<()> {
        self.block.with(|b| -> Result<()> {
            if b.coherence != Coherence::HostAhead {
                return Ok(());
            }
            let numel = b.host.numel();
            let dst = b.device.span([numel])?;
            let src = b.host.read();
            // SAFETY: the block keeps the host buffer alive, and its length
            // never changes while the tensor exists.
            unsafe { copy_htod(&b.stream, &dst, &src)? };
            b.coherence = Coherence::Clean;
            tracing::trace!(numel, "synced to device");
            Ok(())
        })?
    }

    /// Copy device to host if the device is ahead, and wait for the copy.
    ///
    /// On error the state is left as it was.
    pub fn sync_to_host(&self) -> Result<()> {
        self.block.with(|b| -> Result<()> {
            if b.coherence != Coherence::DeviceAhead {
                return Ok(());
            }
            let numel = b.host.numel();
            let src = b.device.view([numel])?;
            let mut dst = b.host.write();
            // SAFETY: the write guard is held until the stream is synchronized.
            unsafe { copy_dtoh(&b.stream, &mut dst, &src)? };
            b.stream.synchronize()?;
            b.coherence = Coherence::Clean;
            tracing::trace!(numel, "synced to host");
            Ok(())
        })?
    }

    /// Read-only device view, bringing the device up to date first.
    pub fn device_view(&self) -> Result<DeviceTensorView> {
        self.sync_to_device()?;
        Ok(self.span.as_view().clone())
    }

    /// Writable device span. Marks the device ahead.
    pub fn device_span(&mut self) -> Result<DeviceTensorSpan> {
        self.mark_device_dirty()?;
        Ok(self.span.clone())
    }
}

impl fmt::Debug for CoherentBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoherentBuffer")
            .field("block", &self.block)
            .field("shape", self.shape())
            .field("offset", &self.span.offset())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_kernels::{SharedRuntime, SimRuntime};

    fn setup() -> (Arc<SimRuntime>, ExecutionStream, BlockArena) {
        let sim = Arc::new(SimRuntime::default());
        let rt: SharedRuntime = sim.clone();
        (sim, ExecutionStream::default_stream(&rt), BlockArena::new())
    }

    #[test]
    fn test_starts_host_ahead() {
        let (sim, stream, arena) = setup();
        let host = HostTensor::from_f32(&[1.0, 2.0], &[2]).unwrap();
        let buf = CoherentBuffer::from_host(&arena, host, &stream).unwrap();
        assert_eq!(buf.coherence().unwrap(), Coherence::HostAhead);
        assert!(buf.host_dirty().unwrap());
        assert_eq!(sim.pinned_ranges(), 1);
        assert_eq!(sim.live_allocations(), 1);
        assert_eq!(sim.stats().htod_copies, 0);
    }

    #[test]
    fn test_view_syncs_once() {
        let (sim, stream, arena) = setup();
        let host = HostTensor::from_f32(&[1.0, 2.0, 3.0], &[3]).unwrap();
        let buf = CoherentBuffer::from_host(&arena, host, &stream).unwrap();
        let view = buf.device_view().unwrap();
        buf.device_view().unwrap();
        buf.sync_to_device().unwrap();
        assert_eq!(sim.stats().htod_copies, 1);
        assert_eq!(buf.coherence().unwrap(), Coherence::Clean);
        stream.synchronize().unwrap();
        assert_eq!(sim.peek_f32(view.device_ptr(), 3).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_span_marks_device_ahead() {
        let (sim, stream, arena) = setup();
        let host = HostTensor::zeros(&[4]);
        let mut buf = CoherentBuffer::from_host(&arena, host, &stream).unwrap();
        buf.device_span().unwrap();
        assert_eq!(buf.coherence().unwrap(), Coherence::DeviceAhead);
        assert!(!buf.host_dirty().unwrap());
        // Reading through a view does not upload stale host data.
        buf.device_view().unwrap();
        assert_eq!(sim.stats().htod_copies, 0);
    }

    #[test]
    fn test_last_writer_wins() {
        let (_sim, stream, arena) = setup();
        let buf = CoherentBuffer::from_host(&arena, HostTensor::zeros(&[1]), &stream).unwrap();
        buf.mark_device_dirty().unwrap();
        buf.mark_host_dirty().unwrap();
        assert_eq!(buf.coherence().unwrap(), Coherence::HostAhead);
        buf.mark_device_dirty().unwrap();
        assert_eq!(buf.coherence().unwrap(), Coherence::DeviceAhead);
    }

    #[test]
    fn test_sync_to_host_noop_when_clean() {
        let (sim, stream, arena) = setup();
        let buf = CoherentBuffer::from_host(&arena, HostTensor::zeros(&[2]), &stream).unwrap();
        buf.sync_to_host().unwrap();
        buf.sync_to_device().unwrap();
        buf.sync_to_host().unwrap();
        assert_eq!(sim.stats().dtoh_copies, 0);
        assert_eq!(sim.stats().synchronizations, 0);
    }

    #[test]
    fn test_derive_shares_block() {
        let (_sim, stream, arena) = setup();
        let host = HostTensor::from_f32(&[0.0; 6], &[2, 3]).unwrap();
        let base = CoherentBuffer::from_host(&arena, host, &stream).unwrap();
        let flat = base.derive([6]).unwrap();
        let head = base.derive([2]).unwrap();
        assert!(flat.same_block(&base));
        assert_eq!(base.alias_count(), 3);
        assert_eq!(head.shape().dims(), &[2]);
        assert!(base.derive([7]).unwrap_err().is_invalid_argument());

        head.mark_device_dirty().unwrap();
        assert!(base.device_dirty().unwrap());
        drop(flat);
        assert_eq!(base.alias_count(), 2);
    }

    #[test]
    fn test_block_released_with_last_alias() {
        let (sim, stream, arena) = setup();
        let a = CoherentBuffer::from_host(&arena, HostTensor::zeros(&[8]), &stream).unwrap();
        let b = a.clone();
        drop(a);
        assert_eq!(arena.live_blocks(), 1);
        drop(b);
        assert_eq!(arena.live_blocks(), 0);
        assert_eq!(sim.live_allocations(), 0);
        assert_eq!(sim.pinned_ranges(), 0);

        // The freed slot is reused.
        let _c = CoherentBuffer::from_host(&arena, HostTensor::zeros(&[8]), &stream).unwrap();
        assert_eq!(arena.capacity(), 1);
    }

    #[test]
    fn test_rank_limit() {
        let (sim, stream, arena) = setup();
        let host = HostTensor::zeros(&[1, 1, 1, 1, 1, 1, 1]);
        let err = CoherentBuffer::from_host(&arena, host, &stream).unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn test_pin_failure_releases_allocation() {
        let (sim, stream, arena) = setup();
        sim.fail_host_pinning(true);
        let err = CoherentBuffer::from_host(&arena, HostTensor::zeros(&[4]), &stream).unwrap_err();
        assert!(err.is_resource_creation());
        assert_eq!(sim.live_allocations(), 0);
        assert_eq!(arena.live_blocks(), 0);
    }
}
