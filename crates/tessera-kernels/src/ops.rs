//! Device operations built on views: copies and the custom scale kernel.
//!
//! Every function queues work on the given stream and returns immediately.

use tessera_core::{Result, TesseraError};

use crate::launch::{launch_kernel, make_policy};
use crate::runtime::{KernelArgs, KernelId};
use crate::stream::ExecutionStream;
use crate::view::{DeviceTensorSpan, DeviceTensorView};

fn require_contiguous(view: &DeviceTensorView, context: &str) -> Result<()> {
    if view.is_contiguous() {
        Ok(())
    } else {
        Err(TesseraError::invalid(format!("{context}: view {} is not contiguous", view.shape())))
    }
}

fn require_numel(expected: usize, actual: usize, context: &str) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(TesseraError::invalid(format!(
            "{context}: {expected} elements on one side, {actual} on the other"
        )))
    }
}

// ============================================================================
// Copies
// ============================================================================

/// Queue a copy of `src` into `dst`.
///
/// # Safety
/// `src` is read asynchronously: keep it alive and unmodified until `stream`
/// has been synchronized.
pub unsafe fn copy_htod(stream: &ExecutionStream, dst: &DeviceTensorSpan, src: &[f32]) -> Result<()> {
    require_contiguous(dst, "copy_htod")?;
    require_numel(dst.numel(), src.len(), "copy_htod")?;
    if src.is_empty() {
        return Ok(());
    }
    tracing::trace!(dst = %dst.device_ptr(), n = src.len(), stream = stream.raw().0, "htod");
    stream
        .runtime()
        .memcpy_htod_async(dst.device_ptr(), bytemuck::cast_slice(src), stream.raw())
}

/// Queue a copy of `src` into `dst`.
///
/// # Safety
/// `dst` is written asynchronously: keep it alive and do not read it until
/// `stream` has been synchronized.
pub unsafe fn copy_dtoh(stream: &ExecutionStream, dst: &mut [f32], src: &DeviceTensorView) -> Result<()> {
    require_contiguous(src, "copy_dtoh")?;
    require_numel(src.numel(), dst.len(), "copy_dtoh")?;
    if dst.is_empty() {
        return Ok(());
    }
    tracing::trace!(src = %src.device_ptr(), n = dst.len(), stream = stream.raw().0, "dtoh");
    stream
        .runtime()
        .memcpy_dtoh_async(bytemuck::cast_slice_mut(dst), src.device_ptr(), stream.raw())
}

/// Queue a device-to-device copy of `src` into `dst`.
pub fn copy_dtod(stream: &ExecutionStream, dst: &DeviceTensorSpan, src: &DeviceTensorView) -> Result<()> {
    require_contiguous(dst, "copy_dtod")?;
    require_contiguous(src, "copy_dtod")?;
    require_numel(dst.numel(), src.numel(), "copy_dtod")?;
    if src.numel() == 0 {
        return Ok(());
    }
    tracing::trace!(dst = %dst.device_ptr(), src = %src.device_ptr(), n = src.numel(), "dtod");
    stream
        .runtime()
        .memcpy_dtod_async(dst.device_ptr(), src.device_ptr(), src.size_in_bytes(), stream.raw())
}

// ============================================================================
// Scale / shift
// ============================================================================

/// `dst = alpha * src + beta`, elementwise, via the `scale_shift_f32` kernel.
pub fn scale_shift(
    stream: &ExecutionStream,
    dst: &DeviceTensorSpan,
    src: &DeviceTensorView,
    alpha: f32,
    beta: f32,
    min_block: u32,
) -> Result<()> {
    require_contiguous(dst, "scale_shift")?;
    require_contiguous(src, "scale_shift")?;
    require_numel(dst.numel(), src.numel(), "scale_shift")?;
    let n = src.numel();
    if n == 0 {
        return Ok(());
    }
    let n32 = u32::try_from(n).map_err(|_| TesseraError::invalid(format!("scale_shift: {n} elements")))?;
    let policy = make_policy(stream, KernelId::ScaleShift, n, 0, min_block)?;
    let args = KernelArgs::ScaleShift {
        n: n32,
        alpha,
        beta,
        x: src.device_ptr(),
        y: dst.device_ptr(),
    };
    launch_kernel(stream.runtime(), &policy, &args)
}
