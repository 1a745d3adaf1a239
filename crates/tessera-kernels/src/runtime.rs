//! The device runtime seam.
//!
//! Everything this workspace asks of an accelerator goes through
//! [`DeviceRuntime`]: context creation, stream association, library dispatch,
//! memory, copies and kernel launches. Implementations translate their numeric
//! status codes into [`TesseraError::Device`](tessera_core::TesseraError).

use std::fmt;
use std::sync::Arc;

use tessera_core::Result;

/// Status codes used by the runtimes. Values follow the HIP/CUDA runtime
/// numbering so logs read the same whichever backend produced them.
pub mod status {
    pub const INVALID_VALUE: i32 = 1;
    pub const OUT_OF_MEMORY: i32 = 2;
    pub const INVALID_CONFIGURATION: i32 = 9;
    pub const INVALID_HANDLE: i32 = 400;
    pub const NOT_READY: i32 = 600;
    pub const ILLEGAL_ADDRESS: i32 = 700;
    pub const LAUNCH_FAILURE: i32 = 719;
    pub const NOT_SUPPORTED: i32 = 801;
    /// Library-level execution failure (`*_STATUS_EXECUTION_FAILED`).
    pub const EXECUTION_FAILED: i32 = 13;
}

/// Address inside a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    /// Pointer `bytes` past this one.
    pub fn offset(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Runtime-level stream identifier. `0` is the device's default stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawStream(pub u64);

impl RawStream {
    pub const DEFAULT: RawStream = RawStream(0);

    pub fn is_default(self) -> bool {
        self.0 == 0
    }
}

/// Runtime-level compute-library handle identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub u64);

/// Accelerator numeric libraries a handle can be created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeLibrary {
    /// Dense linear algebra (cuBLAS / hipBLAS).
    Blas,
    /// Deep-learning primitives (cuDNN / MIOpen).
    Dnn,
}

impl fmt::Display for ComputeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeLibrary::Blas => write!(f, "blas"),
            ComputeLibrary::Dnn => write!(f, "dnn"),
        }
    }
}

/// An operator call into a compute library. Pointers address `f32` data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LibraryCall {
    /// `x = alpha * x`
    Scal { n: usize, alpha: f32, x: DevicePtr },
    /// `y = alpha * x + y`
    Axpy { n: usize, alpha: f32, x: DevicePtr, y: DevicePtr },
    /// `y = max(x, 0)`
    ReluForward { n: usize, x: DevicePtr, y: DevicePtr },
}

impl LibraryCall {
    /// Library the call must be dispatched through.
    pub fn library(&self) -> ComputeLibrary {
        match self {
            LibraryCall::Scal { .. } | LibraryCall::Axpy { .. } => ComputeLibrary::Blas,
            LibraryCall::ReluForward { .. } => ComputeLibrary::Dnn,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LibraryCall::Scal { .. } => "scal",
            LibraryCall::Axpy { .. } => "axpy",
            LibraryCall::ReluForward { .. } => "relu_forward",
        }
    }
}

/// Custom device kernels shipped with tessera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelId {
    /// `y[i] = alpha * x[i] + beta`, grid-stride loop over `n` elements.
    ScaleShift,
}

impl KernelId {
    pub fn name(self) -> &'static str {
        match self {
            KernelId::ScaleShift => "scale_shift_f32",
        }
    }

    /// Highest block size the kernel is written for.
    pub fn max_threads_per_block(self) -> u32 {
        match self {
            KernelId::ScaleShift => 1024,
        }
    }

    /// Device source, compiled at run time by backends that need it.
    pub fn source(self) -> &'static str {
        match self {
            KernelId::ScaleShift => {
                r#"
extern "C" __global__ void scale_shift_f32(
    unsigned int n, float alpha, float beta, const float* x, float* y)
{
    unsigned int stride = blockDim.x * gridDim.x;
    for (unsigned int i = blockIdx.x * blockDim.x + threadIdx.x; i < n; i += stride)
        y[i] = alpha * x[i] + beta;
}
"#
            }
        }
    }
}

/// Arguments of one kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArgs {
    ScaleShift {
        n: u32,
        alpha: f32,
        beta: f32,
        x: DevicePtr,
        y: DevicePtr,
    },
}

impl KernelArgs {
    pub fn kernel(&self) -> KernelId {
        match self {
            KernelArgs::ScaleShift { .. } => KernelId::ScaleShift,
        }
    }
}

/// Three-component launch dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    /// Total count `x * y * z`.
    pub fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Dim3::linear(x)
    }
}

/// Result of a runtime occupancy query: the block size that maximises
/// occupancy and the smallest grid that saturates the device with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub min_grid_size: u32,
    pub block_size: u32,
}

/// Launch geometry as the runtime sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawLaunch {
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: u32,
    pub stream: RawStream,
}

/// Operations a device runtime provides.
///
/// Every enqueueing call is fire-and-forget: it returns once the work is queued
/// on `stream`. A fault in queued work is reported by a later call on the same
/// stream, at the latest by [`synchronize`](DeviceRuntime::synchronize), and
/// poisons the stream from then on.
pub trait DeviceRuntime: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn device_index(&self) -> usize;

    fn create_stream(&self) -> Result<RawStream>;
    fn destroy_stream(&self, stream: RawStream) -> Result<()>;

    /// Block until all work queued on `stream` has finished.
    fn synchronize(&self, stream: RawStream) -> Result<()>;

    /// `true` when nothing is pending on `stream`.
    fn stream_is_idle(&self, stream: RawStream) -> Result<bool>;

    /// Create a library context whose calls are queued on `stream`.
    fn create_handle(&self, library: ComputeLibrary, stream: RawStream) -> Result<RawHandle>;
    fn destroy_handle(&self, library: ComputeLibrary, handle: RawHandle) -> Result<()>;

    /// Queue `call` through `handle`. A rejected call reports the library's
    /// own status code.
    fn dispatch(&self, library: ComputeLibrary, handle: RawHandle, call: &LibraryCall) -> Result<()>;

    fn alloc(&self, nbytes: usize) -> Result<DevicePtr>;
    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Page-lock a host range so async copies can use it directly.
    fn pin_host(&self, addr: usize, nbytes: usize) -> Result<()>;
    fn unpin_host(&self, addr: usize) -> Result<()>;

    /// Queue a host-to-device copy.
    ///
    /// # Safety
    /// The runtime may read `src` after this returns. The caller keeps that
    /// memory alive and unmodified until `stream` has been synchronized.
    unsafe fn memcpy_htod_async(&self, dst: DevicePtr, src: &[u8], stream: RawStream) -> Result<()>;

    /// Queue a device-to-host copy.
    ///
    /// # Safety
    /// The runtime may write `dst` after this returns. The caller keeps that
    /// memory alive and does not read it until `stream` has been synchronized.
    unsafe fn memcpy_dtoh_async(&self, dst: &mut [u8], src: DevicePtr, stream: RawStream) -> Result<()>;

    fn memcpy_dtod_async(&self, dst: DevicePtr, src: DevicePtr, nbytes: usize, stream: RawStream) -> Result<()>;

    /// Occupancy model for `kernel` with `shared_mem_bytes` of dynamic shared memory.
    fn occupancy(&self, kernel: KernelId, shared_mem_bytes: usize) -> Result<Occupancy>;

    fn launch(&self, args: &KernelArgs, launch: &RawLaunch) -> Result<()>;
}

/// Runtimes are shared by every stream, handle and buffer created from them.
pub type SharedRuntime = Arc<dyn DeviceRuntime>;
