//! # tessera-kernels
//!
//! Device-side plumbing for the tessera host/device bridge.
//!
//! Provides:
//! - The `DeviceRuntime` seam and an in-process simulated device (`SimRuntime`)
//! - Reference-counted execution streams and compute-library handles
//! - Device allocations, host pinning and non-owning device views
//! - Occupancy-driven kernel launch policy
//! - Copies and the built-in `scale_shift` kernel
//! - HIP/hipBLAS/MIOpen backend (behind `rocm` feature flag)

pub mod context;
pub mod handle;
pub mod launch;
pub mod memory;
pub mod ops;
pub mod runtime;
pub mod sim;
pub mod stream;
pub mod view;

#[cfg(feature = "rocm")]
pub mod rocm;

pub use context::open_runtime;
pub use handle::{ComputeHandles, SharedHandle};
pub use launch::{compute_launch_dims, launch_kernel, make_policy, LaunchPolicy, DEFAULT_MIN_BLOCK_SIZE};
pub use memory::{DeviceBuffer, HostPin};
pub use runtime::{
    status, ComputeLibrary, DevicePtr, DeviceRuntime, Dim3, KernelArgs, KernelId, LibraryCall, Occupancy,
    RawHandle, RawLaunch, RawStream, SharedRuntime,
};
pub use sim::{SimRuntime, SimStats};
pub use stream::ExecutionStream;
pub use view::{DeviceTensorSpan, DeviceTensorView};
