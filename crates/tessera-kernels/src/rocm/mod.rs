//! AMD ROCm backend.
//!
//! HIP, hiprtc, hipBLAS and MIOpen are loaded at run time through
//! `libloading`, so the crate builds without a ROCm install and
//! [`HipRuntime::open`] fails cleanly when the libraries are missing.
//! The custom kernels are compiled from [`KernelId::source`] with hiprtc.

pub mod context;
pub mod ffi;
pub mod launch;

use std::ffi::{c_int, c_uint, c_void};

use tessera_core::{check_status, Result, TesseraError};

use crate::runtime::{
    status, ComputeLibrary, DevicePtr, DeviceRuntime, KernelArgs, KernelId, LibraryCall, Occupancy,
    RawHandle, RawLaunch, RawStream,
};
use ffi::{HipStream, HIP_ERROR_NOT_READY, HIP_SUCCESS};

pub use context::{device_count, is_rocm_available, RocmError};

fn hip_stream(stream: RawStream) -> HipStream {
    stream.0 as usize as HipStream
}

fn dev(ptr: DevicePtr) -> *mut c_void {
    ptr.0 as usize as *mut c_void
}

fn blas_len(n: usize, context: &str) -> Result<c_int> {
    c_int::try_from(n).map_err(|_| TesseraError::invalid(format!("{context}: {n} elements exceed the BLAS index range")))
}

/// [`DeviceRuntime`] over one HIP device.
pub struct HipRuntime {
    device_index: usize,
}

impl HipRuntime {
    /// Load the ROCm libraries and initialise `device_index`.
    pub fn open(device_index: usize) -> Result<Self> {
        let count = device_count();
        if device_index >= count {
            return Err(TesseraError::resource(
                "HIP device",
                format!("device {device_index} requested, {count} visible"),
            ));
        }
        context::init_device(device_index)?;
        tracing::info!(device = device_index, "opened HIP device");
        Ok(Self { device_index })
    }

    fn current(&self) -> Result<&'static ffi::HipApi> {
        context::set_device(self.device_index)?;
        Ok(ffi::hip_api()?)
    }

    fn relu_forward(&self, handle: RawHandle, n: usize, x: DevicePtr, y: DevicePtr) -> Result<()> {
        let api = ffi::miopen_api()?;
        let len = blas_len(n, "relu_forward")?;
        let mut tensor: ffi::MiopenTensorDescriptor = std::ptr::null_mut();
        let mut act: ffi::MiopenActivationDescriptor = std::ptr::null_mut();
        let alpha: f32 = 1.0;
        let beta: f32 = 0.0;
        unsafe {
            check_status((api.miopen_create_tensor_descriptor)(&mut tensor), "miopenCreateTensorDescriptor")?;
            let result = check_status(
                (api.miopen_set_4d_tensor_descriptor)(tensor, ffi::MIOPEN_FLOAT, 1, len, 1, 1),
                "miopenSet4dTensorDescriptor",
            )
            .and_then(|_| {
                check_status(
                    (api.miopen_create_activation_descriptor)(&mut act),
                    "miopenCreateActivationDescriptor",
                )
            })
            .and_then(|_| {
                check_status(
                    (api.miopen_set_activation_descriptor)(act, ffi::MIOPEN_ACTIVATION_RELU, 0.0, 0.0, 0.0),
                    "miopenSetActivationDescriptor",
                )
            })
            .and_then(|_| {
                check_status(
                    (api.miopen_activation_forward)(
                        handle.0 as usize as ffi::MiopenHandle,
                        act,
                        &alpha as *const f32 as *const c_void,
                        tensor,
                        dev(x),
                        &beta as *const f32 as *const c_void,
                        tensor,
                        dev(y),
                    ),
                    "miopenActivationForward",
                )
            });
            if !act.is_null() {
                (api.miopen_destroy_activation_descriptor)(act);
            }
            (api.miopen_destroy_tensor_descriptor)(tensor);
            result
        }
    }
}

impl DeviceRuntime for HipRuntime {
    fn name(&self) -> &'static str {
        "hip"
    }

    fn device_index(&self) -> usize {
        self.device_index
    }

    fn create_stream(&self) -> Result<RawStream> {
        let api = self.current()?;
        let mut stream: HipStream = std::ptr::null_mut();
        check_status(unsafe { (api.hip_stream_create)(&mut stream) }, "hipStreamCreate")?;
        Ok(RawStream(stream as usize as u64))
    }

    fn destroy_stream(&self, stream: RawStream) -> Result<()> {
        let api = self.current()?;
        check_status(unsafe { (api.hip_stream_destroy)(hip_stream(stream)) }, "hipStreamDestroy")
    }

    fn synchronize(&self, stream: RawStream) -> Result<()> {
        let api = self.current()?;
        check_status(unsafe { (api.hip_stream_synchronize)(hip_stream(stream)) }, "hipStreamSynchronize")
    }

    fn stream_is_idle(&self, stream: RawStream) -> Result<bool> {
        let api = self.current()?;
        match unsafe { (api.hip_stream_query)(hip_stream(stream)) } {
            HIP_SUCCESS => Ok(true),
            HIP_ERROR_NOT_READY => Ok(false),
            code => Err(TesseraError::device(code, "hipStreamQuery")),
        }
    }

    fn create_handle(&self, library: ComputeLibrary, stream: RawStream) -> Result<RawHandle> {
        context::set_device(self.device_index)?;
        let mut handle: *mut c_void = std::ptr::null_mut();
        match library {
            ComputeLibrary::Blas => {
                let api = ffi::hipblas_api()?;
                check_status(unsafe { (api.hipblas_create)(&mut handle) }, "hipblasCreate")?;
                if let Err(e) = check_status(
                    unsafe { (api.hipblas_set_stream)(handle, hip_stream(stream)) },
                    "hipblasSetStream",
                ) {
                    unsafe { (api.hipblas_destroy)(handle) };
                    return Err(e);
                }
            }
            ComputeLibrary::Dnn => {
                let api = ffi::miopen_api()?;
                check_status(
                    unsafe { (api.miopen_create_with_stream)(&mut handle, hip_stream(stream)) },
                    "miopenCreateWithStream",
                )?;
            }
        }
        Ok(RawHandle(handle as usize as u64))
    }

    fn destroy_handle(&self, library: ComputeLibrary, handle: RawHandle) -> Result<()> {
        let raw = handle.0 as usize as *mut c_void;
        match library {
            ComputeLibrary::Blas => check_status(unsafe { (ffi::hipblas_api()?.hipblas_destroy)(raw) }, "hipblasDestroy"),
            ComputeLibrary::Dnn => check_status(unsafe { (ffi::miopen_api()?.miopen_destroy)(raw) }, "miopenDestroy"),
        }
    }

    fn dispatch(&self, library: ComputeLibrary, handle: RawHandle, call: &LibraryCall) -> Result<()> {
        if call.library() != library {
            return Err(TesseraError::device(
                status::INVALID_VALUE,
                format!("{} dispatched through a {library} handle", call.name()),
            ));
        }
        let raw = handle.0 as usize as *mut c_void;
        match *call {
            LibraryCall::Scal { n, alpha, x } => {
                let api = ffi::hipblas_api()?;
                let n = blas_len(n, "hipblasSscal")?;
                check_status(
                    unsafe { (api.hipblas_sscal)(raw, n, &alpha, dev(x) as *mut f32, 1) },
                    "hipblasSscal",
                )
            }
            LibraryCall::Axpy { n, alpha, x, y } => {
                let api = ffi::hipblas_api()?;
                let n = blas_len(n, "hipblasSaxpy")?;
                check_status(
                    unsafe { (api.hipblas_saxpy)(raw, n, &alpha, dev(x) as *const f32, 1, dev(y) as *mut f32, 1) },
                    "hipblasSaxpy",
                )
            }
            LibraryCall::ReluForward { n, x, y } => self.relu_forward(handle, n, x, y),
        }
    }

    fn alloc(&self, nbytes: usize) -> Result<DevicePtr> {
        let api = self.current()?;
        let mut ptr: ffi::HipDeviceptr = std::ptr::null_mut();
        check_status(
            unsafe { (api.hip_malloc)(&mut ptr, nbytes) },
            &format!("hipMalloc({nbytes} bytes)"),
        )?;
        Ok(DevicePtr(ptr as usize as u64))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let api = self.current()?;
        check_status(unsafe { (api.hip_free)(dev(ptr)) }, "hipFree")
    }

    fn pin_host(&self, addr: usize, nbytes: usize) -> Result<()> {
        let api = self.current()?;
        check_status(
            unsafe { (api.hip_host_register)(addr as *mut c_void, nbytes, ffi::HIP_HOST_REGISTER_DEFAULT) },
            "hipHostRegister",
        )
    }

    fn unpin_host(&self, addr: usize) -> Result<()> {
        let api = self.current()?;
        check_status(unsafe { (api.hip_host_unregister)(addr as *mut c_void) }, "hipHostUnregister")
    }

    unsafe fn memcpy_htod_async(&self, dst: DevicePtr, src: &[u8], stream: RawStream) -> Result<()> {
        let api = self.current()?;
        check_status(
            (api.hip_memcpy_async)(
                dev(dst),
                src.as_ptr() as *const c_void,
                src.len(),
                ffi::HIP_MEMCPY_HOST_TO_DEVICE,
                hip_stream(stream),
            ),
            "hipMemcpyAsync H2D",
        )
    }

    unsafe fn memcpy_dtoh_async(&self, dst: &mut [u8], src: DevicePtr, stream: RawStream) -> Result<()> {
        let api = self.current()?;
        check_status(
            (api.hip_memcpy_async)(
                dst.as_mut_ptr() as *mut c_void,
                dev(src),
                dst.len(),
                ffi::HIP_MEMCPY_DEVICE_TO_HOST,
                hip_stream(stream),
            ),
            "hipMemcpyAsync D2H",
        )
    }

    fn memcpy_dtod_async(&self, dst: DevicePtr, src: DevicePtr, nbytes: usize, stream: RawStream) -> Result<()> {
        let api = self.current()?;
        check_status(
            unsafe {
                (api.hip_memcpy_async)(
                    dev(dst),
                    dev(src),
                    nbytes,
                    ffi::HIP_MEMCPY_DEVICE_TO_DEVICE,
                    hip_stream(stream),
                )
            },
            "hipMemcpyAsync D2D",
        )
    }

    fn occupancy(&self, kernel: KernelId, shared_mem_bytes: usize) -> Result<Occupancy> {
        let api = self.current()?;
        let loaded = launch::ensure_kernel(self.device_index, kernel)?;
        let mut min_grid: c_int = 0;
        let mut block: c_int = 0;
        check_status(
            unsafe {
                (api.hip_module_occupancy_max_potential_block_size)(
                    &mut min_grid,
                    &mut block,
                    loaded.function,
                    shared_mem_bytes,
                    kernel.max_threads_per_block() as c_int,
                )
            },
            &format!("hipModuleOccupancyMaxPotentialBlockSize({})", kernel.name()),
        )?;
        Ok(Occupancy {
            min_grid_size: min_grid.max(1) as u32,
            block_size: block.max(1) as u32,
        })
    }

    fn launch(&self, args: &KernelArgs, raw: &RawLaunch) -> Result<()> {
        let api = self.current()?;
        let loaded = launch::ensure_kernel(self.device_index, args.kernel())?;
        match *args {
            KernelArgs::ScaleShift { n, alpha, beta, x, y } => {
                let mut n: c_uint = n;
                let mut alpha = alpha;
                let mut beta = beta;
                let mut x = dev(x);
                let mut y = dev(y);
                let mut params: [*mut c_void; 5] = [
                    &mut n as *mut c_uint as *mut c_void,
                    &mut alpha as *mut f32 as *mut c_void,
                    &mut beta as *mut f32 as *mut c_void,
                    &mut x as *mut *mut c_void as *mut c_void,
                    &mut y as *mut *mut c_void as *mut c_void,
                ];
                check_status(
                    unsafe {
                        (api.hip_module_launch_kernel)(
                            loaded.function,
                            raw.grid.x,
                            raw.grid.y,
                            raw.grid.z,
                            raw.block.x,
                            raw.block.y,
                            raw.block.z,
                            raw.shared_mem_bytes,
                            hip_stream(raw.stream),
                            params.as_mut_ptr(),
                            std::ptr::null_mut(),
                        )
                    },
                    "hipModuleLaunchKernel",
                )
            }
        }
    }
}
