//! Runtime-loaded HIP, hiprtc, hipBLAS and MIOpen entry points via dlopen.
//!
//! Nothing here links against ROCm at build time; any install providing the
//! shared objects below works.

use std::ffi::{c_char, c_float, c_int, c_uint, c_void};
use std::sync::OnceLock;

use libloading::Library;

use super::context::RocmError;

// ---------------------------------------------------------------------------
// Status codes and enums
// ---------------------------------------------------------------------------

pub type HipErrorT = c_int;
pub const HIP_SUCCESS: HipErrorT = 0;
pub const HIP_ERROR_NOT_READY: HipErrorT = 600;

pub const HIP_MEMCPY_HOST_TO_DEVICE: c_int = 1;
pub const HIP_MEMCPY_DEVICE_TO_HOST: c_int = 2;
pub const HIP_MEMCPY_DEVICE_TO_DEVICE: c_int = 3;

pub const HIP_HOST_REGISTER_DEFAULT: c_uint = 0;

pub type HiprtcResult = c_int;
pub const HIPRTC_SUCCESS: HiprtcResult = 0;

pub type HipblasStatus = c_int;
pub type MiopenStatus = c_int;

/// `miopenFloat`
pub const MIOPEN_FLOAT: c_int = 1;
/// `miopenActivationRELU`
pub const MIOPEN_ACTIVATION_RELU: c_int = 3;

// Opaque handles
pub type HipModule = *mut c_void;
pub type HipFunction = *mut c_void;
pub type HipDeviceptr = *mut c_void;
pub type HiprtcProgram = *mut c_void;
pub type HipStream = *mut c_void;
pub type HipblasHandle = *mut c_void;
pub type MiopenHandle = *mut c_void;
pub type MiopenTensorDescriptor = *mut c_void;
pub type MiopenActivationDescriptor = *mut c_void;

// ---------------------------------------------------------------------------
// HIP runtime API
// ---------------------------------------------------------------------------

type FnHipInit = unsafe extern "C" fn(c_uint) -> HipErrorT;
type FnHipGetDeviceCount = unsafe extern "C" fn(*mut c_int) -> HipErrorT;
type FnHipSetDevice = unsafe extern "C" fn(c_int) -> HipErrorT;
type FnHipMalloc = unsafe extern "C" fn(*mut HipDeviceptr, usize) -> HipErrorT;
type FnHipFree = unsafe extern "C" fn(HipDeviceptr) -> HipErrorT;
type FnHipMemcpyAsync = unsafe extern "C" fn(*mut c_void, *const c_void, usize, c_int, HipStream) -> HipErrorT;
type FnHipHostRegister = unsafe extern "C" fn(*mut c_void, usize, c_uint) -> HipErrorT;
type FnHipHostUnregister = unsafe extern "C" fn(*mut c_void) -> HipErrorT;
type FnHipStreamCreate = unsafe extern "C" fn(*mut HipStream) -> HipErrorT;
type FnHipStreamDestroy = unsafe extern "C" fn(HipStream) -> HipErrorT;
type FnHipStreamSynchronize = unsafe extern "C" fn(HipStream) -> HipErrorT;
type FnHipStreamQuery = unsafe extern "C" fn(HipStream) -> HipErrorT;
type FnHipModuleLoadData = unsafe extern "C" fn(*mut HipModule, *const c_void) -> HipErrorT;
type FnHipModuleGetFunction = unsafe extern "C" fn(*mut HipFunction, HipModule, *const c_char) -> HipErrorT;
type FnHipModuleOccupancyMaxPotentialBlockSize = unsafe extern "C" fn(
    *mut c_int,  // min grid size
    *mut c_int,  // block size
    HipFunction,
    usize,       // dynamic shared mem
    c_int,       // block size limit (0 = none)
) -> HipErrorT;
type FnHipModuleLaunchKernel = unsafe extern "C" fn(
    HipFunction,
    c_uint, c_uint, c_uint, // grid x, y, z
    c_uint, c_uint, c_uint, // block x, y, z
    c_uint,                 // shared mem bytes
    HipStream,              // stream (null = default)
    *mut *mut c_void,       // kernel params
    *mut *mut c_void,       // extra (null)
) -> HipErrorT;

// ---------------------------------------------------------------------------
// hiprtc API
// ---------------------------------------------------------------------------

type FnHiprtcCreateProgram = unsafe extern "C" fn(
    *mut HiprtcProgram,
    *const c_char,        // source
    *const c_char,        // name
    c_int,                // numHeaders
    *const *const c_char, // headers
    *const *const c_char, // includeNames
) -> HiprtcResult;
type FnHiprtcCompileProgram = unsafe extern "C" fn(HiprtcProgram, c_int, *const *const c_char) -> HiprtcResult;
type FnHiprtcGetCodeSize = unsafe extern "C" fn(HiprtcProgram, *mut usize) -> HiprtcResult;
type FnHiprtcGetCode = unsafe extern "C" fn(HiprtcProgram, *mut c_char) -> HiprtcResult;
type FnHiprtcGetProgramLogSize = unsafe extern "C" fn(HiprtcProgram, *mut usize) -> HiprtcResult;
type FnHiprtcGetProgramLog = unsafe extern "C" fn(HiprtcProgram, *mut c_char) -> HiprtcResult;
type FnHiprtcDestroyProgram = unsafe extern "C" fn(*mut HiprtcProgram) -> HiprtcResult;

// ---------------------------------------------------------------------------
// hipBLAS API
// ---------------------------------------------------------------------------

type FnHipblasCreate = unsafe extern "C" fn(*mut HipblasHandle) -> HipblasStatus;
type FnHipblasDestroy = unsafe extern "C" fn(HipblasHandle) -> HipblasStatus;
type FnHipblasSetStream = unsafe extern "C" fn(HipblasHandle, HipStream) -> HipblasStatus;
type FnHipblasSscal = unsafe extern "C" fn(HipblasHandle, c_int, *const c_float, *mut c_float, c_int) -> HipblasStatus;
type FnHipblasSaxpy = unsafe extern "C" fn(
    HipblasHandle,
    c_int,
    *const c_float,
    *const c_float,
    c_int,
    *mut c_float,
    c_int,
) -> HipblasStatus;

// ---------------------------------------------------------------------------
// MIOpen API
// ---------------------------------------------------------------------------

type FnMiopenCreateWithStream = unsafe extern "C" fn(*mut MiopenHandle, HipStream) -> MiopenStatus;
type FnMiopenDestroy = unsafe extern "C" fn(MiopenHandle) -> MiopenStatus;
type FnMiopenCreateTensorDescriptor = unsafe extern "C" fn(*mut MiopenTensorDescriptor) -> MiopenStatus;
type FnMiopenSet4dTensorDescriptor =
    unsafe extern "C" fn(MiopenTensorDescriptor, c_int, c_int, c_int, c_int, c_int) -> MiopenStatus;
type FnMiopenDestroyTensorDescriptor = unsafe extern "C" fn(MiopenTensorDescriptor) -> MiopenStatus;
type FnMiopenCreateActivationDescriptor = unsafe extern "C" fn(*mut MiopenActivationDescriptor) -> MiopenStatus;
type FnMiopenSetActivationDescriptor =
    unsafe extern "C" fn(MiopenActivationDescriptor, c_int, f64, f64, f64) -> MiopenStatus;
type FnMiopenDestroyActivationDescriptor = unsafe extern "C" fn(MiopenActivationDescriptor) -> MiopenStatus;
type FnMiopenActivationForward = unsafe extern "C" fn(
    MiopenHandle,
    MiopenActivationDescriptor,
    *const c_void, // alpha
    MiopenTensorDescriptor,
    *const c_void, // x
    *const c_void, // beta
    MiopenTensorDescriptor,
    *mut c_void, // y
) -> MiopenStatus;

// ---------------------------------------------------------------------------
// Loaded API structs
// ---------------------------------------------------------------------------

pub struct HipApi {
    _lib: Library,
    pub hip_init: FnHipInit,
    pub hip_get_device_count: FnHipGetDeviceCount,
    pub hip_set_device: FnHipSetDevice,
    pub hip_malloc: FnHipMalloc,
    pub hip_free: FnHipFree,
    pub hip_memcpy_async: FnHipMemcpyAsync,
    pub hip_host_register: FnHipHostRegister,
    pub hip_host_unregister: FnHipHostUnregister,
    pub hip_stream_create: FnHipStreamCreate,
    pub hip_stream_destroy: FnHipStreamDestroy,
    pub hip_stream_synchronize: FnHipStreamSynchronize,
    pub hip_stream_query: FnHipStreamQuery,
    pub hip_module_load_data: FnHipModuleLoadData,
    pub hip_module_get_function: FnHipModuleGetFunction,
    pub hip_module_occupancy_max_potential_block_size: FnHipModuleOccupancyMaxPotentialBlockSize,
    pub hip_module_launch_kernel: FnHipModuleLaunchKernel,
}

pub struct HiprtcApi {
    _lib: Library,
    pub hiprtc_create_program: FnHiprtcCreateProgram,
    pub hiprtc_compile_program: FnHiprtcCompileProgram,
    pub hiprtc_get_code_size: FnHiprtcGetCodeSize,
    pub hiprtc_get_code: FnHiprtcGetCode,
    pub hiprtc_get_program_log_size: FnHiprtcGetProgramLogSize,
    pub hiprtc_get_program_log: FnHiprtcGetProgramLog,
    pub hiprtc_destroy_program: FnHiprtcDestroyProgram,
}

pub struct HipblasApi {
    _lib: Library,
    pub hipblas_create: FnHipblasCreate,
    pub hipblas_destroy: FnHipblasDestroy,
    pub hipblas_set_stream: FnHipblasSetStream,
    pub hipblas_sscal: FnHipblasSscal,
    pub hipblas_saxpy: FnHipblasSaxpy,
}

pub struct MiopenApi {
    _lib: Library,
    pub miopen_create_with_stream: FnMiopenCreateWithStream,
    pub miopen_destroy: FnMiopenDestroy,
    pub miopen_create_tensor_descriptor: FnMiopenCreateTensorDescriptor,
    pub miopen_set_4d_tensor_descriptor: FnMiopenSet4dTensorDescriptor,
    pub miopen_destroy_tensor_descriptor: FnMiopenDestroyTensorDescriptor,
    pub miopen_create_activation_descriptor: FnMiopenCreateActivationDescriptor,
    pub miopen_set_activation_descriptor: FnMiopenSetActivationDescriptor,
    pub miopen_destroy_activation_descriptor: FnMiopenDestroyActivationDescriptor,
    pub miopen_activation_forward: FnMiopenActivationForward,
}

// Safety: the loaded function pointers are process-global and the ROCm
// libraries synchronize internally.
unsafe impl Send for HipApi {}
unsafe impl Sync for HipApi {}
unsafe impl Send for HiprtcApi {}
unsafe impl Sync for HiprtcApi {}
unsafe impl Send for HipblasApi {}
unsafe impl Sync for HipblasApi {}
unsafe impl Send for MiopenApi {}
unsafe impl Sync for MiopenApi {}

// ---------------------------------------------------------------------------
// Library loading
// ---------------------------------------------------------------------------

static HIP_API: OnceLock<Option<HipApi>> = OnceLock::new();
static HIPRTC_API: OnceLock<Option<HiprtcApi>> = OnceLock::new();
static HIPBLAS_API: OnceLock<Option<HipblasApi>> = OnceLock::new();
static MIOPEN_API: OnceLock<Option<MiopenApi>> = OnceLock::new();

impl HipApi {
    fn try_load() -> Option<Self> {
        let lib = unsafe { Library::new("libamdhip64.so") }.ok()?;
        unsafe {
            let api = HipApi {
                hip_init: *lib.get::<FnHipInit>(b"hipInit\0").ok()?,
                hip_get_device_count: *lib.get::<FnHipGetDeviceCount>(b"hipGetDeviceCount\0").ok()?,
                hip_set_device: *lib.get::<FnHipSetDevice>(b"hipSetDevice\0").ok()?,
                hip_malloc: *lib.get::<FnHipMalloc>(b"hipMalloc\0").ok()?,
                hip_free: *lib.get::<FnHipFree>(b"hipFree\0").ok()?,
                hip_memcpy_async: *lib.get::<FnHipMemcpyAsync>(b"hipMemcpyAsync\0").ok()?,
                hip_host_register: *lib.get::<FnHipHostRegister>(b"hipHostRegister\0").ok()?,
                hip_host_unregister: *lib.get::<FnHipHostUnregister>(b"hipHostUnregister\0").ok()?,
                hip_stream_create: *lib.get::<FnHipStreamCreate>(b"hipStreamCreate\0").ok()?,
                hip_stream_destroy: *lib.get::<FnHipStreamDestroy>(b"hipStreamDestroy\0").ok()?,
                hip_stream_synchronize: *lib.get::<FnHipStreamSynchronize>(b"hipStreamSynchronize\0").ok()?,
                hip_stream_query: *lib.get::<FnHipStreamQuery>(b"hipStreamQuery\0").ok()?,
                hip_module_load_data: *lib.get::<FnHipModuleLoadData>(b"hipModuleLoadData\0").ok()?,
                hip_module_get_function: *lib.get::<FnHipModuleGetFunction>(b"hipModuleGetFunction\0").ok()?,
                hip_module_occupancy_max_potential_block_size: *lib
                    .get::<FnHipModuleOccupancyMaxPotentialBlockSize>(b"hipModuleOccupancyMaxPotentialBlockSize\0")
                    .ok()?,
                hip_module_launch_kernel: *lib.get::<FnHipModuleLaunchKernel>(b"hipModuleLaunchKernel\0").ok()?,
                _lib: lib,
            };
            Some(api)
        }
    }
}

impl HiprtcApi {
    fn try_load() -> Option<Self> {
        let lib = unsafe { Library::new("libhiprtc.so") }.ok()?;
        unsafe {
            let api = HiprtcApi {
                hiprtc_create_program: *lib.get::<FnHiprtcCreateProgram>(b"hiprtcCreateProgram\0").ok()?,
                hiprtc_compile_program: *lib.get::<FnHiprtcCompileProgram>(b"hiprtcCompileProgram\0").ok()?,
                hiprtc_get_code_size: *lib.get::<FnHiprtcGetCodeSize>(b"hiprtcGetCodeSize\0").ok()?,
                hiprtc_get_code: *lib.get::<FnHiprtcGetCode>(b"hiprtcGetCode\0").ok()?,
                hiprtc_get_program_log_size: *lib.get::<FnHiprtcGetProgramLogSize>(b"hiprtcGetProgramLogSize\0").ok()?,
                hiprtc_get_program_log: *lib.get::<FnHiprtcGetProgramLog>(b"hiprtcGetProgramLog\0").ok()?,
                hiprtc_destroy_program: *lib.get::<FnHiprtcDestroyProgram>(b"hiprtcDestroyProgram\0").ok()?,
                _lib: lib,
            };
            Some(api)
        }
    }
}

impl HipblasApi {
    fn try_load() -> Option<Self> {
        let lib = unsafe { Library::new("libhipblas.so") }.ok()?;
        unsafe {
            let api = HipblasApi {
                hipblas_create: *lib.get::<FnHipblasCreate>(b"hipblasCreate\0").ok()?,
                hipblas_destroy: *lib.get::<FnHipblasDestroy>(b"hipblasDestroy\0").ok()?,
                hipblas_set_stream: *lib.get::<FnHipblasSetStream>(b"hipblasSetStream\0").ok()?,
                hipblas_sscal: *lib.get::<FnHipblasSscal>(b"hipblasSscal\0").ok()?,
                hipblas_saxpy: *lib.get::<FnHipblasSaxpy>(b"hipblasSaxpy\0").ok()?,
                _lib: lib,
            };
            Some(api)
        }
    }
}

impl MiopenApi {
    fn try_load() -> Option<Self> {
        let lib = unsafe { Library::new("libMIOpen.so") }.ok()?;
        unsafe {
            let api = MiopenApi {
                miopen_create_with_stream: *lib.get::<FnMiopenCreateWithStream>(b"miopenCreateWithStream\0").ok()?,
                miopen_destroy: *lib.get::<FnMiopenDestroy>(b"miopenDestroy\0").ok()?,
                miopen_create_tensor_descriptor: *lib
                    .get::<FnMiopenCreateTensorDescriptor>(b"miopenCreateTensorDescriptor\0")
                    .ok()?,
                miopen_set_4d_tensor_descriptor: *lib
                    .get::<FnMiopenSet4dTensorDescriptor>(b"miopenSet4dTensorDescriptor\0")
                    .ok()?,
                miopen_destroy_tensor_descriptor: *lib
                    .get::<FnMiopenDestroyTensorDescriptor>(b"miopenDestroyTensorDescriptor\0")
                    .ok()?,
                miopen_create_activation_descriptor: *lib
                    .get::<FnMiopenCreateActivationDescriptor>(b"miopenCreateActivationDescriptor\0")
                    .ok()?,
                miopen_set_activation_descriptor: *lib
                    .get::<FnMiopenSetActivationDescriptor>(b"miopenSetActivationDescriptor\0")
                    .ok()?,
                miopen_destroy_activation_descriptor: *lib
                    .get::<FnMiopenDestroyActivationDescriptor>(b"miopenDestroyActivationDescriptor\0")
                    .ok()?,
                miopen_activation_forward: *lib.get::<FnMiopenActivationForward>(b"miopenActivationForward\0").ok()?,
                _lib: lib,
            };
            Some(api)
        }
    }
}

/// Runtime-loaded HIP API, or `NotAvailable` if `libamdhip64.so` is missing.
pub fn hip_api() -> Result<&'static HipApi, RocmError> {
    HIP_API
        .get_or_init(HipApi::try_load)
        .as_ref()
        .ok_or(RocmError::NotAvailable("libamdhip64.so"))
}

pub fn hiprtc_api() -> Result<&'static HiprtcApi, RocmError> {
    HIPRTC_API
        .get_or_init(HiprtcApi::try_load)
        .as_ref()
        .ok_or(RocmError::NotAvailable("libhiprtc.so"))
}

pub fn hipblas_api() -> Result<&'static HipblasApi, RocmError> {
    HIPBLAS_API
        .get_or_init(HipblasApi::try_load)
        .as_ref()
        .ok_or(RocmError::NotAvailable("libhipblas.so"))
}

pub fn miopen_api() -> Result<&'static MiopenApi, RocmError> {
    MIOPEN_API
        .get_or_init(MiopenApi::try_load)
        .as_ref()
        .ok_or(RocmError::NotAvailable("libMIOpen.so"))
}

// ---------------------------------------------------------------------------
// Error checking helpers
// ---------------------------------------------------------------------------

/// Check a hiprtc return code.
pub fn check_hiprtc(code: HiprtcResult, context: &str) -> Result<(), RocmError> {
    if code == HIPRTC_SUCCESS {
        Ok(())
    } else {
        Err(RocmError::Hiprtc {
            code,
            context: context.to_string(),
        })
    }
}
