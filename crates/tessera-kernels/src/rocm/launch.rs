//! hiprtc compilation of the built-in kernels, cached per device.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CString};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tessera_core::check_status;

use super::context::{set_device, RocmError};
use super::ffi::{self, check_hiprtc, HipFunction, HipModule};
use crate::runtime::KernelId;

/// Module and entry point of one compiled kernel. HIP modules are
/// process-global and thread-safe once loaded.
#[derive(Clone, Copy)]
pub struct LoadedKernel {
    _module: HipModule,
    pub function: HipFunction,
}

unsafe impl Send for LoadedKernel {}
unsafe impl Sync for LoadedKernel {}

static KERNEL_CACHE: OnceLock<Mutex<HashMap<(usize, KernelId), LoadedKernel>>> = OnceLock::new();

fn kernel_cache() -> &'static Mutex<HashMap<(usize, KernelId), LoadedKernel>> {
    KERNEL_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Prepended to every kernel before hiprtc compilation.
const HIP_SHIM: &str = r#"
#ifndef __HIP_PLATFORM_AMD__
#define __HIP_PLATFORM_AMD__
#endif
#include <hip/hip_runtime.h>
"#;

/// Compile `kernel` for `device_idx` on first use and return its entry point.
pub fn ensure_kernel(device_idx: usize, kernel: KernelId) -> tessera_core::Result<LoadedKernel> {
    let key = (device_idx, kernel);
    if let Some(&loaded) = kernel_cache().lock().get(&key) {
        return Ok(loaded);
    }

    let hiprtc = ffi::hiprtc_api()?;
    let hip = ffi::hip_api()?;
    set_device(device_idx)?;

    let compile_err = |log: &str| RocmError::Compile {
        kernel: kernel.name().to_string(),
        log: log.to_string(),
    };
    let c_source = CString::new(format!("{}\n{}", HIP_SHIM, kernel.source()))
        .map_err(|_| compile_err("source contains null byte"))?;
    let c_name = CString::new(kernel.name()).map_err(|_| compile_err("name contains null byte"))?;

    let mut prog: ffi::HiprtcProgram = std::ptr::null_mut();
    check_hiprtc(
        unsafe {
            (hiprtc.hiprtc_create_program)(
                &mut prog,
                c_source.as_ptr(),
                c_name.as_ptr(),
                0,
                std::ptr::null(),
                std::ptr::null(),
            )
        },
        "hiprtcCreateProgram",
    )?;

    let compile_result = unsafe { (hiprtc.hiprtc_compile_program)(prog, 0, std::ptr::null()) };
    if compile_result != ffi::HIPRTC_SUCCESS {
        let mut log_size: usize = 0;
        let _ = unsafe { (hiprtc.hiprtc_get_program_log_size)(prog, &mut log_size) };
        let mut log_buf = vec![0u8; log_size];
        let _ = unsafe { (hiprtc.hiprtc_get_program_log)(prog, log_buf.as_mut_ptr() as *mut c_char) };
        unsafe { (hiprtc.hiprtc_destroy_program)(&mut prog) };
        return Err(compile_err(&String::from_utf8_lossy(&log_buf)).into());
    }

    let mut code_size: usize = 0;
    check_hiprtc(
        unsafe { (hiprtc.hiprtc_get_code_size)(prog, &mut code_size) },
        "hiprtcGetCodeSize",
    )?;
    let mut code = vec![0u8; code_size];
    check_hiprtc(
        unsafe { (hiprtc.hiprtc_get_code)(prog, code.as_mut_ptr() as *mut c_char) },
        "hiprtcGetCode",
    )?;
    unsafe { (hiprtc.hiprtc_destroy_program)(&mut prog) };

    let mut module: HipModule = std::ptr::null_mut();
    check_status(
        unsafe { (hip.hip_module_load_data)(&mut module, code.as_ptr() as *const c_void) },
        "hipModuleLoadData",
    )?;
    let mut function: HipFunction = std::ptr::null_mut();
    check_status(
        unsafe { (hip.hip_module_get_function)(&mut function, module, c_name.as_ptr()) },
        &format!("hipModuleGetFunction({})", kernel.name()),
    )?;

    tracing::debug!(kernel = kernel.name(), device = device_idx, bytes = code_size, "compiled kernel");
    let loaded = LoadedKernel {
        _module: module,
        function,
    };
    kernel_cache().lock().insert(key, loaded);
    Ok(loaded)
}
