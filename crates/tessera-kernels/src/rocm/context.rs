//! HIP device selection and backend-specific errors.

use std::sync::OnceLock;

use parking_lot::Mutex;
use tessera_core::{check_status, TesseraError};

use super::ffi::{self, HIP_SUCCESS};

/// Tracks which HIP device indices have been initialized.
static INIT_DEVICES: OnceLock<Mutex<Vec<bool>>> = OnceLock::new();

fn init_devices() -> &'static Mutex<Vec<bool>> {
    INIT_DEVICES.get_or_init(|| Mutex::new(Vec::new()))
}

/// Initialize the HIP runtime and select the given device.
/// No-op if already initialized for this device index.
pub fn init_device(device_idx: usize) -> tessera_core::Result<()> {
    let api = ffi::hip_api()?;
    let mut devs = init_devices().lock();
    if devs.len() <= device_idx {
        devs.resize(device_idx + 1, false);
    }
    if !devs[device_idx] {
        check_status(unsafe { (api.hip_init)(0) }, "hipInit")?;
        set_device(device_idx)?;
        devs[device_idx] = true;
    }
    Ok(())
}

/// Make `device_idx` current on the calling thread.
pub fn set_device(device_idx: usize) -> tessera_core::Result<()> {
    let api = ffi::hip_api()?;
    check_status(unsafe { (api.hip_set_device)(device_idx as i32) }, "hipSetDevice")
}

/// Number of visible HIP devices; 0 when the runtime cannot be loaded.
pub fn device_count() -> usize {
    let Ok(api) = ffi::hip_api() else {
        return 0;
    };
    if unsafe { (api.hip_init)(0) } != HIP_SUCCESS {
        return 0;
    }
    let mut count: i32 = 0;
    if unsafe { (api.hip_get_device_count)(&mut count) } != HIP_SUCCESS {
        return 0;
    }
    count.max(0) as usize
}

/// Whether `libamdhip64.so` loads and reports at least one device.
pub fn is_rocm_available() -> bool {
    device_count() > 0
}

/// ROCm-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum RocmError {
    #[error("ROCm library {0} not available")]
    NotAvailable(&'static str),

    #[error("hiprtc error {code} in {context}")]
    Hiprtc { code: i32, context: String },

    #[error("hiprtc compilation failed for '{kernel}': {log}")]
    Compile { kernel: String, log: String },
}

impl From<RocmError> for TesseraError {
    fn from(e: RocmError) -> Self {
        match e {
            RocmError::NotAvailable(_) => TesseraError::resource("ROCm runtime", e.to_string()),
            RocmError::Hiprtc { code, context } => TesseraError::device(code, context),
            RocmError::Compile { .. } => TesseraError::resource("device kernel", e.to_string()),
        }
    }
}
