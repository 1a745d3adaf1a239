//! Device allocations and page-locked host ranges.

use std::fmt;

use tessera_core::{Result, Shape, TesseraError};

use crate::runtime::{DevicePtr, SharedRuntime};
use crate::view::{DeviceTensorSpan, DeviceTensorView};

/// A device allocation holding raw bytes.
///
/// Freed on drop. A zero-byte buffer holds [`DevicePtr::NULL`] and never
/// touches the runtime.
pub struct DeviceBuffer {
    runtime: SharedRuntime,
    ptr: DevicePtr,
    nbytes: usize,
}

impl DeviceBuffer {
    /// Allocate `nbytes` of uninitialised device memory.
    pub fn alloc(runtime: &SharedRuntime, nbytes: usize) -> Result<Self> {
        let ptr = if nbytes == 0 {
            DevicePtr::NULL
        } else {
            runtime
                .alloc(nbytes)
                .map_err(|e| TesseraError::resource(format!("device buffer ({nbytes} bytes)"), e.to_string()))?
        };
        Ok(Self {
            runtime: runtime.clone(),
            ptr,
            nbytes,
        })
    }

    /// Allocate room for `numel` `f32` elements.
    pub fn alloc_f32(runtime: &SharedRuntime, numel: usize) -> Result<Self> {
        Self::alloc(runtime, numel * std::mem::size_of::<f32>())
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Number of bytes in this buffer.
    pub fn len(&self) -> usize {
        self.nbytes
    }

    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }

    /// Capacity in `f32` elements.
    pub fn capacity_f32(&self) -> usize {
        self.nbytes / std::mem::size_of::<f32>()
    }

    pub fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    /// Read-only view of the leading `shape.numel()` elements.
    pub fn view(&self, shape: impl Into<Shape>) -> Result<DeviceTensorView> {
        DeviceTensorView::new(self.ptr, self.capacity_f32(), shape)
    }

    /// Writable view of the leading `shape.numel()` elements.
    pub fn span(&mut self, shape: impl Into<Shape>) -> Result<DeviceTensorSpan> {
        DeviceTensorSpan::new(self.ptr, self.capacity_f32(), shape)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        if let Err(e) = self.runtime.free(self.ptr) {
            tracing::warn!(ptr = %self.ptr, nbytes = self.nbytes, "device free failed: {e}");
        }
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("backend", &self.runtime.name())
            .field("ptr", &format_args!("{}", self.ptr))
            .field("nbytes", &self.nbytes)
            .finish()
    }
}

/// Keeps a host range page-locked until dropped.
pub struct HostPin {
    runtime: SharedRuntime,
    addr: usize,
    nbytes: usize,
}

impl HostPin {
    /// Page-lock `nbytes` starting at `addr`. Empty ranges are not registered.
    pub fn pin(runtime: &SharedRuntime, addr: usize, nbytes: usize) -> Result<Self> {
        if nbytes > 0 {
            runtime
                .pin_host(addr, nbytes)
                .map_err(|e| TesseraError::resource(format!("host pin ({nbytes} bytes)"), e.to_string()))?;
        }
        Ok(Self {
            runtime: runtime.clone(),
            addr,
            nbytes,
        })
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.nbytes
    }

    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }
}

impl Drop for HostPin {
    fn drop(&mut self) {
        if self.nbytes == 0 {
            return;
        }
        if let Err(e) = self.runtime.unpin_host(self.addr) {
            tracing::warn!(addr = self.addr, "host unpin failed: {e}");
        }
    }
}

impl fmt::Debug for HostPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPin")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("nbytes", &self.nbytes)
            .finish()
    }
}
