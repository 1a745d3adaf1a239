use std::fmt;
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Result, Shape, TesseraError};

/// Contiguous `f32` host tensor owned by the inference engine.
///
/// Clones share the same buffer (`Arc`), so the CPU execution path and a
/// coherent device buffer can both hold a reference to one allocation. The
/// element count is fixed at construction: guards only hand out slices, never
/// the backing `Vec`, which keeps the buffer address stable while it is pinned.
#[derive(Clone)]
pub struct HostTensor {
    shape: Shape,
    data: Arc<RwLock<Vec<f32>>>,
}

impl HostTensor {
    /// Create a tensor from f32 data with the given shape.
    pub fn from_f32(data: &[f32], dims: &[usize]) -> Result<Self> {
        Self::from_vec(data.to_vec(), dims)
    }

    /// Take ownership of `data` as a tensor of shape `dims`.
    pub fn from_vec(data: Vec<f32>, dims: &[usize]) -> Result<Self> {
        let shape = Shape::new(dims);
        if shape.numel() != data.len() {
            return Err(TesseraError::invalid(format!(
                "shape {} requires {} elements, got {}",
                shape,
                shape.numel(),
                data.len()
            )));
        }
        Ok(Self {
            shape,
            data: Arc::new(RwLock::new(data)),
        })
    }

    /// Zero-filled tensor.
    pub fn zeros(dims: &[usize]) -> Self {
        let shape = Shape::new(dims);
        let data = vec![0.0f32; shape.numel()];
        Self {
            shape,
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Size in bytes.
    pub fn nbytes(&self) -> usize {
        self.numel() * std::mem::size_of::<f32>()
    }

    /// Shared read access to the elements.
    pub fn read(&self) -> MappedRwLockReadGuard<'_, [f32]> {
        RwLockReadGuard::map(self.data.read(), |v| v.as_slice())
    }

    /// Exclusive write access to the elements.
    ///
    /// Writing here does not notify any device counterpart; callers mark the
    /// owning coherent buffer host-dirty themselves.
    pub fn write(&self) -> MappedRwLockWriteGuard<'_, [f32]> {
        RwLockWriteGuard::map(self.data.write(), |v| v.as_mut_slice())
    }

    /// Overwrite every element from `src`.
    pub fn copy_from_slice(&self, src: &[f32]) -> Result<()> {
        if src.len() != self.numel() {
            return Err(TesseraError::invalid(format!(
                "cannot copy {} elements into a tensor of {} elements",
                src.len(),
                self.numel()
            )));
        }
        self.write().copy_from_slice(src);
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.read().to_vec()
    }

    /// Address and byte length of the backing buffer, for host pinning.
    pub fn host_range(&self) -> (usize, usize) {
        let guard = self.read();
        (guard.as_ptr() as usize, std::mem::size_of_val(&*guard))
    }

    /// Whether two tensors share the same backing buffer.
    pub fn ptr_eq(&self, other: &HostTensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Whether this tensor is uniquely owned (no other Arc references).
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.data) == 1
    }
}

impl fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTensor")
            .field("shape", &self.shape)
            .field("shared", &!self.is_unique())
            .finish()
    }
}
