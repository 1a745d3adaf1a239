//! Non-owning shaped windows over device memory.
//!
//! A view records where its elements live inside a parent allocation and how
//! they are laid out; it never owns or frees memory. Whoever hands a view out
//! keeps the allocation alive for as long as the view is in use.
//! [`DeviceTensorView`] is read-only, [`DeviceTensorSpan`] is the writable twin.

use std::ops::Deref;

use tessera_core::{Dims, Result, Shape, TesseraError};

use crate::runtime::DevicePtr;

const ELEM_BYTES: usize = std::mem::size_of::<f32>();

/// Read-only strided window over an `f32` device allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTensorView {
    base: DevicePtr,
    /// Elements addressable from `base`.
    capacity: usize,
    /// First element of the view, relative to `base`.
    offset: usize,
    shape: Shape,
    strides: Dims,
}

impl DeviceTensorView {
    /// Contiguous view of `shape` at the start of an allocation of
    /// `capacity` elements.
    pub fn new(base: DevicePtr, capacity: usize, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        shape.check_rank()?;
        if shape.numel() > capacity {
            return Err(TesseraError::invalid(format!(
                "shape {} needs {} elements, allocation holds {}",
                shape,
                shape.numel(),
                capacity
            )));
        }
        let strides = shape.contiguous_strides();
        Ok(Self {
            base,
            capacity,
            offset: 0,
            shape,
            strides,
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Element offset of the view inside its parent allocation.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size_in_bytes(&self) -> usize {
        self.numel() * ELEM_BYTES
    }

    /// Address of the first element.
    pub fn device_ptr(&self) -> DevicePtr {
        self.base.offset(self.offset * ELEM_BYTES)
    }

    /// Whether the elements form one dense row-major block.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1;
        for (&dim, &stride) in self.shape.dims().iter().zip(&self.strides).rev() {
            if dim != 1 && stride != expected {
                return false;
            }
            expected *= dim;
        }
        true
    }

    /// Sub-range `begin[i]..end[i]` along the leading `begin.len()` axes.
    ///
    /// Trailing axes keep their full extent. No data moves; the result shares
    /// the parent's strides. Fails without touching `self` if the ranges are
    /// malformed or exceed an axis.
    pub fn subspan(&self, begin: &[usize], end: &[usize]) -> Result<Self> {
        if begin.len() != end.len() {
            return Err(TesseraError::invalid(format!(
                "subspan: {} begin indices but {} end indices",
                begin.len(),
                end.len()
            )));
        }
        if begin.len() > self.rank() {
            return Err(TesseraError::invalid(format!(
                "subspan: {} axes requested on a rank-{} view",
                begin.len(),
                self.rank()
            )));
        }
        let mut dims: Dims = self.shape.dims().into();
        let mut offset = self.offset;
        for (axis, (&b, &e)) in begin.iter().zip(end).enumerate() {
            if b > e || e > dims[axis] {
                return Err(TesseraError::invalid(format!(
                    "subspan: range {b}..{e} exceeds extent {} of axis {axis}",
                    dims[axis]
                )));
            }
            offset += b * self.strides[axis];
            dims[axis] = e - b;
        }
        Ok(Self {
            base: self.base,
            capacity: self.capacity,
            offset,
            shape: Shape::new(&dims),
            strides: self.strides.clone(),
        })
    }

    /// Contiguous window of `shape` starting `offset` elements into this view.
    pub fn subspan_flat(&self, offset: usize, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        shape.check_rank()?;
        if !self.is_contiguous() {
            return Err(TesseraError::invalid("subspan_flat on a non-contiguous view"));
        }
        if offset + shape.numel() > self.numel() {
            return Err(TesseraError::invalid(format!(
                "subspan_flat: {} elements at offset {offset} exceed the {} elements of the view",
                shape.numel(),
                self.numel()
            )));
        }
        let strides = shape.contiguous_strides();
        Ok(Self {
            base: self.base,
            capacity: self.capacity,
            offset: self.offset + offset,
            shape,
            strides,
        })
    }

    /// Same elements under a different shape. Element count must match.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.numel() != self.numel() {
            return Err(TesseraError::invalid(format!(
                "reshape: {} ({} elements) to {} ({} elements)",
                self.shape,
                self.numel(),
                shape,
                shape.numel()
            )));
        }
        self.subspan_flat(0, shape)
    }
}

/// Writable strided window over an `f32` device allocation.
///
/// Dereferences to [`DeviceTensorView`] for the read-only accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTensorSpan(DeviceTensorView);

impl DeviceTensorSpan {
    pub fn new(base: DevicePtr, capacity: usize, shape: impl Into<Shape>) -> Result<Self> {
        DeviceTensorView::new(base, capacity, shape).map(Self)
    }

    pub fn as_view(&self) -> &DeviceTensorView {
        &self.0
    }

    pub fn into_view(self) -> DeviceTensorView {
        self.0
    }

    pub fn subspan(&self, begin: &[usize], end: &[usize]) -> Result<Self> {
        self.0.subspan(begin, end).map(Self)
    }

    pub fn subspan_flat(&self, offset: usize, shape: impl Into<Shape>) -> Result<Self> {
        self.0.subspan_flat(offset, shape).map(Self)
    }

    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        self.0.reshape(shape).map(Self)
    }
}

impl Deref for DeviceTensorSpan {
    type Target = DeviceTensorView;

    fn deref(&self) -> &DeviceTensorView {
        &self.0
    }
}

impl From<DeviceTensorSpan> for DeviceTensorView {
    fn from(span: DeviceTensorSpan) -> Self {
        span.0
    }
}
