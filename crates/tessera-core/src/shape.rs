use smallvec::SmallVec;
use std::fmt;

use crate::{Result, TesseraError};

/// Highest rank a device tensor may have.
pub const MAX_RANK: usize = 6;

/// Inline dimension or stride list. Stays on the stack up to [`MAX_RANK`].
pub type Dims = SmallVec<[usize; MAX_RANK]>;

/// Extents of a row-major tensor, outermost axis first.
///
/// A shape may be built with more than [`MAX_RANK`] axes; anything that maps
/// it onto the device calls [`check_rank`](Shape::check_rank) first.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Dims,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self { dims: Dims::from_slice(dims) }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Element count. A rank-0 shape holds one element.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Fail with `InvalidArgument` if the rank exceeds [`MAX_RANK`].
    pub fn check_rank(&self) -> Result<()> {
        if self.rank() > MAX_RANK {
            return Err(TesseraError::invalid(format!(
                "shape {self} has rank {}, at most {MAX_RANK} is supported",
                self.rank()
            )));
        }
        Ok(())
    }

    /// Element strides of a dense row-major layout.
    pub fn contiguous_strides(&self) -> Dims {
        let mut strides = Dims::from_elem(1, self.rank());
        for axis in (1..self.rank()).rev() {
            strides[axis - 1] = strides[axis] * self.dims[axis];
        }
        strides
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shape").field(&self.dims.as_slice()).finish()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(usize::to_string).collect();
        write!(f, "[{}]", dims.join(", "))
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape { dims: Dims::from_vec(dims) }
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(&dims)
    }
}
