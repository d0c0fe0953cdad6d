//! Tensor shapes in row-major order: `dims[0]` is the outermost axis.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::TensorError;

/// Highest tensor rank accepted anywhere in the graph.
pub const MAX_DIM_NUM: usize = 8;

pub type Dims = SmallVec<[usize; MAX_DIM_NUM]>;

/// Stores the logical dimensions of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Dims,
}

impl Shape {
    /// Constructs a shape, rejecting ranks outside `1..=MAX_DIM_NUM`.
    pub fn new(dims: impl AsRef<[usize]>) -> Result<Self, TensorError> {
        let dims = dims.as_ref();
        if dims.is_empty() || dims.len() > MAX_DIM_NUM {
            return Err(TensorError::Rank(dims.len()));
        }
        Ok(Shape {
            dims: SmallVec::from_slice(dims),
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// Row-major strides in elements.
    pub fn strides(&self) -> Dims {
        let mut strides: Dims = SmallVec::from_elem(1, self.rank());
        for axis in (0..self.rank().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.dims[axis + 1];
        }
        strides
    }

    /// Numpy-style broadcast of two shapes, aligned on the innermost axis.
    pub fn broadcast(&self, other: &Shape) -> Result<Shape, TensorError> {
        let rank = self.rank().max(other.rank());
        let mut dims: Dims = SmallVec::from_elem(1, rank);
        for (slot, out) in dims.iter_mut().enumerate() {
            let lhs = lookup_aligned(&self.dims, rank, slot);
            let rhs = lookup_aligned(&other.dims, rank, slot);
            *out = match (lhs, rhs) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => {
                    return Err(TensorError::Broadcast {
                        lhs: self.dims.to_vec(),
                        rhs: other.dims.to_vec(),
                    })
                }
            };
        }
        Ok(Shape { dims })
    }
}

fn lookup_aligned(dims: &[usize], rank: usize, slot: usize) -> usize {
    let offset = rank - dims.len();
    if slot < offset {
        1
    } else {
        dims[slot - offset]
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_ranks() {
        assert_eq!(Shape::new(Vec::<usize>::new()), Err(TensorError::Rank(0)));
        assert_eq!(Shape::new([1; 9]), Err(TensorError::Rank(9)));
        assert!(Shape::new([1; MAX_DIM_NUM]).is_ok());
    }

    #[test]
    fn broadcast_aligns_trailing_axes() {
        let a = Shape::new([2, 1]).unwrap();
        let b = Shape::new([3]).unwrap();
        assert_eq!(a.broadcast(&b).unwrap().dims(), &[2, 3]);

        let c = Shape::new([2, 4]).unwrap();
        assert!(a.broadcast(&c).is_ok());
        assert!(matches!(
            b.broadcast(&c),
            Err(TensorError::Broadcast { .. })
        ));
    }

    #[test]
    fn strides_are_row_major() {
        let shape = Shape::new([2, 3, 4]).unwrap();
        assert_eq!(shape.strides().as_slice(), &[12, 4, 1]);
        assert_eq!(shape.num_elements(), 24);
    }
}
