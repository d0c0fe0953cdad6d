//! Tensor descriptors shared by the graph, operators and drivers.
//!
//! Shapes are row-major. Descriptors live in a [`TensorStore`] owned by the graph and are
//! addressed by [`TensorId`]; tensors created by internal workspaces live in the same store.

pub mod convert;
pub mod descriptor;
pub mod dtype;
pub mod quant;
pub mod shape;
mod store;

use thiserror::Error;

pub use descriptor::{TensorAttr, TensorDescriptor, TensorId, ViewLink};
pub use dtype::DType;
pub use quant::{QuantKind, Quantization};
pub use shape::{Dims, Shape, MAX_DIM_NUM};
pub use store::TensorStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TensorError {
    #[error("tensor rank {0} is outside 1..={max}", max = MAX_DIM_NUM)]
    Rank(usize),
    #[error("unknown tensor {0}")]
    Unknown(TensorId),
    #[error("tensor {0} has no resolved shape")]
    Unresolved(TensorId),
    #[error("shapes {lhs:?} and {rhs:?} do not broadcast")]
    Broadcast { lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("const tensor expects {expected} bytes, got {actual}")]
    ConstSize { expected: usize, actual: usize },
    #[error("invalid tensor attributes: {0}")]
    InvalidAttr(String),
}

pub type TensorResult<T> = Result<T, TensorError>;
