//! Graph execution runtime for neural-network operators.
//!
//! A [`Graph`] holds tensors and operator nodes. Building it walks every node through
//! `init`, `check`, `setup`, a forward and a backward `optimize` pass, and `compute`, where
//! operators bind kernels chosen by the [`kernel`] selector. Operators that have no kernel
//! of their own compose child nodes through [`internal`]. Kernels run on a [`Driver`].

extern crate self as vxgraph;

pub mod diagnostics;
pub mod driver;
pub mod env;
pub mod error;
pub mod graph;
pub mod internal;
pub mod kernel;
pub mod node;
pub mod ops;
pub mod tensor;

#[cfg(test)]
pub(crate) mod testing;

pub use linkme;

pub use driver::{create_driver, has_driver, list_drivers, register_driver, Driver};
pub use error::{GraphError, GraphResult, OpError, OpResult};
pub use graph::{Graph, GraphConfig, GraphContext, GraphState};
pub use node::{Node, NodeUid};
pub use ops::{OpKind, Operator};
pub use tensor::{DType, Quantization, Shape, TensorAttr, TensorId};
