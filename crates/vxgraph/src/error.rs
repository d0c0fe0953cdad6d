use std::fmt;

use thiserror::Error;

use crate::driver::DriverError;
use crate::graph::{OptimizeDirection, TopologyError};
use crate::kernel::KernelError;
use crate::node::{NodeState, NodeUid};
use crate::tensor::{TensorError, TensorId};

/// Which side of a node an arity or binding error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoSide {
    Inputs,
    Outputs,
}

impl fmt::Display for IoSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IoSide::Inputs => "inputs",
            IoSide::Outputs => "outputs",
        })
    }
}

/// Failure reported by an operator callback. The dispatcher attaches node context.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("internal node failed: {0}")]
    Composition(#[source] Box<GraphError>),
}

impl OpError {
    pub fn invalid(message: impl Into<String>) -> Self {
        OpError::Invalid(message.into())
    }
}

impl From<GraphError> for OpError {
    fn from(err: GraphError) -> Self {
        OpError::Composition(Box::new(err))
    }
}

pub type OpResult<T> = Result<T, OpError>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("operator {op} is not registered")]
    UnregisteredOp { op: String },
    #[error("node {node} ({op}) expects {expected} {side}, got {actual}")]
    ArityMismatch {
        node: NodeUid,
        op: &'static str,
        side: IoSide,
        expected: String,
        actual: usize,
    },
    #[error("unknown tensor {0}")]
    UnknownTensor(TensorId),
    #[error("unknown node {0}")]
    UnknownNode(NodeUid),
    #[error("node {node} ({op}) cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        node: NodeUid,
        op: &'static str,
        from: NodeState,
        to: NodeState,
    },
    #[error("node {node} ({op}) has no internal workspace")]
    NoWorkspace { node: NodeUid, op: &'static str },
    #[error("init node {node} ({op}) failed: {reason}")]
    InitFailed {
        node: NodeUid,
        op: &'static str,
        reason: String,
    },
    #[error("check node {node} ({op}) failed: Inputs/Outputs data type not support: {desc}")]
    CheckFailed {
        node: NodeUid,
        op: &'static str,
        desc: String,
    },
    #[error("setup node {node} ({op}) failed: {reason}")]
    SetupFailed {
        node: NodeUid,
        op: &'static str,
        reason: String,
    },
    #[error("node {parent} ({op}) failed to run internal node: {source}")]
    CompositionFailed {
        parent: NodeUid,
        op: &'static str,
        #[source]
        source: Box<GraphError>,
    },
    #[error("optimize {direction} node {node} ({op}) failed: {reason}")]
    OptimizeFailed {
        node: NodeUid,
        op: &'static str,
        direction: OptimizeDirection,
        reason: String,
    },
    #[error("compute node {node} ({op}) failed: {reason}")]
    ComputeFailed {
        node: NodeUid,
        op: &'static str,
        reason: String,
    },
    #[error("node {node} ({op}) kernel selection failed: {source}")]
    Kernel {
        node: NodeUid,
        op: &'static str,
        #[source]
        source: KernelError,
    },
    #[error("node {node} ({op}) driver call failed: {source}")]
    Driver {
        node: NodeUid,
        op: &'static str,
        #[source]
        source: DriverError,
    },
    #[error("driver call failed: {0}")]
    Device(#[source] DriverError),
    #[error(transparent)]
    Tensor(TensorError),
    #[error("deinit node {node} ({op}) failed: {reason}")]
    DeinitFailed {
        node: NodeUid,
        op: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("graph is {0}")]
    NotReady(&'static str),
}

impl From<TensorError> for GraphError {
    fn from(err: TensorError) -> Self {
        match err {
            TensorError::Unknown(id) => GraphError::UnknownTensor(id),
            other => GraphError::Tensor(other),
        }
    }
}

impl From<DriverError> for GraphError {
    fn from(err: DriverError) -> Self {
        GraphError::Device(err)
    }
}

pub type GraphResult<T> = Result<T, GraphError>;
