//! Operator descriptors, their registry and the per-phase dispatcher.
//!
//! An operator is a set of lifecycle callbacks behind the [`Operator`] trait. Operators are
//! keyed by [`OpKind`], a name inside one of four namespaces. Built-in, custom and internal
//! operators are registered once through [`OPERATOR_REGISTRARS`]; client code may install
//! overrides afterwards, which take precedence over every table.

pub mod builtin;
pub mod constraint;
pub mod dispatch;
mod registry;

use std::fmt;

use crate::error::OpResult;
use crate::graph::{GraphContext, OptimizeContext, OptimizeDecision};
use crate::node::Node;

pub use constraint::{IoType, OpConstraint};
pub use registry::{
    register_client_override, register_compute_override, ComputeFn, OpRegistry,
    OpRegistryBuilder, OPERATOR_REGISTRARS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpNamespace {
    Builtin,
    Custom,
    Internal,
    /// Kinds defined outside this crate.
    Client,
}

/// Strongly-typed operator key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpKind {
    namespace: OpNamespace,
    name: &'static str,
}

impl OpKind {
    pub const fn builtin(name: &'static str) -> Self {
        OpKind {
            namespace: OpNamespace::Builtin,
            name,
        }
    }

    pub const fn custom(name: &'static str) -> Self {
        OpKind {
            namespace: OpNamespace::Custom,
            name,
        }
    }

    pub const fn internal(name: &'static str) -> Self {
        OpKind {
            namespace: OpNamespace::Internal,
            name,
        }
    }

    pub const fn client(name: &'static str) -> Self {
        OpKind {
            namespace: OpNamespace::Client,
            name,
        }
    }

    pub const fn namespace(self) -> OpNamespace {
        self.namespace
    }

    pub const fn name(self) -> &'static str {
        self.name
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace {
            OpNamespace::Builtin => f.write_str(self.name),
            OpNamespace::Custom => write!(f, "custom:{}", self.name),
            OpNamespace::Internal => write!(f, "internal:{}", self.name),
            OpNamespace::Client => write!(f, "client:{}", self.name),
        }
    }
}

/// Number of tensors on one side of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCount {
    Fixed(usize),
    /// Any non-zero count chosen by the caller.
    Any,
}

impl IoCount {
    /// Count a new node gets when the caller asks for `requested` (0 = operator default).
    pub fn resolve(self, requested: usize) -> Option<usize> {
        match (self, requested) {
            (IoCount::Fixed(n), 0) => Some(n),
            (IoCount::Fixed(n), r) if r == n => Some(n),
            (IoCount::Fixed(_), _) => None,
            (IoCount::Any, 0) => None,
            (IoCount::Any, r) => Some(r),
        }
    }
}

impl fmt::Display for IoCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCount::Fixed(n) => write!(f, "{n}"),
            IoCount::Any => f.write_str("at least 1"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub inputs: IoCount,
    pub outputs: IoCount,
}

impl Arity {
    pub const fn fixed(inputs: usize, outputs: usize) -> Self {
        Arity {
            inputs: IoCount::Fixed(inputs),
            outputs: IoCount::Fixed(outputs),
        }
    }

    pub const fn variadic_inputs(outputs: usize) -> Self {
        Arity {
            inputs: IoCount::Any,
            outputs: IoCount::Fixed(outputs),
        }
    }
}

/// Lifecycle callbacks of one operator kind.
///
/// Only `compute` is mandatory. The defaults accept every node, resolve no shapes and skip
/// optimization.
pub trait Operator: Send + Sync {
    fn name(&self) -> &'static str;

    fn arity(&self) -> Arity;

    /// Runs once when the node is created. Typically installs default parameters.
    fn init(&self, _node: &mut Node) -> OpResult<()> {
        Ok(())
    }

    /// Validates operand types. Returning false stops the node before setup.
    fn check(&self, _cx: &GraphContext, _node: &Node) -> bool {
        true
    }

    /// Resolves output shapes and builds internal nodes.
    fn setup(&self, _cx: &mut GraphContext, _node: &mut Node) -> OpResult<()> {
        Ok(())
    }

    fn optimize(
        &self,
        _cx: &mut OptimizeContext<'_>,
        _node: &mut Node,
    ) -> OpResult<OptimizeDecision> {
        Ok(OptimizeDecision::Skip)
    }

    /// Binds kernels, or delegates to internal nodes.
    fn compute(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()>;

    /// Releases operator-specific resources. Kernel nodes, local data and the internal
    /// workspace are released by the dispatcher afterwards.
    fn deinit(&self, _cx: &mut GraphContext, _node: &mut Node) -> OpResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_count_resolution() {
        assert_eq!(IoCount::Fixed(2).resolve(0), Some(2));
        assert_eq!(IoCount::Fixed(2).resolve(2), Some(2));
        assert_eq!(IoCount::Fixed(2).resolve(3), None);
        assert_eq!(IoCount::Any.resolve(0), None);
        assert_eq!(IoCount::Any.resolve(5), Some(5));
    }

    #[test]
    fn kinds_in_different_namespaces_differ() {
        let builtin = OpKind::builtin("ADD");
        let client = OpKind::client("ADD");
        assert_ne!(builtin, client);
        assert_eq!(builtin.to_string(), "ADD");
        assert_eq!(client.to_string(), "client:ADD");
    }
}
