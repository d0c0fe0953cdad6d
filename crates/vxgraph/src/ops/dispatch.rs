//! Per-phase dispatch of node callbacks.
//!
//! Each function looks up the node's descriptor, validates the lifecycle transition, runs the
//! callback and turns operator failures into [`GraphError`]s carrying node context. Every
//! failure is also recorded in the graph's diagnostics.

use std::sync::Arc;

use crate::diagnostics::{Diagnostic, Phase};
use crate::error::{GraphError, GraphResult, OpError};
use crate::graph::{
    GraphContext, OptimizeContext, OptimizeDecision, OptimizeDirection, OptimizeVisit,
};
use crate::internal;
use crate::node::{Node, NodeState, Released};

use super::constraint::describe_io;
use super::Operator;

fn descriptor(cx: &GraphContext, node: &Node) -> Option<Arc<dyn Operator>> {
    cx.ops().get_proc(node.kind())
}

fn require(cx: &GraphContext, node: &Node) -> GraphResult<Arc<dyn Operator>> {
    descriptor(cx, node).ok_or_else(|| GraphError::UnregisteredOp {
        op: node.kind().to_string(),
    })
}

fn transition(
    node: &Node,
    op: &'static str,
    allowed: &[NodeState],
    to: NodeState,
) -> GraphResult<()> {
    if allowed.contains(&node.state) {
        Ok(())
    } else {
        Err(GraphError::InvalidTransition {
            node: node.uid(),
            op,
            from: node.state,
            to,
        })
    }
}

fn report(cx: &mut GraphContext, node: &Node, phase: Phase, op: &'static str, reason: String) {
    cx.diagnostics_mut().emit(Diagnostic {
        phase,
        node: node.uid(),
        parent: node.parent(),
        op,
        reason,
    });
}

fn lift(node: &Node, op: &'static str, phase: Phase, err: OpError) -> GraphError {
    let uid = node.uid();
    match err {
        OpError::Composition(source) => GraphError::CompositionFailed {
            parent: uid,
            op,
            source,
        },
        OpError::Kernel(source) => GraphError::Kernel {
            node: uid,
            op,
            source,
        },
        OpError::Driver(source) => GraphError::Driver {
            node: uid,
            op,
            source,
        },
        other => {
            let reason = other.to_string();
            match phase {
                Phase::Init => GraphError::InitFailed {
                    node: uid,
                    op,
                    reason,
                },
                Phase::Deinit => GraphError::DeinitFailed {
                    node: uid,
                    op,
                    reason,
                },
                Phase::Compute | Phase::Execute => GraphError::ComputeFailed {
                    node: uid,
                    op,
                    reason,
                },
                _ => GraphError::SetupFailed {
                    node: uid,
                    op,
                    reason,
                },
            }
        }
    }
}

fn fail(
    cx: &mut GraphContext,
    node: &Node,
    phase: Phase,
    op: &'static str,
    err: OpError,
) -> GraphError {
    report(cx, node, phase, op, err.to_string());
    lift(node, op, phase, err)
}

/// Runs the operator's `init`. A kind without a descriptor cannot be initialized.
pub fn init(cx: &mut GraphContext, node: &mut Node) -> GraphResult<()> {
    let op = require(cx, node)?;
    transition(node, op.name(), &[NodeState::Created], NodeState::Initialized)?;
    op.init(node)
        .map_err(|err| fail(cx, node, Phase::Init, op.name(), err))?;
    node.state = NodeState::Initialized;
    tracing::debug!(
        node = node.uid().0,
        parent = node.parent().map(|p| p.0),
        op = op.name(),
        "init"
    );
    Ok(())
}

/// Runs the operator's `check`; a rejection becomes [`GraphError::CheckFailed`].
pub fn check(cx: &mut GraphContext, node: &mut Node) -> GraphResult<()> {
    let Some(op) = descriptor(cx, node) else {
        transition(node, node.kind().name(), &[NodeState::Initialized], NodeState::Checked)?;
        node.state = NodeState::Checked;
        return Ok(());
    };
    transition(node, op.name(), &[NodeState::Initialized], NodeState::Checked)?;
    if !op.check(cx, node) {
        let desc = describe_io(cx, node);
        report(
            cx,
            node,
            Phase::Check,
            op.name(),
            format!("Inputs/Outputs data type not support: {desc}"),
        );
        return Err(GraphError::CheckFailed {
            node: node.uid(),
            op: op.name(),
            desc,
        });
    }
    node.state = NodeState::Checked;
    tracing::debug!(
        node = node.uid().0,
        parent = node.parent().map(|p| p.0),
        op = op.name(),
        "check passed"
    );
    Ok(())
}

pub fn setup(cx: &mut GraphContext, node: &mut Node) -> GraphResult<()> {
    let op = descriptor(cx, node);
    let name = op.as_ref().map_or(node.kind().name(), |op| op.name());
    transition(node, name, &[NodeState::Checked], NodeState::ShapeResolved)?;
    if let Some(op) = op {
        op.setup(cx, node)
            .map_err(|err| fail(cx, node, Phase::Setup, name, err))?;
    }
    node.state = NodeState::ShapeResolved;
    tracing::debug!(node = node.uid().0, parent = node.parent().map(|p| p.0), op = name, "setup");
    Ok(())
}

/// Visits `node` in the direction of `cx`. A node is `Optimized` once its backward visit ran.
pub fn optimize(cx: &mut OptimizeContext<'_>, node: &mut Node) -> GraphResult<OptimizeDecision> {
    let op = descriptor(cx, node);
    let name = op.as_ref().map_or(node.kind().name(), |op| op.name());
    let direction = cx.direction();
    transition(
        node,
        name,
        &[NodeState::ShapeResolved, NodeState::Optimized],
        NodeState::Optimized,
    )?;
    let decision = match op {
        Some(op) => op.optimize(cx, node).map_err(|err| {
            report(cx, node, Phase::Optimize, name, err.to_string());
            match err {
                OpError::Composition(source) => GraphError::CompositionFailed {
                    parent: node.uid(),
                    op: name,
                    source,
                },
                other => GraphError::OptimizeFailed {
                    node: node.uid(),
                    op: name,
                    direction,
                    reason: other.to_string(),
                },
            }
        })?,
        None => OptimizeDecision::Skip,
    };
    if direction == OptimizeDirection::Backward {
        node.state = NodeState::Optimized;
    }
    cx.record_visit(OptimizeVisit {
        node: node.uid(),
        parent: node.parent(),
        direction,
        decision,
    });
    tracing::trace!(node = node.uid().0, op = name, %direction, ?decision, "optimize");
    Ok(decision)
}

/// Runs `compute`. Recomputing a computed node first releases its kernel nodes.
pub fn compute(cx: &mut GraphContext, node: &mut Node) -> GraphResult<()> {
    let op = require(cx, node)?;
    transition(
        node,
        op.name(),
        &[
            NodeState::ShapeResolved,
            NodeState::Optimized,
            NodeState::Computed,
        ],
        NodeState::Computed,
    )?;
    if node.state == NodeState::Computed {
        cx.release_kernels(node).map_err(|source| GraphError::Driver {
            node: node.uid(),
            op: op.name(),
            source,
        })?;
    }
    op.compute(cx, node)
        .map_err(|err| fail(cx, node, Phase::Compute, op.name(), err))?;
    node.state = NodeState::Computed;
    tracing::debug!(
        node = node.uid().0,
        parent = node.parent().map(|p| p.0),
        op = op.name(),
        kernels = node.kernel_nodes().len(),
        "compute"
    );
    Ok(())
}

/// Releases everything the node holds: operator resources, kernel nodes, local data, then
/// the internal workspace. Safe after any prefix of the lifecycle; every resource is
/// released even when an earlier release fails, and the first failure is returned.
pub fn deinit(cx: &mut GraphContext, node: &mut Node) -> GraphResult<Released> {
    let op = descriptor(cx, node);
    let name = op.as_ref().map_or(node.kind().name(), |op| op.name());
    if node.state == NodeState::Deinitialized {
        return Err(GraphError::InvalidTransition {
            node: node.uid(),
            op: name,
            from: node.state,
            to: NodeState::Deinitialized,
        });
    }

    let mut first_error = None;
    if let Some(op) = &op {
        if let Err(err) = op.deinit(cx, node) {
            first_error = Some(fail(cx, node, Phase::Deinit, name, err));
        }
    }

    let mut released = Released::default();
    match cx.release_kernels(node) {
        Ok(count) => released.kernel_nodes = count,
        Err(source) => {
            report(cx, node, Phase::Deinit, name, source.to_string());
            first_error.get_or_insert(GraphError::Driver {
                node: node.uid(),
                op: name,
                source,
            });
        }
    }
    released.local = node.take_local().is_some();
    if node.workspace.is_some() {
        match internal::deinit_node_wksp(cx, node) {
            Ok(teardown) => {
                released.children = teardown.nodes;
                released.tensors = teardown.tensors;
            }
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }
    node.state = NodeState::Deinitialized;
    tracing::debug!(
        node = node.uid().0,
        parent = node.parent().map(|p| p.0),
        op = name,
        released = released.total(),
        "deinit"
    );
    match first_error {
        Some(err) => Err(err),
        None => Ok(released),
    }
}
