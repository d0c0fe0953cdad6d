//! Internal-node composer.
//!
//! Operators without a direct kernel build an equivalent sub-graph of child nodes inside
//! their node's [`InternalWorkspace`]. Children and intermediate tensors are owned by the
//! workspace: they are set up eagerly while the parent sets up, optimized and computed when
//! the parent is, and torn down in reverse creation order when the parent is deinitialized.

use crate::error::{GraphError, GraphResult, IoSide, OpError};
use crate::graph::{GraphContext, OptimizeContext, OptimizeDirection, PassResult};
use crate::node::{Node, NodeAttr, NodeUid};
use crate::ops::{dispatch, IoCount, OpKind};
use crate::tensor::{convert, DType, QuantKind, Quantization, Shape, TensorAttr, TensorId};

/// Children and tensors created by one composite node.
#[derive(Debug)]
pub struct InternalWorkspace {
    nodes: Vec<Node>,
    tensors: Vec<TensorId>,
    next_uid: u32,
}

impl Default for InternalWorkspace {
    fn default() -> Self {
        InternalWorkspace {
            nodes: Vec::new(),
            tensors: Vec::new(),
            next_uid: 1,
        }
    }
}

impl InternalWorkspace {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn tensors(&self) -> &[TensorId] {
        &self.tensors
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn node_by_uid(&self, uid: NodeUid) -> Option<&Node> {
        self.nodes.iter().find(|node| node.uid() == uid)
    }

    pub fn node_by_uid_mut(&mut self, uid: NodeUid) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|node| node.uid() == uid)
    }
}

impl Drop for InternalWorkspace {
    // Children go newest first even when the workspace is dropped without a deinit.
    fn drop(&mut self) {
        while let Some(node) = self.nodes.pop() {
            drop(node);
        }
    }
}

/// What a workspace teardown released, in release order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkspaceTeardown {
    pub nodes: Vec<NodeUid>,
    pub tensors: Vec<TensorId>,
}

fn workspace(node: &Node) -> GraphResult<&InternalWorkspace> {
    node.workspace.as_ref().ok_or_else(|| GraphError::NoWorkspace {
        node: node.uid(),
        op: node.kind().name(),
    })
}

fn workspace_mut(node: &mut Node) -> GraphResult<&mut InternalWorkspace> {
    let uid = node.uid();
    let op = node.kind().name();
    node.workspace
        .as_mut()
        .ok_or(GraphError::NoWorkspace { node: uid, op })
}

/// Gives `node` an empty workspace unless it already has one.
pub fn init_node_wksp(node: &mut Node) {
    node.workspace.get_or_insert_with(InternalWorkspace::default);
}

/// Attributes for an intermediate tensor whose shape the consuming child resolves.
///
/// Unquantized non-float types are carried as F16.
pub fn init_tensor_attr(dtype: DType, quant: &Quantization, use_virtual: bool) -> TensorAttr {
    let (dtype, quant) = match (quant.kind(), dtype) {
        (QuantKind::None, DType::F16 | DType::F32 | DType::BF16) => (dtype, Quantization::None),
        (QuantKind::None, _) => (DType::F16, Quantization::None),
        _ => (dtype, quant.clone()),
    };
    TensorAttr {
        shape: None,
        dtype,
        quant,
        is_virtual: use_virtual,
        is_const: false,
    }
}

/// Adds a virtual tensor owned by `node`'s workspace.
pub fn new_tensor(
    cx: &mut GraphContext,
    node: &mut Node,
    attr: TensorAttr,
) -> GraphResult<TensorId> {
    let attr = TensorAttr {
        is_virtual: true,
        is_const: false,
        ..attr
    };
    add_tensor(cx, node, attr, None)
}

/// Adds a const tensor owned by `node`'s workspace, every element set to `fill`.
pub fn new_const_tensor(
    cx: &mut GraphContext,
    node: &mut Node,
    attr: TensorAttr,
    fill: f32,
) -> GraphResult<TensorId> {
    let shape = attr.shape.clone().ok_or_else(|| GraphError::SetupFailed {
        node: node.uid(),
        op: node.kind().name(),
        reason: "const internal tensor needs a shape".into(),
    })?;
    let data = convert::filled(attr.dtype, &attr.quant, fill, shape.num_elements());
    let attr = TensorAttr {
        is_virtual: false,
        is_const: true,
        ..attr
    };
    add_tensor(cx, node, attr, Some(data))
}

fn add_tensor(
    cx: &mut GraphContext,
    node: &mut Node,
    attr: TensorAttr,
    data: Option<Vec<u8>>,
) -> GraphResult<TensorId> {
    workspace(node)?;
    let id = cx.insert_tensor(attr);
    let desc = cx.tensors_mut().get_mut(id)?;
    desc.owner = Some(node.uid());
    desc.data = data;
    workspace_mut(node)?.tensors.push(id);
    tracing::trace!(parent = node.uid().0, tensor = %id, "internal tensor created");
    Ok(id)
}

/// Zero bias for a convolution or fully connected child.
///
/// Float weights get an F32 bias. Quantized weights get an I32 bias whose scale is the
/// product of the input and weight scales (or whose `fl` is their sum for DFP).
pub fn create_zero_bias_tensor(
    cx: &mut GraphContext,
    node: &mut Node,
    input: &TensorAttr,
    weight: &TensorAttr,
    bias_len: usize,
) -> GraphResult<TensorId> {
    let mismatch = || GraphError::SetupFailed {
        node: node.uid(),
        op: node.kind().name(),
        reason: format!(
            "input quantization {:?} does not match weight quantization {:?}",
            input.quant.kind(),
            weight.quant.kind()
        ),
    };
    let (dtype, quant) = match (&input.quant, &weight.quant) {
        (_, Quantization::None) => (DType::F32, Quantization::None),
        (Quantization::Dfp { fl: input_fl }, Quantization::Dfp { fl: weight_fl }) => (
            DType::I32,
            Quantization::Dfp {
                fl: input_fl.saturating_add(*weight_fl),
            },
        ),
        (
            Quantization::Affine { scale: input_scale, .. }
            | Quantization::AffineSymmetric { scale: input_scale },
            Quantization::Affine { scale, .. } | Quantization::AffineSymmetric { scale },
        ) => (
            DType::I32,
            Quantization::Affine {
                scale: input_scale * scale,
                zero_point: 0,
            },
        ),
        (
            Quantization::Affine { scale: input_scale, .. }
            | Quantization::AffineSymmetric { scale: input_scale },
            Quantization::PerChannel { scales, axis, .. },
        ) => (
            DType::I32,
            Quantization::PerChannel {
                scales: scales.iter().map(|scale| scale * input_scale).collect(),
                zero_points: vec![0; scales.len()],
                axis: *axis,
            },
        ),
        _ => return Err(mismatch()),
    };
    let shape = Shape::new([bias_len.max(1)])?;
    let attr = TensorAttr::new(dtype).with_shape(shape).with_quant(quant);
    new_const_tensor(cx, node, attr, 0.0)
}

/// Creates and initializes a child of `node`. Children inherit the parent's preload policy
/// and constraint-check toggle.
pub fn new_node(
    cx: &mut GraphContext,
    node: &mut Node,
    kind: OpKind,
    input_count: usize,
    output_count: usize,
) -> GraphResult<NodeUid> {
    let op = cx
        .ops()
        .get_proc(kind)
        .ok_or_else(|| GraphError::UnregisteredOp {
            op: kind.to_string(),
        })?;
    let arity = op.arity();
    let parent = node.uid();
    let attr = NodeAttr {
        preload: node.attr.preload,
        enable_op_constraint_check: node.attr.enable_op_constraint_check,
    };
    let ws = workspace_mut(node)?;
    let uid = NodeUid(ws.next_uid);
    let inputs = resolve_count(arity.inputs, input_count, uid, op.name(), IoSide::Inputs)?;
    let outputs =
        resolve_count(arity.outputs, output_count, uid, op.name(), IoSide::Outputs)?;
    ws.next_uid += 1;
    ws.nodes
        .push(Node::new(uid, kind, inputs, outputs, attr).with_parent(parent));
    let child = ws
        .nodes
        .last_mut()
        .ok_or(GraphError::UnknownNode(uid))?;
    dispatch::init(cx, child)?;
    tracing::trace!(parent = parent.0, sub_uid = uid.0, op = op.name(), "internal node created");
    Ok(uid)
}

pub(crate) fn resolve_count(
    count: IoCount,
    requested: usize,
    node: NodeUid,
    op: &'static str,
    side: IoSide,
) -> GraphResult<usize> {
    count
        .resolve(requested)
        .ok_or_else(|| GraphError::ArityMismatch {
            node,
            op,
            side,
            expected: count.to_string(),
            actual: requested,
        })
}

/// Mutable access to a child, for wiring its tensors and parameters.
pub fn child_mut(node: &mut Node, uid: NodeUid) -> GraphResult<&mut Node> {
    workspace_mut(node)?
        .node_by_uid_mut(uid)
        .ok_or(GraphError::UnknownNode(uid))
}

/// Child of `node` with workspace-local `uid`.
pub fn node_by_uid(node: &Node, uid: NodeUid) -> Option<&Node> {
    node.workspace.as_ref()?.node_by_uid(uid)
}

/// Checks and sets up one child right away.
pub fn setup_node(cx: &mut GraphContext, node: &mut Node, uid: NodeUid) -> GraphResult<()> {
    let child = child_mut(node, uid)?;
    dispatch::check(cx, child)?;
    dispatch::setup(cx, child)
}

/// Computes every child in creation order, creating missing operand buffers first.
pub fn compute_node(cx: &mut GraphContext, node: &mut Node) -> GraphResult<()> {
    let ws = workspace_mut(node)?;
    for child in ws.nodes.iter_mut() {
        let operands: Vec<TensorId> = child
            .inputs()
            .iter()
            .chain(child.outputs())
            .flatten()
            .copied()
            .collect();
        for id in operands {
            cx.ensure_buffer(id).map_err(|err| match err {
                OpError::Driver(source) => GraphError::Driver {
                    node: child.uid(),
                    op: child.kind().name(),
                    source,
                },
                other => GraphError::ComputeFailed {
                    node: child.uid(),
                    op: child.kind().name(),
                    reason: other.to_string(),
                },
            })?;
        }
        dispatch::compute(cx, child)?;
    }
    Ok(())
}

/// Visits every child: creation order forward, reverse creation order backward.
pub fn optimize_node(cx: &mut OptimizeContext<'_>, node: &mut Node) -> GraphResult<PassResult> {
    let ws = workspace_mut(node)?;
    let mut pass = PassResult::default();
    match cx.direction() {
        OptimizeDirection::Forward => {
            for child in ws.nodes.iter_mut() {
                pass.record(dispatch::optimize(cx, child)?);
            }
        }
        OptimizeDirection::Backward => {
            for child in ws.nodes.iter_mut().rev() {
                pass.record(dispatch::optimize(cx, child)?);
            }
        }
    }
    Ok(pass)
}

/// Deinitializes every child newest first, then removes the tensors newest first, then drops
/// the workspace. Every resource is released even if one release fails.
pub fn deinit_node_wksp(cx: &mut GraphContext, node: &mut Node) -> GraphResult<WorkspaceTeardown> {
    let Some(mut ws) = node.workspace.take() else {
        return Ok(WorkspaceTeardown::default());
    };
    let mut teardown = WorkspaceTeardown::default();
    let mut first_error = None;
    while let Some(mut child) = ws.nodes.pop() {
        if let Err(err) = dispatch::deinit(cx, &mut child) {
            first_error.get_or_insert(err);
        }
        teardown.nodes.push(child.uid());
    }
    while let Some(id) = ws.tensors.pop() {
        if let Err(source) = cx.release_tensor(id) {
            first_error.get_or_insert(GraphError::Driver {
                node: node.uid(),
                op: node.kind().name(),
                source,
            });
        }
        teardown.tensors.push(id);
    }
    tracing::trace!(
        parent = node.uid().0,
        nodes = teardown.nodes.len(),
        tensors = teardown.tensors.len(),
        "internal workspace released"
    );
    match first_error {
        Some(err) => Err(err),
        None => Ok(teardown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphState;
    use crate::node::NodeState;
    use crate::ops::builtin::{ADD, POSTPROCESS};
    use crate::testing;

    fn detection_graph(
        output_shape: Option<&[usize]>,
    ) -> (
        crate::graph::Graph,
        std::sync::Arc<testing::CountingDriver>,
        NodeUid,
        TensorId,
    ) {
        let (mut g, driver) = testing::graph();
        let input = g
            .add_tensor(TensorAttr::new(DType::F32).with_shape(Shape::new([1, 3, 6]).unwrap()))
            .unwrap();
        let mut out_attr = TensorAttr::new(DType::F32);
        if let Some(dims) = output_shape {
            out_attr = out_attr.with_shape(Shape::new(dims).unwrap());
        }
        let output = g.add_tensor(out_attr).unwrap();
        let node = g.new_node(POSTPROCESS, 1, 1).unwrap();
        g.set_node_io(node, &[input], &[output]).unwrap();
        (g, driver, node, output)
    }

    #[test]
    fn unquantized_integers_are_carried_as_f16() {
        let attr = init_tensor_attr(DType::I32, &Quantization::None, true);
        assert_eq!(attr.dtype, DType::F16);
        assert!(attr.is_virtual);
        assert!(attr.shape.is_none());
        assert_eq!(init_tensor_attr(DType::BF16, &Quantization::None, false).dtype, DType::BF16);
        let quant = Quantization::Affine {
            scale: 0.5,
            zero_point: 3,
        };
        let attr = init_tensor_attr(DType::U8, &quant, true);
        assert_eq!(attr.dtype, DType::U8);
        assert_eq!(attr.quant, quant);
    }

    #[test]
    fn composite_tears_down_in_reverse_creation_order() {
        let (mut g, driver, node, output) = detection_graph(None);
        g.setup().unwrap();

        let parent = g.node(node).unwrap();
        let ws = parent.workspace().unwrap();
        assert_eq!(ws.node_count(), 6);
        assert_eq!(ws.tensor_count(), 5);
        let uids: Vec<u32> = ws.nodes().iter().map(|child| child.uid().0).collect();
        assert_eq!(uids, vec![1, 2, 3, 4, 5, 6]);
        assert!(ws.nodes().iter().all(|child| child.parent() == Some(node)));
        let created: Vec<TensorId> = ws.tensors().to_vec();
        assert_eq!(
            g.tensor(output).unwrap().shape().map(|s| s.dims().to_vec()),
            Some(vec![1, 18])
        );
        assert_eq!(driver.live_kernels().len(), 5);
        g.run().unwrap();

        let released = g.release().unwrap();
        assert_eq!(released.len(), 1);
        let expected_children: Vec<NodeUid> = (1..=6).rev().map(NodeUid).collect();
        assert_eq!(released[0].children, expected_children);
        let expected_tensors: Vec<TensorId> = created.into_iter().rev().collect();
        assert_eq!(released[0].tensors, expected_tensors);
        assert_eq!(driver.live_buffers(), 0);
        assert!(driver.live_kernels().is_empty());
    }

    #[test]
    fn child_failure_fails_parent_and_releases_children() {
        let (mut g, driver, node, _) = detection_graph(Some(&[1, 5]));
        let err = g.setup().unwrap_err();
        match &err {
            GraphError::CompositionFailed { parent, op, source } => {
                assert_eq!(*parent, node);
                assert_eq!(*op, "POSTPROCESS");
                assert!(matches!(
                    **source,
                    GraphError::SetupFailed { node: NodeUid(6), op: "RESHAPE", .. }
                ));
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(g.state(), GraphState::Failed);
        let parent = g.node(node).unwrap();
        assert_eq!(parent.state(), NodeState::Deinitialized);
        assert!(parent.workspace().is_none());
        assert_eq!(driver.live_buffers(), 0);
    }

    #[test]
    fn child_arity_is_checked() {
        let (mut cx, _driver) = testing::context();
        let mut node = Node::new(NodeUid(0), POSTPROCESS, 1, 1, NodeAttr::default());
        assert!(matches!(
            new_node(&mut cx, &mut node, ADD, 2, 1),
            Err(GraphError::NoWorkspace { .. })
        ));
        init_node_wksp(&mut node);
        let err = new_node(&mut cx, &mut node, ADD, 3, 1).unwrap_err();
        assert!(matches!(
            err,
            GraphError::ArityMismatch {
                side: IoSide::Inputs,
                actual: 3,
                ..
            }
        ));
        let uid = new_node(&mut cx, &mut node, ADD, 0, 0).unwrap();
        assert_eq!(uid, NodeUid(1));
        let child = node_by_uid(&node, uid).unwrap();
        assert_eq!(child.state(), NodeState::Initialized);
        assert_eq!(child.inputs().len(), 2);
    }

    #[test]
    fn zero_bias_follows_weight_quantization() {
        let (mut cx, _driver) = testing::context();
        let mut node = Node::new(NodeUid(0), POSTPROCESS, 1, 1, NodeAttr::default());
        init_node_wksp(&mut node);

        let input = TensorAttr::new(DType::U8).with_quant(Quantization::Affine {
            scale: 0.5,
            zero_point: 128,
        });
        let weight = TensorAttr::new(DType::U8).with_quant(Quantization::Affine {
            scale: 0.25,
            zero_point: 120,
        });
        let bias = create_zero_bias_tensor(&mut cx, &mut node, &input, &weight, 8).unwrap();
        let desc = cx.tensor(bias).unwrap();
        assert_eq!(desc.dtype(), DType::I32);
        assert_eq!(
            *desc.quant(),
            Quantization::Affine {
                scale: 0.125,
                zero_point: 0
            }
        );
        assert!(desc.is_const());
        assert_eq!(desc.owner(), Some(NodeUid(0)));
        assert_eq!(desc.const_data().map(<[u8]>::len), Some(32));
        assert!(desc.const_data().unwrap().iter().all(|b| *b == 0));

        let dfp = |fl| TensorAttr::new(DType::I8).with_quant(Quantization::Dfp { fl });
        let bias = create_zero_bias_tensor(&mut cx, &mut node, &dfp(3), &dfp(4), 2).unwrap();
        assert_eq!(*cx.tensor(bias).unwrap().quant(), Quantization::Dfp { fl: 7 });

        let float = TensorAttr::new(DType::F32);
        let bias = create_zero_bias_tensor(&mut cx, &mut node, &float, &float, 2).unwrap();
        assert_eq!(cx.tensor(bias).unwrap().dtype(), DType::F32);

        assert!(create_zero_bias_tensor(&mut cx, &mut node, &dfp(3), &weight, 2).is_err());
        assert_eq!(node.workspace().unwrap().tensor_count(), 3);
    }
}
