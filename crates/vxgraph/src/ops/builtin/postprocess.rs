use crate::error::{OpError, OpResult};
use crate::graph::{GraphContext, OptimizeContext, OptimizeDecision};
use crate::internal;
use crate::node::{Node, NodeUid};
use crate::ops::constraint::{io, IoType, OpConstraint};
use crate::ops::{Arity, OpKind, Operator};
use crate::tensor::{DType, TensorId};

use super::{
    input_ids, output_ids, BoxDecodeParams, ConcatParams, ReshapeParams, StridedSliceParams,
    BOX_DECODE, CONCAT, RESHAPE, SIGMOID, STRIDED_SLICE,
};

static POSTPROCESS_IO: &[&[IoType]] = &[
    &[io(DType::F32), io(DType::F32)],
    &[io(DType::F16), io(DType::F16)],
];

const CONSTRAINT: OpConstraint = OpConstraint::new(1, 1, POSTPROCESS_IO);

/// Number of box coordinates at the start of every detection row.
pub const BOX_COORDS: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PostprocessParams {
    pub box_decode: BoxDecodeParams,
}

/// Detection head post-processing over `[batch, anchors, 4 + classes]` rows.
///
/// Box coordinates are decoded, class logits pass through a sigmoid, and the result is
/// concatenated back and flattened to `[batch, anchors * (4 + classes)]`. Built entirely
/// from internal nodes.
pub struct Postprocess;

impl Postprocess {
    fn slice(
        cx: &mut GraphContext,
        node: &mut Node,
        input: TensorId,
        output: TensorId,
        rank: usize,
        begin: i32,
        end: Option<i32>,
    ) -> OpResult<()> {
        let last = rank - 1;
        let mut params = StridedSliceParams {
            begin: vec![0; rank],
            end: vec![0; rank],
            stride: vec![1; rank],
            begin_mask: 0,
            end_mask: (1u32 << last) - 1,
            shrink_axis_mask: 0,
        };
        params.begin[last] = begin;
        match end {
            Some(end) => params.end[last] = end,
            None => params.end_mask |= 1 << last,
        }
        let uid = internal::new_node(cx, node, STRIDED_SLICE, 1, 1)?;
        let child = internal::child_mut(node, uid)?;
        child.set_input(0, Some(input));
        child.set_output(0, Some(output));
        child.set_params(params);
        internal::setup_node(cx, node, uid)?;
        Ok(())
    }

    fn unary(
        cx: &mut GraphContext,
        node: &mut Node,
        kind: OpKind,
        input: TensorId,
        output: TensorId,
    ) -> OpResult<NodeUid> {
        let uid = internal::new_node(cx, node, kind, 1, 1)?;
        let child = internal::child_mut(node, uid)?;
        child.set_input(0, Some(input));
        child.set_output(0, Some(output));
        Ok(uid)
    }
}

impl Operator for Postprocess {
    fn name(&self) -> &'static str {
        "POSTPROCESS"
    }

    fn arity(&self) -> Arity {
        Arity::fixed(1, 1)
    }

    fn init(&self, node: &mut Node) -> OpResult<()> {
        node.set_params(PostprocessParams::default());
        Ok(())
    }

    fn check(&self, cx: &GraphContext, node: &Node) -> bool {
        CONSTRAINT.validate(cx, node)
    }

    fn setup(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        let input = input_ids(node)?[0];
        let output = output_ids(node)?[0];
        let shape = cx.shape_of(input)?;
        let rank = shape.rank();
        if rank < 2 || shape.dims()[rank - 1] <= BOX_COORDS {
            return Err(OpError::invalid(format!(
                "postprocess expects [.., anchors, {BOX_COORDS} + classes] rows, got {shape}"
            )));
        }
        let params: PostprocessParams = node.params.get_or_default();
        let (dtype, quant) = {
            let desc = cx.tensor(input)?;
            (desc.dtype(), desc.quant().clone())
        };

        internal::init_node_wksp(node);
        let intermediate = || internal::init_tensor_attr(dtype, &quant, true);
        let boxes = internal::new_tensor(cx, node, intermediate())?;
        let decoded = internal::new_tensor(cx, node, intermediate())?;
        let logits = internal::new_tensor(cx, node, intermediate())?;
        let scores = internal::new_tensor(cx, node, intermediate())?;
        let joined = internal::new_tensor(cx, node, intermediate())?;

        Self::slice(cx, node, input, boxes, rank, 0, Some(BOX_COORDS as i32))?;
        let decode = Self::unary(cx, node, BOX_DECODE, boxes, decoded)?;
        internal::child_mut(node, decode)?.set_params(params.box_decode);
        internal::setup_node(cx, node, decode)?;

        Self::slice(cx, node, input, logits, rank, BOX_COORDS as i32, None)?;
        let sigmoid = Self::unary(cx, node, SIGMOID, logits, scores)?;
        internal::setup_node(cx, node, sigmoid)?;

        let concat = internal::new_node(cx, node, CONCAT, 2, 1)?;
        {
            let child = internal::child_mut(node, concat)?;
            child.set_input(0, Some(decoded));
            child.set_input(1, Some(scores));
            child.set_output(0, Some(joined));
            child.set_params(ConcatParams {
                axis: (rank - 1) as u32,
            });
        }
        internal::setup_node(cx, node, concat)?;

        let reshape = Self::unary(cx, node, RESHAPE, joined, output)?;
        let mut dims: Vec<i32> = shape.dims()[..rank - 2].iter().map(|&d| d as i32).collect();
        dims.push(-1);
        internal::child_mut(node, reshape)?.set_params(ReshapeParams::new(dims));
        internal::setup_node(cx, node, reshape)?;
        Ok(())
    }

    fn optimize(
        &self,
        cx: &mut OptimizeContext<'_>,
        node: &mut Node,
    ) -> OpResult<OptimizeDecision> {
        let pass = internal::optimize_node(cx, node)?;
        Ok(match pass.aliased {
            0 => OptimizeDecision::Skip,
            views => OptimizeDecision::Aliased(views),
        })
    }

    fn compute(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        internal::compute_node(cx, node)?;
        Ok(())
    }
}
