use crate::error::{OpError, OpResult};
use crate::graph::{
    GraphContext, OptimizeContext, OptimizeDecision, OptimizeDirection, ViewPredicate,
};
use crate::node::Node;
use crate::ops::{Arity, Operator};
use crate::tensor::{Shape, TensorDescriptor, ViewLink};

use super::{bind_copy, input_ids, output_ids, resolve_output};

/// Target dimensions. One entry may be `-1` and is inferred; `0` keeps the input's extent
/// on that axis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReshapeParams {
    pub dims: Vec<i32>,
}

impl ReshapeParams {
    pub fn new(dims: impl Into<Vec<i32>>) -> Self {
        ReshapeParams { dims: dims.into() }
    }

    pub(crate) fn resolve(&self, input: &Shape) -> OpResult<Shape> {
        let total = input.num_elements();
        let mut inferred = None;
        let mut dims = Vec::with_capacity(self.dims.len());
        for (axis, &dim) in self.dims.iter().enumerate() {
            match dim {
                -1 if inferred.is_none() => {
                    inferred = Some(axis);
                    dims.push(1);
                }
                0 => dims.push(input.dim(axis).ok_or_else(|| {
                    OpError::invalid(format!("axis {axis} has no input extent to keep"))
                })?),
                dim if dim > 0 => dims.push(dim as usize),
                dim => return Err(OpError::invalid(format!("invalid reshape extent {dim}"))),
            }
        }
        let known: usize = dims.iter().product();
        if let Some(axis) = inferred {
            if known == 0 || total % known != 0 {
                return Err(OpError::invalid(format!(
                    "cannot infer axis {axis} of {:?} from {total} elements",
                    self.dims
                )));
            }
            dims[axis] = total / known;
        }
        let shape = Shape::new(&dims)?;
        if shape.num_elements() != total {
            return Err(OpError::invalid(format!(
                "cannot reshape {input} ({total} elements) to {shape}"
            )));
        }
        Ok(shape)
    }
}

/// Aliasing is legal when both sides hold the same bytes in the same order.
pub struct SameElementCount;

impl ViewPredicate for SameElementCount {
    fn can_alias(&self, inputs: &[&TensorDescriptor], outputs: &[&TensorDescriptor]) -> bool {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first()) else {
            return false;
        };
        input.dtype() == output.dtype()
            && input.quant() == output.quant()
            && input.byte_size().is_some()
            && input.byte_size() == output.byte_size()
    }
}

fn aliased(input: &TensorDescriptor, output: &TensorDescriptor) -> bool {
    let linked = |desc: &TensorDescriptor, parent| {
        matches!(desc.view_of(), Some(ViewLink::Reshape { parent: p }) if *p == parent)
    };
    linked(output, input.id()) || linked(input, output.id())
}

pub struct Reshape;

impl Operator for Reshape {
    fn name(&self) -> &'static str {
        "RESHAPE"
    }

    fn arity(&self) -> Arity {
        Arity::fixed(1, 1)
    }

    fn check(&self, cx: &GraphContext, node: &Node) -> bool {
        let (Some(input), Some(output)) = (node.input(0), node.output(0)) else {
            return false;
        };
        match (cx.tensor(input), cx.tensor(output)) {
            (Ok(input), Ok(output)) => {
                !node.attr.enable_op_constraint_check || input.dtype() == output.dtype()
            }
            _ => false,
        }
    }

    fn setup(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        let input = cx.shape_of(input_ids(node)?[0])?;
        let output = output_ids(node)?[0];
        let shape = match node.params.get::<ReshapeParams>() {
            Some(params) => params.resolve(&input)?,
            None => cx.shape_of(output).map_err(|_| {
                OpError::invalid("reshape needs target dims or a declared output shape")
            })?,
        };
        if shape.num_elements() != input.num_elements() {
            return Err(OpError::invalid(format!(
                "cannot reshape {input} to {shape}"
            )));
        }
        resolve_output(cx, output, shape)
    }

    /// Backward: turns whichever side has no buffer yet into a view of the other.
    fn optimize(
        &self,
        cx: &mut OptimizeContext<'_>,
        node: &mut Node,
    ) -> OpResult<OptimizeDecision> {
        if cx.direction() == OptimizeDirection::Forward {
            return Ok(OptimizeDecision::Deferred);
        }
        let input = input_ids(node)?[0];
        let output = output_ids(node)?[0];
        let (in_desc, out_desc) = (cx.tensor(input)?, cx.tensor(output)?);
        if !SameElementCount.can_alias(&[in_desc], &[out_desc]) {
            return Ok(OptimizeDecision::Skip);
        }
        let buffers = (in_desc.buffer(), out_desc.buffer());
        let consts = (in_desc.is_const(), out_desc.is_const());
        match (buffers, consts) {
            ((_, None), (_, false)) => {
                cx.create_reshape_view(input, output)?;
                Ok(OptimizeDecision::Aliased(1))
            }
            ((None, Some(_)), (false, _)) => {
                cx.create_reshape_view(output, input)?;
                Ok(OptimizeDecision::Aliased(1))
            }
            _ => Ok(OptimizeDecision::Skip),
        }
    }

    fn compute(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        let input = input_ids(node)?[0];
        let output = output_ids(node)?[0];
        if aliased(cx.tensor(input)?, cx.tensor(output)?) {
            return Ok(());
        }
        bind_copy(cx, node, input, output)
    }
}
