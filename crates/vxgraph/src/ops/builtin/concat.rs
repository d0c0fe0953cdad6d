use crate::driver::ViewRegion;
use crate::error::{OpError, OpResult};
use crate::graph::{
    GraphContext, OptimizeContext, OptimizeDecision, OptimizeDirection, ViewPredicate,
};
use crate::internal;
use crate::kernel::{BindRequest, KernelParams, ScalarValue};
use crate::node::Node;
use crate::ops::{Arity, Operator};
use crate::tensor::{DType, Shape, TensorDescriptor, TensorId};

use super::{bind_copy, input_ids, operands, output_ids, resolve_output};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConcatParams {
    pub axis: u32,
}

/// Concatenation along the outermost populated axis: every input is one contiguous block of
/// the output, so inputs can be written straight into it.
pub struct HighestDimension {
    pub axis: usize,
}

impl ViewPredicate for HighestDimension {
    fn can_alias(&self, inputs: &[&TensorDescriptor], outputs: &[&TensorDescriptor]) -> bool {
        let Some(output) = outputs.first() else {
            return false;
        };
        let Some(dims) = output.shape().map(Shape::dims) else {
            return false;
        };
        let highest = self.axis == 0 || (self.axis == 1 && dims.first() == Some(&1));
        highest
            && inputs
                .iter()
                .all(|input| input.dtype() == output.dtype() && input.quant() == output.quant())
    }
}

/// Inputs that could not become views and are copied into the output instead.
#[derive(Debug, Default)]
struct ConcatPlan {
    copies: Vec<(TensorId, TensorId)>,
}

const CONCAT_DTYPES: &[DType] = &[
    DType::F32,
    DType::F16,
    DType::BF16,
    DType::I32,
    DType::I16,
    DType::I8,
    DType::U8,
];

pub struct Concat;

impl Concat {
    fn regions(
        cx: &GraphContext,
        inputs: &[TensorId],
        output: TensorId,
        axis: usize,
    ) -> OpResult<Vec<ViewRegion>> {
        let out = cx.shape_of(output)?;
        let mut offset = 0;
        let mut regions = Vec::with_capacity(inputs.len());
        for &input in inputs {
            let extent = cx.shape_of(input)?.dims()[axis];
            let mut start = vec![0; out.rank()];
            let mut end = out.dims().to_vec();
            start[axis] = offset;
            end[axis] = offset + extent;
            regions.push(ViewRegion::new(start, end));
            offset += extent;
        }
        Ok(regions)
    }
}

impl Operator for Concat {
    fn name(&self) -> &'static str {
        "CONCAT"
    }

    fn arity(&self) -> Arity {
        Arity::variadic_inputs(1)
    }

    fn init(&self, node: &mut Node) -> OpResult<()> {
        node.set_params(ConcatParams::default());
        Ok(())
    }

    /// Every operand shares one dtype, and quantized operands share one quantization family.
    fn check(&self, cx: &GraphContext, node: &Node) -> bool {
        let descs: Option<Vec<&TensorDescriptor>> = node
            .inputs()
            .iter()
            .chain(node.outputs())
            .map(|slot| slot.and_then(|id| cx.tensor(id).ok()))
            .collect();
        let Some(descs) = descs else {
            return false;
        };
        if !node.attr.enable_op_constraint_check {
            return true;
        }
        let Some(first) = descs.first() else {
            return false;
        };
        let quant = descs
            .iter()
            .map(|desc| desc.quant().kind())
            .find(|kind| *kind != crate::tensor::QuantKind::None);
        CONCAT_DTYPES.contains(&first.dtype())
            && descs.iter().all(|desc| {
                desc.dtype() == first.dtype()
                    && (desc.quant().kind() == crate::tensor::QuantKind::None
                        || Some(desc.quant().kind()) == quant)
            })
    }

    fn setup(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        let axis = node.params.get_or_default::<ConcatParams>().axis as usize;
        let inputs = input_ids(node)?;
        let first = cx.shape_of(inputs[0])?;
        if axis >= first.rank() {
            return Err(OpError::invalid(format!(
                "axis {axis} is out of range for rank {}",
                first.rank()
            )));
        }
        let mut dims = first.dims().to_vec();
        for &input in &inputs[1..] {
            let shape = cx.shape_of(input)?;
            let compatible = shape.rank() == first.rank()
                && shape
                    .dims()
                    .iter()
                    .zip(first.dims())
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !compatible {
                return Err(OpError::invalid(format!(
                    "cannot concatenate {shape} with {first} on axis {axis}"
                )));
            }
            dims[axis] += shape.dims()[axis];
        }
        resolve_output(cx, output_ids(node)?[0], Shape::new(&dims)?)
    }

    /// Backward: places unbacked inputs directly inside the output buffer.
    fn optimize(
        &self,
        cx: &mut OptimizeContext<'_>,
        node: &mut Node,
    ) -> OpResult<OptimizeDecision> {
        if cx.direction() == OptimizeDirection::Forward {
            return Ok(OptimizeDecision::Deferred);
        }
        let axis = node.params.get_or_default::<ConcatParams>().axis as usize;
        let inputs = input_ids(node)?;
        let output = output_ids(node)?[0];
        let can_alias = {
            let ins = inputs
                .iter()
                .map(|&id| cx.tensor(id))
                .collect::<Result<Vec<_>, _>>()?;
            HighestDimension { axis }.can_alias(&ins, &[cx.tensor(output)?])
        };
        if !can_alias {
            return Ok(OptimizeDecision::Skip);
        }

        let regions = Self::regions(cx, &inputs, output, axis)?;
        cx.ensure_buffer(output)?;
        let mut plan = ConcatPlan::default();
        let mut views = 0;
        for (&input, region) in inputs.iter().zip(regions) {
            let desc = cx.tensor(input)?;
            if desc.buffer().is_none() && !desc.is_const() {
                cx.create_view(output, input, region)?;
                views += 1;
            } else {
                internal::init_node_wksp(node);
                let attr = desc.attr().clone();
                let slot = internal::new_tensor(cx, node, attr)?;
                cx.create_view(output, slot, region)?;
                plan.copies.push((input, slot));
            }
        }
        tracing::debug!(
            node = node.uid().0,
            views,
            copies = plan.copies.len(),
            "concat aliased into output"
        );
        node.set_local(plan);
        Ok(OptimizeDecision::Aliased(views))
    }

    fn compute(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        if let Some(plan) = node.local::<ConcatPlan>() {
            let copies = plan.copies.clone();
            for (input, slot) in copies {
                bind_copy(cx, node, input, slot)?;
            }
            return Ok(());
        }
        let inputs = operands(cx, &input_ids(node)?)?;
        let outputs = operands(cx, &output_ids(node)?)?;
        let axis = node.params.get_or_default::<ConcatParams>().axis;
        let params = KernelParams::new().with("axis", ScalarValue::I32(axis as i32));
        let request = BindRequest {
            name: "concat",
            inputs: &inputs,
            outputs: &outputs,
            params: &params,
        };
        cx.bind_kernel(node, &request)
    }
}
