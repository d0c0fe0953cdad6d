use crate::error::{OpError, OpResult};
use crate::graph::GraphContext;
use crate::kernel::{
    BindRequest, BoundOperand, KernelError, KernelParams, ScalarValue, GPU_TENSOR_MAX_WIDTH,
};
use crate::node::Node;
use crate::ops::constraint::{io, qio, IoType, OpConstraint};
use crate::ops::{Arity, Operator};
use crate::tensor::{DType, QuantKind, Shape};

use super::{input_ids, operands, output_ids, resolve_output};

static ONE_HOT_IO: &[&[IoType]] = &[
    &[io(DType::F32), io(DType::F32)],
    &[io(DType::F16), io(DType::F16)],
    &[io(DType::I32), io(DType::I32)],
    &[io(DType::I32), io(DType::F32)],
    &[io(DType::I32), io(DType::F16)],
    &[io(DType::I32), io(DType::U8)],
    &[io(DType::I32), io(DType::I8)],
    &[io(DType::I32), io(DType::I16)],
    &[io(DType::U8), io(DType::U8)],
    &[qio(DType::U8, QuantKind::Affine), qio(DType::U8, QuantKind::Affine)],
    &[qio(DType::I8, QuantKind::Dfp), qio(DType::I8, QuantKind::Dfp)],
];

const CONSTRAINT: OpConstraint = OpConstraint::new(1, 1, ONE_HOT_IO);

/// One-hot expansion of integer indices into a new `depth`-sized axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OneHotParams {
    pub depth: u32,
    pub on_value: f32,
    pub off_value: f32,
    /// Position of the new axis in the output; `-1` appends it.
    pub axis: i32,
}

impl Default for OneHotParams {
    fn default() -> Self {
        OneHotParams {
            depth: 1,
            on_value: 1.0,
            off_value: 0.0,
            axis: -1,
        }
    }
}

impl OneHotParams {
    fn resolved_axis(&self, input_rank: usize) -> OpResult<usize> {
        let rank = input_rank as i32 + 1;
        let axis = if self.axis < 0 { self.axis + rank } else { self.axis };
        if !(0..rank).contains(&axis) {
            return Err(OpError::invalid(format!(
                "one_hot axis {} is out of range for output rank {rank}",
                self.axis
            )));
        }
        Ok(axis as usize)
    }
}

/// Splits `count` elements into `[outer, inner]` with `inner` below the GPU width limit.
fn collapse_for_gpu(count: usize) -> Option<[usize; 2]> {
    let inner = (1..GPU_TENSOR_MAX_WIDTH.min(count + 1))
        .rev()
        .find(|candidate| count % candidate == 0)?;
    let outer = count / inner;
    (outer < GPU_TENSOR_MAX_WIDTH).then_some([outer, inner])
}

pub struct OneHot;

impl Operator for OneHot {
    fn name(&self) -> &'static str {
        "ONE_HOT"
    }

    fn arity(&self) -> Arity {
        Arity::fixed(1, 1)
    }

    fn init(&self, node: &mut Node) -> OpResult<()> {
        node.set_params(OneHotParams::default());
        Ok(())
    }

    fn check(&self, cx: &GraphContext, node: &Node) -> bool {
        CONSTRAINT.validate(cx, node)
    }

    fn setup(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        let params: OneHotParams = node.params.get_or_default();
        if params.depth == 0 {
            return Err(OpError::invalid("one_hot depth must be positive"));
        }
        let input = cx.shape_of(input_ids(node)?[0])?;
        let axis = params.resolved_axis(input.rank())?;
        let mut dims = input.dims().to_vec();
        dims.insert(axis, params.depth as usize);
        resolve_output(cx, output_ids(node)?[0], Shape::new(&dims)?)
    }

    /// A shape the selected backend cannot address is retried once with the indices
    /// collapsed to two axes, when the new axis is innermost.
    fn compute(&self, cx: &mut GraphContext, node: &mut Node) -> OpResult<()> {
        let p: OneHotParams = node.params.get_or_default();
        let inputs = operands(cx, &input_ids(node)?)?;
        let outputs = operands(cx, &output_ids(node)?)?;
        let axis = p.resolved_axis(inputs[0].shape.rank())?;
        let kernel_params = KernelParams::new()
            .with("depth", ScalarValue::I32(p.depth as i32))
            .with("on_value", ScalarValue::F32(p.on_value))
            .with("off_value", ScalarValue::F32(p.off_value))
            .with("axis", ScalarValue::I32(axis as i32));
        let request = BindRequest {
            name: "one_hot",
            inputs: &inputs,
            outputs: &outputs,
            params: &kernel_params,
        };
        let kernel = match cx.select_kernel(&request) {
            Ok(kernel) => kernel,
            Err(KernelError::ShapeRejected { backend, dims, .. })
                if axis == inputs[0].shape.rank() =>
            {
                let count = inputs[0].shape.num_elements();
                let Some([outer, inner]) = collapse_for_gpu(count) else {
                    return Err(KernelError::ShapeRejected {
                        name: "one_hot".into(),
                        backend,
                        dims,
                    }
                    .into());
                };
                tracing::warn!(
                    node = node.uid().0,
                    %backend,
                    ?dims,
                    outer,
                    inner,
                    "one_hot shape rejected, retrying collapsed"
                );
                let reshaped = |operand: &BoundOperand, dims: &[usize]| -> OpResult<BoundOperand> {
                    Ok(BoundOperand {
                        shape: Shape::new(dims)?,
                        ..operand.clone()
                    })
                };
                let inputs = [reshaped(&inputs[0], &[outer, inner])?];
                let outputs = [reshaped(&outputs[0], &[outer, inner, p.depth as usize])?];
                let kernel_params = kernel_params.clone().with("axis", ScalarValue::I32(2));
                cx.select_kernel(&BindRequest {
                    name: "one_hot",
                    inputs: &inputs,
                    outputs: &outputs,
                    params: &kernel_params,
                })?
            }
            Err(err) => return Err(err.into()),
        };
        cx.attach_kernel(node, kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_resolution() {
        let p = OneHotParams::default();
        assert_eq!(p.resolved_axis(2).unwrap(), 2);
        let p = OneHotParams { axis: 0, ..p };
        assert_eq!(p.resolved_axis(2).unwrap(), 0);
        let p = OneHotParams { axis: 4, ..p };
        assert!(p.resolved_axis(2).is_err());
    }

    #[test]
    fn collapse_keeps_element_count() {
        assert_eq!(collapse_for_gpu(70000), Some([2, 35000]));
        assert_eq!(collapse_for_gpu(12), Some([1, 12]));
        let [outer, inner] = collapse_for_gpu(65536 * 3).unwrap();
        assert_eq!(outer * inner, 65536 * 3);
        assert!(inner < GPU_TENSOR_MAX_WIDTH);
    }
}
