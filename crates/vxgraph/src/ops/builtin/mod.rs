//! Operators shipped with the runtime.

mod add;
mod box_decode;
mod concat;
mod one_hot;
mod postprocess;
mod reshape;
mod sigmoid;
mod strided_slice;

use crate::error::OpResult;
use crate::graph::GraphContext;
use crate::kernel::{BindRequest, BoundOperand, KernelParams};
use crate::node::Node;
use crate::tensor::TensorId;

use super::{OpKind, OpRegistryBuilder, OPERATOR_REGISTRARS};

pub use add::Add;
pub use box_decode::{BoxDecode, BoxDecodeParams};
pub use concat::{Concat, ConcatParams, HighestDimension};
pub use one_hot::{OneHot, OneHotParams};
pub use postprocess::{Postprocess, PostprocessParams};
pub use reshape::{Reshape, ReshapeParams, SameElementCount};
pub use sigmoid::Sigmoid;
pub use strided_slice::{StridedSlice, StridedSliceParams};

pub const ADD: OpKind = OpKind::builtin("ADD");
pub const SIGMOID: OpKind = OpKind::builtin("SIGMOID");
pub const STRIDED_SLICE: OpKind = OpKind::builtin("STRIDED_SLICE");
pub const RESHAPE: OpKind = OpKind::builtin("RESHAPE");
pub const CONCAT: OpKind = OpKind::builtin("CONCAT");
pub const ONE_HOT: OpKind = OpKind::builtin("ONE_HOT");
pub const BOX_DECODE: OpKind = OpKind::internal("BOX_DECODE");
pub const POSTPROCESS: OpKind = OpKind::custom("POSTPROCESS");

/// Kernel that copies one tensor into another of the same element count.
pub const TENSOR_COPY: &str = "tensor_copy";

#[linkme::distributed_slice(OPERATOR_REGISTRARS)]
static REGISTER_BUILTIN_OPS: fn(&mut OpRegistryBuilder) = register_builtin_ops;

pub fn register_builtin_ops(builder: &mut OpRegistryBuilder) {
    builder
        .register(ADD, Add)
        .register(SIGMOID, Sigmoid)
        .register(STRIDED_SLICE, StridedSlice)
        .register(RESHAPE, Reshape)
        .register(CONCAT, Concat)
        .register(ONE_HOT, OneHot)
        .register(BOX_DECODE, BoxDecode)
        .register(POSTPROCESS, Postprocess);
}

fn required(slots: &[Option<TensorId>], side: &str) -> OpResult<Vec<TensorId>> {
    slots
        .iter()
        .enumerate()
        .map(|(idx, slot)| {
            slot.ok_or_else(|| crate::error::OpError::invalid(format!("{side} {idx} is not set")))
        })
        .collect()
}

pub(crate) fn input_ids(node: &Node) -> OpResult<Vec<TensorId>> {
    required(node.inputs(), "input")
}

pub(crate) fn output_ids(node: &Node) -> OpResult<Vec<TensorId>> {
    required(node.outputs(), "output")
}

pub(crate) fn operands(cx: &GraphContext, ids: &[TensorId]) -> OpResult<Vec<BoundOperand>> {
    ids.iter()
        .map(|&id| cx.operand(id).map_err(Into::into))
        .collect()
}

/// Binds `kernel` over every input and output of `node` as they are.
pub(crate) fn bind_io(
    cx: &mut GraphContext,
    node: &mut Node,
    kernel: &str,
    params: &KernelParams,
) -> OpResult<()> {
    let inputs = operands(cx, &input_ids(node)?)?;
    let outputs = operands(cx, &output_ids(node)?)?;
    let request = BindRequest {
        name: kernel,
        inputs: &inputs,
        outputs: &outputs,
        params,
    };
    cx.bind_kernel(node, &request)
}

/// Copies `input` into `output` through the copy kernel.
pub(crate) fn bind_copy(
    cx: &mut GraphContext,
    node: &mut Node,
    input: TensorId,
    output: TensorId,
) -> OpResult<()> {
    let inputs = [cx.operand(input)?];
    let outputs = [cx.operand(output)?];
    let params = KernelParams::new();
    let request = BindRequest {
        name: TENSOR_COPY,
        inputs: &inputs,
        outputs: &outputs,
        params: &params,
    };
    cx.bind_kernel(node, &request)
}

/// Sets the output shape to `shape`, or checks it against an already declared one.
pub(crate) fn resolve_output(
    cx: &mut GraphContext,
    output: TensorId,
    shape: crate::tensor::Shape,
) -> OpResult<()> {
    match cx.tensor(output)?.shape() {
        Some(declared) if *declared != shape => Err(crate::error::OpError::invalid(format!(
            "output {output} is declared as {declared} but resolves to {shape}"
        ))),
        Some(_) => Ok(()),
        None => Ok(cx.set_shape(output, shape)?),
    }
}
